// PTY-based integration tests for the transport
//
// A real PTY pair stands in for the simulator's virtual UART: the test
// thread plays the target on the master side, and the bridge opens the
// slave through a device-node symlink, the same way the simulator exposes
// it. The "simulator" process itself is a plain `sleep`.

use portable_pty::{native_pty_system, PtyPair, PtySize};
use simbridge::device::{configure_raw, open_raw, set_non_blocking};
use simbridge::{
    ChannelSettings, ChannelState, SimulatorCommand, TransportChannel, TransportError,
};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const WAKE: u8 = 0x33;
const MARKER: u8 = 0xFE;

fn open_pty() -> (PtyPair, PathBuf) {
    let pair = native_pty_system()
        .openpty(PtySize::default())
        .expect("openpty");
    let slave_path = pair.master.tty_name().expect("slave tty name");
    (pair, slave_path)
}

/// Blocking read of exactly one byte from a raw fd.
fn read_byte(fd: RawFd) -> u8 {
    let mut byte = [0u8; 1];
    loop {
        // SAFETY: reads at most one byte into a live one-byte buffer.
        let n = unsafe { libc::read(fd, byte.as_mut_ptr().cast(), 1) };
        if n == 1 {
            return byte[0];
        }
        let err = std::io::Error::last_os_error();
        assert_eq!(err.kind(), std::io::ErrorKind::Interrupted, "read failed: {err}");
    }
}

fn write_all(fd: RawFd, mut data: &[u8]) {
    while !data.is_empty() {
        // SAFETY: writes from a live slice of exactly `data.len()` bytes.
        let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            assert_eq!(err.kind(), std::io::ErrorKind::Interrupted, "write failed: {err}");
            continue;
        }
        data = &data[n as usize..];
    }
}

/// Target side of the link.
///
/// Waits for the wake byte, replies with `reply`, then holds the PTY open
/// until `release` fires. Returns the wake byte it saw.
fn spawn_target(
    pair: PtyPair,
    reply: Vec<u8>,
) -> (mpsc::Sender<()>, thread::JoinHandle<u8>) {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
        let fd = pair.master.as_raw_fd().expect("master fd");
        let wake = read_byte(fd);
        write_all(fd, &reply);
        let _ = release_rx.recv();
        drop(pair);
        wake
    });
    (release_tx, handle)
}

/// Create `link` → `target` after `delay`, like the simulator does once it
/// has booted.
fn link_later(target: PathBuf, link: PathBuf, delay: Duration) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        thread::sleep(delay);
        std::os::unix::fs::symlink(&target, &link).expect("create device link");
    })
}

fn settings_for(device_path: &Path) -> ChannelSettings {
    ChannelSettings {
        device_path: device_path.to_path_buf(),
        device_timeout: Duration::from_secs(5),
        sync_timeout: Duration::from_secs(5),
        stop_grace: Duration::from_millis(50),
        write_pacing: Duration::from_millis(1),
        ..ChannelSettings::default()
    }
}

fn process_exists(pid: u32) -> bool {
    // SAFETY: signal 0 only checks that the process exists.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[test]
fn test_open_syncs_and_delivers_marker_then_payload() {
    let project = tempfile::tempdir().expect("tempdir");
    let device = project.path().join("uart.pty");
    let (pair, slave) = open_pty();

    let (release, target) = spawn_target(pair, vec![0x01, 0x02, MARKER, b'h', b'e', b'l', b'l', b'o']);
    let linker = link_later(slave, device.clone(), Duration::from_millis(150));

    let mut channel = TransportChannel::new(settings_for(&device));
    let command = SimulatorCommand::new("sleep", project.path()).arg("30");
    let timeouts = channel.open(&command).expect("open");
    linker.join().expect("linker");

    assert_eq!(timeouts, simbridge::SessionTimeouts::default());
    assert_eq!(channel.state(), ChannelState::Open);
    assert_eq!(channel.device_path(), Some(device.as_path()));
    let pid = channel.simulator_pid().expect("simulator running");

    let first = channel.read(5, Some(Duration::from_secs(2))).expect("first read");
    assert_eq!(first, vec![MARKER]);

    let mut payload = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while payload.len() < 5 && Instant::now() < deadline {
        payload.extend(channel.read(5 - payload.len(), Some(Duration::from_secs(2))).expect("payload"));
    }
    assert_eq!(payload, b"hello".to_vec());

    channel.close();
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(device.symlink_metadata().is_err(), "device node removed on close");
    assert!(!process_exists(pid), "simulator stopped on close");

    release.send(()).expect("release target");
    assert_eq!(target.join().expect("target"), WAKE);
}

#[test]
fn test_write_reaches_target() {
    let project = tempfile::tempdir().expect("tempdir");
    let device = project.path().join("uart.pty");
    let (pair, slave) = open_pty();
    let master_fd = pair.master.as_raw_fd().expect("master fd");

    let (release, target) = spawn_target(pair, vec![MARKER]);
    let linker = link_later(slave, device.clone(), Duration::from_millis(50));

    let mut channel = TransportChannel::new(settings_for(&device));
    channel
        .open(&SimulatorCommand::new("sleep", project.path()).arg("30"))
        .expect("open");
    linker.join().expect("linker");

    // Raw mode: no CR/NL translation on the way out.
    channel.write(b"\x01\r\n\x7f", Some(Duration::from_secs(2))).expect("write");
    let echoed: Vec<u8> = (0..4).map(|_| read_byte(master_fd)).collect();
    assert_eq!(echoed, b"\x01\r\n\x7f".to_vec());

    channel.close();
    release.send(()).expect("release target");
    target.join().expect("target");
}

#[test]
fn test_target_hangup_closes_channel() {
    let project = tempfile::tempdir().expect("tempdir");
    let device = project.path().join("uart.pty");
    let (pair, slave) = open_pty();

    let (release, target) = spawn_target(pair, vec![MARKER]);
    let linker = link_later(slave, device.clone(), Duration::from_millis(50));

    let mut channel = TransportChannel::new(settings_for(&device));
    channel
        .open(&SimulatorCommand::new("sleep", project.path()).arg("30"))
        .expect("open");
    linker.join().expect("linker");
    assert_eq!(channel.read(1, None).expect("marker"), vec![MARKER]);

    release.send(()).expect("release target");
    target.join().expect("target");

    let err = channel
        .read(16, Some(Duration::from_secs(2)))
        .expect_err("hung up");
    assert!(matches!(err, TransportError::ChannelClosed), "got {err:?}");
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(channel
        .write(b"x", Some(Duration::from_millis(100)))
        .expect_err("closed")
        .is_closed());
}

#[test]
fn test_sync_timeout_on_silent_target() {
    let project = tempfile::tempdir().expect("tempdir");
    let device = project.path().join("uart.pty");
    let (pair, slave) = open_pty();

    let (release, target) = spawn_target(pair, b"1) hello\r\n2) mnist\r\n3) rpc\r\n".to_vec());
    let linker = link_later(slave, device.clone(), Duration::from_millis(50));

    let settings = ChannelSettings {
        sync_timeout: Duration::from_millis(300),
        ..settings_for(&device)
    };
    let mut channel = TransportChannel::new(settings);
    let err = channel
        .open(&SimulatorCommand::new("sleep", project.path()).arg("30"))
        .expect_err("no marker");
    linker.join().expect("linker");

    match err {
        TransportError::SyncTimeout { marker, discarded } => {
            assert_eq!(marker, MARKER);
            assert!(discarded.ends_with(b"3) rpc\r\n"), "discarded: {discarded:?}");
        }
        other => panic!("expected SyncTimeout, got {other:?}"),
    }
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(channel.simulator_pid().is_none());
    assert!(device.symlink_metadata().is_err());

    release.send(()).expect("release target");
    target.join().expect("target");
}

#[test]
fn test_configure_raw_on_real_pty() {
    let (pair, slave) = open_pty();
    let mut desc = open_raw(&slave).expect("open slave");

    configure_raw(&mut desc).expect("raw mode");
    set_non_blocking(&mut desc).expect("non-blocking");
    assert!(desc.is_raw());
    assert!(desc.is_non_blocking());

    // SAFETY: termios is plain data; all-zero is a valid value to overwrite.
    let mut attrs: libc::termios = unsafe { std::mem::zeroed() };
    // SAFETY: tcgetattr writes into `attrs` for a descriptor we own.
    assert_eq!(unsafe { libc::tcgetattr(desc.as_raw_fd(), &mut attrs) }, 0);
    assert_eq!(attrs.c_lflag & (libc::ECHO | libc::ICANON | libc::ISIG | libc::IEXTEN), 0);
    assert_eq!(attrs.c_oflag & libc::OPOST, 0);
    assert_eq!(attrs.c_iflag & (libc::IXON | libc::IXOFF | libc::ICRNL | libc::INLCR), 0);
    assert_eq!(attrs.c_cflag & libc::CSIZE, libc::CS8);
    assert_eq!(attrs.c_cc[libc::VMIN], 1);
    assert_eq!(attrs.c_cc[libc::VTIME], 0);

    // SAFETY: F_GETFL only reads the descriptor's status flags.
    let flags = unsafe { libc::fcntl(desc.as_raw_fd(), libc::F_GETFL) };
    assert_ne!(flags & libc::O_NONBLOCK, 0);

    drop(desc);
    drop(pair);
}
