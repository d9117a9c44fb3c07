//! Virtual UART device handling.
//!
//! The simulator creates the device node (a symlink to a PTY slave) some
//! time after it starts. This module waits for that node, opens it without
//! acquiring a controlling terminal, and configures it so bytes pass through
//! unmodified and reads never block.
//!
//! # Sequence
//!
//! ```text
//! wait_for_device(path, deadline)   poll every 50 ms
//!   → open_raw(path)                O_RDWR | O_NOCTTY | O_CLOEXEC
//!   → configure_raw(&mut desc)      termios, TCSANOW
//!   → set_non_blocking(&mut desc)   O_NONBLOCK, verified
//! ```

// Rust guideline compliant 2026-02

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::constants::DEVICE_POLL_INTERVAL;
use crate::error::TransportError;
use crate::transport::deadline::Deadline;

/// An opened device plus the modes applied to it.
///
/// Dropping the descriptor closes the underlying file.
#[derive(Debug)]
pub struct ChannelDescriptor {
    file: File,
    path: PathBuf,
    raw: bool,
    non_blocking: bool,
}

impl ChannelDescriptor {
    /// Wrap an already-open file without changing its modes.
    ///
    /// Useful for links the caller created itself (pipes, socket pairs,
    /// PTYs opened elsewhere).
    pub fn from_file(file: File, path: impl Into<PathBuf>) -> Self {
        Self {
            file,
            path: path.into(),
            raw: false,
            non_blocking: false,
        }
    }

    /// Path the descriptor was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether [`configure_raw`] has been applied.
    pub fn is_raw(&self) -> bool {
        self.raw
    }

    /// Whether [`set_non_blocking`] has been applied and verified.
    pub fn is_non_blocking(&self) -> bool {
        self.non_blocking
    }

    /// One `read(2)` of up to `buf.len()` bytes.
    pub(crate) fn read_some(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    /// One `write(2)` of as much of `data` as the device accepts.
    pub(crate) fn write_some(&self, data: &[u8]) -> io::Result<usize> {
        (&self.file).write(data)
    }
}

impl AsRawFd for ChannelDescriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Poll for `path` to exist until it appears or `deadline` passes.
///
/// Checks at a fixed [`DEVICE_POLL_INTERVAL`] and never sleeps past the
/// deadline. Fails with [`TransportError::DeviceNotFound`] on expiry.
pub fn wait_for_device(path: &Path, deadline: Deadline) -> Result<(), TransportError> {
    wait_for_device_cancellable(path, deadline, &AtomicBool::new(false))
}

/// [`wait_for_device`] that also gives up with [`TransportError::Cancelled`]
/// once `cancel` is raised. The flag is checked on every poll.
pub fn wait_for_device_cancellable(
    path: &Path,
    deadline: Deadline,
    cancel: &AtomicBool,
) -> Result<(), TransportError> {
    let start = Instant::now();
    log::debug!("Waiting for device node: {}", path.display());

    loop {
        if cancel.load(Ordering::Relaxed) {
            log::info!("Stopped waiting for {}: shutdown requested", path.display());
            return Err(TransportError::Cancelled);
        }
        if path.exists() {
            log::debug!(
                "Device node appeared after {} ms: {}",
                start.elapsed().as_millis(),
                path.display()
            );
            return Ok(());
        }

        let nap = match deadline.remaining() {
            Some(left) if left.is_zero() => {
                return Err(TransportError::DeviceNotFound {
                    path: path.to_path_buf(),
                    waited: start.elapsed(),
                });
            }
            Some(left) => left.min(DEVICE_POLL_INTERVAL),
            None => DEVICE_POLL_INTERVAL,
        };
        std::thread::sleep(nap);
    }
}

/// Open the device read/write without making it the controlling terminal.
pub fn open_raw(path: &Path) -> Result<ChannelDescriptor, TransportError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_CLOEXEC)
        .open(path)
        .map_err(|source| TransportError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    log::debug!("Opened device {} (fd {})", path.display(), file.as_raw_fd());
    Ok(ChannelDescriptor::from_file(file, path))
}

/// Put the device into raw mode, effective immediately.
///
/// Disables echo, canonical input, signal characters, extended input
/// processing, output post-processing, software flow control and CR/NL
/// translation on input; forces 8-bit characters; and makes reads
/// byte-granular (`VMIN = 1`, `VTIME = 0`).
pub fn configure_raw(desc: &mut ChannelDescriptor) -> Result<(), TransportError> {
    let fd = desc.as_raw_fd();
    let raw_mode_err = |desc: &ChannelDescriptor| TransportError::RawMode {
        path: desc.path.clone(),
        source: io::Error::last_os_error(),
    };

    // SAFETY: `termios` is a plain C struct; all-zero is a valid bit pattern
    // and tcgetattr overwrites it fully on success.
    let mut attrs: libc::termios = unsafe { std::mem::zeroed() };

    // SAFETY: `fd` is open for the lifetime of `desc` and `attrs` is a valid
    // exclusive pointer.
    if unsafe { libc::tcgetattr(fd, &mut attrs) } != 0 {
        return Err(raw_mode_err(desc));
    }

    apply_raw_flags(&mut attrs);

    // SAFETY: same fd as above; `attrs` was initialized by tcgetattr.
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &attrs) } != 0 {
        return Err(raw_mode_err(desc));
    }

    desc.raw = true;
    log::debug!("Device {} set to raw mode", desc.path.display());
    Ok(())
}

/// Raw-mode flag edits, separated from the syscalls so they can be checked
/// on a plain struct.
fn apply_raw_flags(attrs: &mut libc::termios) {
    attrs.c_lflag &= !(libc::ECHO | libc::ICANON | libc::ISIG | libc::IEXTEN);
    attrs.c_oflag &= !libc::OPOST;
    attrs.c_iflag &= !(libc::IXON | libc::IXOFF | libc::ICRNL | libc::INLCR);
    attrs.c_cflag &= !libc::CSIZE;
    attrs.c_cflag |= libc::CS8;
    attrs.c_cc[libc::VMIN] = 1;
    attrs.c_cc[libc::VTIME] = 0;
}

/// Switch the descriptor to non-blocking mode and verify it took effect.
///
/// A failure here is a [`TransportError::Configuration`], which is fatal:
/// continuing would mix blocking and non-blocking semantics on the link.
pub fn set_non_blocking(desc: &mut ChannelDescriptor) -> Result<(), TransportError> {
    let fd = desc.as_raw_fd();

    // SAFETY: F_GETFL/F_SETFL on a descriptor owned by `desc`.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(TransportError::Configuration(format!(
            "Cannot read flags of {}: {}",
            desc.path.display(),
            io::Error::last_os_error()
        )));
    }

    // SAFETY: see above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(TransportError::Configuration(format!(
            "Cannot set {} to non-blocking: {}",
            desc.path.display(),
            io::Error::last_os_error()
        )));
    }

    // SAFETY: see above.
    let applied = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if applied < 0 || applied & libc::O_NONBLOCK == 0 {
        return Err(TransportError::Configuration(format!(
            "Cannot set file descriptor {fd} ({}) to non-blocking",
            desc.path.display()
        )));
    }

    desc.non_blocking = true;
    Ok(())
}

/// Delete the device node if present. A missing node is not an error.
pub fn remove_device_node(path: &Path) -> io::Result<()> {
    // symlink_metadata: the node is a symlink whose target may already be gone.
    if path.symlink_metadata().is_err() {
        return Ok(());
    }
    match std::fs::remove_file(path) {
        Ok(()) => {
            log::debug!("Removed device node {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
