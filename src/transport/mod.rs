//! Byte transport to the simulated target.
//!
//! [`TransportChannel`] owns the whole session: the supervised simulator,
//! the opened device, and the marker byte found during synchronization.
//! Host tooling sees a plain read/write/close surface with per-call
//! timeouts; everything else is internal.
//!
//! # Architecture
//!
//! ```text
//! open(command)
//!   ├── remove_device_node          stale link from a previous run
//!   ├── ProcessSupervisor::start    new session, output → log file
//!   ├── wait_for_device             poll until the PTY link appears
//!   ├── open_raw → configure_raw → set_non_blocking
//!   └── attach → FrameSynchronizer  wake byte, skip to marker
//!
//! read / write                      wait_ready + one syscall, retry partial
//! close / Drop                      descriptor → process group → device node
//! ```
//!
//! # State Machine
//!
//! ```text
//! Unopened ──open/attach──▶ Syncing ──marker──▶ Open
//!     │                        │                 │
//!     └────────────────────────┴─────────────────┴──▶ Closed (terminal)
//! ```
//!
//! A shutdown flag set with [`TransportChannel::with_shutdown_flag`] is
//! checked between open phases and while waiting for the device and the
//! marker; raising it makes `open` fail with
//! [`TransportError::Cancelled`] after a full teardown.
//!
//! Timeouts never change state. End-of-stream, a broken pipe, a failed
//! open, or an explicit close move to `Closed`, after which every call
//! fails with [`TransportError::ChannelClosed`].

// Rust guideline compliant 2026-02

pub mod deadline;
pub mod ready;
pub mod sync;

use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scopeguard::ScopeGuard;
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEVICE_FILE_NAME, DEVICE_WAIT_TIMEOUT, FRAME_MARKER, MAX_READ_CHUNK, STOP_GRACE_PERIOD,
    SYNC_TIMEOUT, WAKE_BYTE, WRITE_PACING_DELAY,
};
use crate::device::{
    configure_raw, open_raw, remove_device_node, set_non_blocking, wait_for_device_cancellable,
    ChannelDescriptor,
};
use crate::error::{is_hangup, TransportError};
use crate::process::{ProcessSupervisor, SimulatorHandle};
use crate::simulator::SimulatorCommand;

use self::deadline::Deadline;
use self::ready::wait_ready;
use self::sync::{hex, is_retryable, FrameSynchronizer, SyncBuffer};

/// Bytes of simulator output logged when `open` fails.
const OUTPUT_TAIL_BYTES: usize = 2048;

/// Lifecycle state of a [`TransportChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, nothing started yet.
    Unopened,
    /// Device opened; looking for the frame marker.
    Syncing,
    /// Synchronized and ready for reads and writes.
    Open,
    /// Torn down. Terminal.
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unopened => "unopened",
            Self::Syncing => "syncing",
            Self::Open => "open",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Session timeouts handed to the host RPC layer once the transport opens.
///
/// Zero disables the corresponding timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTimeouts {
    /// Delay between session-start retries, in milliseconds.
    pub session_start_retry_ms: u64,
    /// Bound on starting a session, in milliseconds.
    pub session_start_ms: u64,
    /// Bound on an established session going quiet, in milliseconds.
    pub session_established_ms: u64,
}

/// Everything a channel needs besides the simulator command itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSettings {
    /// Where the simulator creates the PTY link.
    pub device_path: PathBuf,
    /// How long to wait for the device node to appear.
    pub device_timeout: Duration,
    /// Byte sent once to wake the target.
    pub wake_byte: u8,
    /// First byte of the RPC stream.
    pub frame_marker: u8,
    /// Cumulative bound on synchronization.
    pub sync_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    /// Delay between partial-write retries.
    pub write_pacing: Duration,
    /// Simulator stdout/stderr sink; `None` discards output.
    pub output_log: Option<PathBuf>,
    /// Returned from [`TransportChannel::open`].
    pub session_timeouts: SessionTimeouts,
    /// Log every byte read, written and discarded at debug level.
    pub trace_io: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(DEVICE_FILE_NAME),
            device_timeout: DEVICE_WAIT_TIMEOUT,
            wake_byte: WAKE_BYTE,
            frame_marker: FRAME_MARKER,
            sync_timeout: SYNC_TIMEOUT,
            stop_grace: STOP_GRACE_PERIOD,
            write_pacing: WRITE_PACING_DELAY,
            output_log: None,
            session_timeouts: SessionTimeouts::default(),
            trace_io: false,
        }
    }
}

/// A synchronized byte channel to the simulated target.
///
/// Dropping the channel closes it.
#[derive(Debug)]
pub struct TransportChannel {
    settings: ChannelSettings,
    state: ChannelState,
    supervisor: ProcessSupervisor,
    descriptor: Option<ChannelDescriptor>,
    sync_buffer: SyncBuffer,
    /// Device node created by the simulator for this channel; removed on close.
    device_node: Option<PathBuf>,
    shutdown: Arc<AtomicBool>,
}

impl TransportChannel {
    /// An unopened channel with its own process supervisor.
    pub fn new(settings: ChannelSettings) -> Self {
        let supervisor = ProcessSupervisor::new(settings.stop_grace);
        Self::with_supervisor(settings, supervisor)
    }

    /// An unopened channel that tears down `supervisor` on close.
    ///
    /// Pairs with [`attach`](Self::attach) when the process was started (or
    /// adopted) elsewhere.
    pub fn with_supervisor(settings: ChannelSettings, supervisor: ProcessSupervisor) -> Self {
        Self {
            settings,
            state: ChannelState::Unopened,
            supervisor,
            descriptor: None,
            sync_buffer: SyncBuffer::new(),
            device_node: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Abandon `open` or `attach` once `flag` is raised.
    ///
    /// Typically the flag a signal handler sets. Reads and writes on an
    /// open channel are not affected.
    #[must_use]
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    fn check_shutdown(&self) -> Result<(), TransportError> {
        if self.shutdown.load(Ordering::Relaxed) {
            log::info!("Shutdown requested while opening the transport");
            return Err(TransportError::Cancelled);
        }
        Ok(())
    }

    /// Start the simulator, open its UART, and synchronize.
    ///
    /// On success the channel is [`ChannelState::Open`] and the configured
    /// session timeouts are returned. On any failure everything created so
    /// far is torn down and the channel is [`ChannelState::Closed`].
    pub fn open(&mut self, command: &SimulatorCommand) -> Result<SessionTimeouts, TransportError> {
        self.begin()?;

        let mut channel = scopeguard::guard(self, |channel: &mut Self| {
            if let Some(tail) = channel.supervisor.output_tail(OUTPUT_TAIL_BYTES) {
                if !tail.trim().is_empty() {
                    log::warn!("Simulator output before failure:\n{}", tail.trim_end());
                }
            }
            let log_path = channel.supervisor.handle().and_then(SimulatorHandle::output_log);
            if let Some(log_path) = log_path {
                log::warn!("Full simulator output: {}", log_path.display());
            }
            channel.close();
        });

        channel.check_shutdown()?;
        let device_path = channel.settings.device_path.clone();
        remove_device_node(&device_path).map_err(TransportError::Io)?;

        let output_log = channel.settings.output_log.clone();
        channel.supervisor.start(command, output_log.as_deref())?;
        channel.device_node = Some(device_path.clone());

        wait_for_device_cancellable(
            &device_path,
            Deadline::from_timeout(Some(channel.settings.device_timeout)),
            &channel.shutdown,
        )?;
        let mut desc = open_raw(&device_path)?;
        configure_raw(&mut desc)?;
        set_non_blocking(&mut desc)?;
        channel.check_shutdown()?;

        channel.synchronize(desc)?;

        let channel = ScopeGuard::into_inner(channel);
        log::info!("Transport open on {}", device_path.display());
        Ok(channel.settings.session_timeouts)
    }

    /// Synchronize over a link the caller opened.
    ///
    /// The descriptor is switched to non-blocking mode if it is not already.
    /// Any process adopted by this channel's supervisor is stopped on close.
    /// On failure the channel is [`ChannelState::Closed`].
    pub fn attach(&mut self, mut desc: ChannelDescriptor) -> Result<(), TransportError> {
        self.begin()?;

        let prepared = if desc.is_non_blocking() {
            Ok(())
        } else {
            set_non_blocking(&mut desc)
        };
        let result = prepared.and_then(|()| self.synchronize(desc));

        if result.is_err() {
            self.close();
        }
        result
    }

    fn begin(&mut self) -> Result<(), TransportError> {
        match self.state {
            ChannelState::Unopened => {
                self.state = ChannelState::Syncing;
                Ok(())
            }
            ChannelState::Closed => Err(TransportError::ChannelClosed),
            ChannelState::Syncing | ChannelState::Open => Err(TransportError::AlreadyOpen),
        }
    }

    fn synchronize(&mut self, desc: ChannelDescriptor) -> Result<(), TransportError> {
        let synchronizer = FrameSynchronizer::new(
            self.settings.wake_byte,
            self.settings.frame_marker,
            self.settings.sync_timeout,
        )
        .with_trace_io(self.settings.trace_io)
        .with_cancel(Arc::clone(&self.shutdown));

        let outcome = synchronizer.prime_and_sync(&desc)?;
        log::info!(
            "Synchronized with target on {} ({} bytes skipped)",
            desc.path().display(),
            outcome.discarded
        );

        self.sync_buffer = outcome.buffer;
        self.descriptor = Some(desc);
        self.state = ChannelState::Open;
        Ok(())
    }

    /// Read up to `max_bytes`.
    ///
    /// The first read after synchronization returns the frame marker without
    /// touching the device. Later reads wait up to `timeout` (absent or zero
    /// waits indefinitely) and return whatever one read yields, which may be
    /// fewer than `max_bytes`. One read never returns more than
    /// [`MAX_READ_CHUNK`] bytes.
    ///
    /// # Errors
    ///
    /// - [`TransportError::IoTimeout`] if nothing arrives in time; the
    ///   channel stays open.
    /// - [`TransportError::ChannelClosed`] if the channel is closed or the
    ///   remote end went away, in which case the channel is torn down.
    pub fn read(&mut self, max_bytes: usize, timeout: Option<Duration>) -> Result<Vec<u8>, TransportError> {
        self.descriptor()?;
        if max_bytes == 0 {
            return Ok(Vec::new());
        }
        if let Some(block) = self.sync_buffer.take() {
            return Ok(block);
        }

        let deadline = Deadline::from_timeout(timeout);
        let mut buf = vec![0u8; max_bytes.min(MAX_READ_CHUNK)];

        loop {
            let result = {
                let desc = self.descriptor()?;
                wait_ready(&[desc.as_raw_fd()], &[], deadline)?;
                desc.read_some(&mut buf)
            };

            match result {
                Ok(0) => {
                    log::info!("Target closed the link (end of stream)");
                    self.close();
                    return Err(TransportError::ChannelClosed);
                }
                Ok(n) => {
                    buf.truncate(n);
                    if self.settings.trace_io {
                        log::debug!("read {n}: {}", hex(&buf));
                    }
                    return Ok(buf);
                }
                Err(e) if is_retryable(&e) => {}
                Err(e) if is_hangup(&e) => {
                    log::info!("Target link hung up on read: {e}");
                    self.close();
                    return Err(TransportError::ChannelClosed);
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    /// Write all of `data`.
    ///
    /// Waits for writability, writes what the link accepts, and retries the
    /// remainder after a short pacing delay. The whole call shares one
    /// `timeout` (absent or zero waits indefinitely).
    ///
    /// # Errors
    ///
    /// - [`TransportError::IoTimeout`] if the link stops accepting data in
    ///   time. A prefix of `data` may already have been sent; the channel
    ///   stays open.
    /// - [`TransportError::ChannelClosed`] if the channel is closed or the
    ///   remote end went away, in which case the channel is torn down.
    pub fn write(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<(), TransportError> {
        self.descriptor()?;
        let deadline = Deadline::from_timeout(timeout);
        let mut sent = 0usize;
        let mut attempts = 0u32;

        while sent < data.len() {
            if attempts > 0 {
                let pause = deadline
                    .remaining()
                    .map_or(self.settings.write_pacing, |left| left.min(self.settings.write_pacing));
                std::thread::sleep(pause);
            }
            attempts += 1;

            let result = {
                let desc = self.descriptor()?;
                wait_ready(&[], &[desc.as_raw_fd()], deadline)?;
                desc.write_some(&data[sent..])
            };

            match result {
                Ok(0) => {
                    log::info!("Target link accepted no bytes; treating as closed");
                    self.close();
                    return Err(TransportError::ChannelClosed);
                }
                Ok(n) => {
                    if self.settings.trace_io {
                        log::debug!("wrote {n}: {}", hex(&data[sent..sent + n]));
                    }
                    sent += n;
                }
                Err(e) if is_retryable(&e) => {}
                Err(e) if is_hangup(&e) => {
                    log::info!("Target link hung up on write: {e}");
                    self.close();
                    return Err(TransportError::ChannelClosed);
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }

        if attempts > 1 {
            log::debug!("Wrote {} bytes in {attempts} attempts", data.len());
        }
        Ok(())
    }

    /// Tear the session down. Idempotent and infallible.
    ///
    /// Closes the device, stops the simulator's process group, and removes
    /// the device node this channel created.
    pub fn close(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        log::debug!("Closing transport (state: {})", self.state);
        self.state = ChannelState::Closed;
        self.sync_buffer.clear();

        // Dropping the File closes the fd; close(2) errors are not reported.
        drop(self.descriptor.take());

        self.supervisor.stop();

        if let Some(node) = self.device_node.take() {
            if let Err(e) = remove_device_node(&node) {
                log::warn!("Failed to remove device node {}: {e}", node.display());
            }
        }
    }

    fn descriptor(&self) -> Result<&ChannelDescriptor, TransportError> {
        match (self.state, self.descriptor.as_ref()) {
            (ChannelState::Open, Some(desc)) => Ok(desc),
            _ => Err(TransportError::ChannelClosed),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Whether reads and writes are possible.
    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    /// Path of the opened device, while open.
    pub fn device_path(&self) -> Option<&Path> {
        self.descriptor.as_ref().map(ChannelDescriptor::path)
    }

    /// Pid of the supervised simulator, while it is running.
    pub fn simulator_pid(&self) -> Option<u32> {
        self.supervisor.handle().map(SimulatorHandle::pid)
    }

    /// Whether a synchronized block is waiting for the next read.
    ///
    /// Callers multiplexing [`raw_fd`](Self::raw_fd) with other descriptors
    /// must read once without waiting while this is true.
    pub fn has_pending(&self) -> bool {
        self.sync_buffer.is_pending()
    }

    /// Raw device descriptor for readiness multiplexing, while open.
    ///
    /// Only for polling; all I/O must go through [`read`](Self::read) and
    /// [`write`](Self::write).
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.descriptor().ok().map(AsRawFd::as_raw_fd)
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.close();
    }
}
