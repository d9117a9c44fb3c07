//! Error taxonomy for the transport bridge.
//!
//! Every failure that crosses the transport API is a [`TransportError`].
//! Timeouts and closures are always surfaced as typed variants so callers
//! can decide between retrying, reopening, or abandoning the session.
//!
//! Only [`TransportError::Configuration`] is fatal: it means the host
//! refused to put the device into non-blocking mode, and proceeding would
//! leave reads and writes with ambiguous blocking semantics.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur while opening or using the transport.
#[derive(Debug)]
pub enum TransportError {
    /// The simulator executable could not be spawned.
    Spawn {
        /// Rendered command line that failed.
        command: String,
        /// Underlying OS error.
        source: io::Error,
    },
    /// The device node did not appear before the deadline.
    DeviceNotFound {
        /// Path that was polled.
        path: PathBuf,
        /// How long the bridge waited.
        waited: Duration,
    },
    /// The device node exists but could not be opened.
    Open {
        /// Device path.
        path: PathBuf,
        /// Underlying OS error.
        source: io::Error,
    },
    /// Terminal attributes could not be read or applied.
    RawMode {
        /// Device path.
        path: PathBuf,
        /// Underlying OS error.
        source: io::Error,
    },
    /// Non-blocking mode could not be applied or verified. Fatal.
    Configuration(String),
    /// The frame marker was not seen within the sync timeout.
    SyncTimeout {
        /// Marker byte that was expected.
        marker: u8,
        /// Most recent bytes discarded while waiting.
        discarded: Vec<u8>,
    },
    /// Nothing became ready before the deadline.
    IoTimeout,
    /// The channel is closed, or the remote end went away.
    ChannelClosed,
    /// `open` or `attach` was called on a channel that is already in use.
    AlreadyOpen,
    /// A shutdown request arrived while the channel was being opened.
    Cancelled,
    /// Unexpected I/O failure that is neither a timeout nor a closure.
    Io(io::Error),
}

impl TransportError {
    /// Returns `true` for errors the calling process must not continue past.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns `true` for deadline expirations of any phase.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::IoTimeout | Self::SyncTimeout { .. } | Self::DeviceNotFound { .. }
        )
    }

    /// Returns `true` if a shutdown request interrupted the operation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if the channel is (now) closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ChannelClosed)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn { command, source } => {
                write!(f, "Failed to spawn simulator `{command}`: {source}")
            }
            Self::DeviceNotFound { path, waited } => write!(
                f,
                "Device not created: {} (waited {:.1}s)",
                path.display(),
                waited.as_secs_f64()
            ),
            Self::Open { path, source } => {
                write!(f, "Failed to open device {}: {source}", path.display())
            }
            Self::RawMode { path, source } => write!(
                f,
                "Failed to put device {} into raw mode: {source}",
                path.display()
            ),
            Self::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            Self::SyncTimeout { marker, discarded } => write!(
                f,
                "RPC start byte 0x{marker:02x} not found ({} bytes discarded)",
                discarded.len()
            ),
            Self::IoTimeout => write!(f, "I/O timed out"),
            Self::ChannelClosed => write!(f, "Transport channel closed"),
            Self::AlreadyOpen => write!(f, "Transport channel already open"),
            Self::Cancelled => write!(f, "Transport open cancelled by shutdown request"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn { source, .. } | Self::Open { source, .. } | Self::RawMode { source, .. } => {
                Some(source)
            }
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Returns `true` for OS errors that mean the other end of the link is gone.
///
/// A PTY slave whose master closed reports `EIO` on Linux rather than EOF,
/// so it is treated the same as `EPIPE`.
pub(crate) fn is_hangup(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::BrokenPipe
        || err.kind() == io::ErrorKind::ConnectionReset
        || err.raw_os_error() == Some(libc::EIO)
}
