//! Frame synchronization with the target's byte stream.
//!
//! After the device opens, the target is still sitting in its interactive
//! menu and printing text. The synchronizer sends a single wake byte that
//! selects the RPC server, then discards everything up to the frame marker.
//! The marker itself belongs to the RPC stream, so it is parked in a
//! [`SyncBuffer`] and handed to the first read.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::deadline::Deadline;
use super::ready::wait_ready;
use crate::constants::{CANCEL_POLL_INTERVAL, SYNC_HISTORY_LIMIT};
use crate::device::ChannelDescriptor;
use crate::error::{is_hangup, TransportError};

/// At most one block of bytes awaiting delivery to the next read.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncBuffer {
    pending: Option<Vec<u8>>,
}

impl SyncBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `block` for the next read, replacing anything not yet delivered.
    pub fn fill(&mut self, block: Vec<u8>) {
        self.pending = Some(block);
    }

    /// Take the pending block, leaving the buffer empty.
    pub fn take(&mut self) -> Option<Vec<u8>> {
        self.pending.take()
    }

    /// Whether a block is waiting.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop any pending block.
    pub fn clear(&mut self) {
        self.pending = None;
    }
}

/// Result of a successful synchronization pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Buffer holding the marker byte.
    pub buffer: SyncBuffer,
    /// Number of noise bytes discarded before the marker.
    pub discarded: usize,
}

/// Wakes the target and aligns the reader with the start of the RPC stream.
#[derive(Debug, Clone)]
pub struct FrameSynchronizer {
    wake_byte: u8,
    marker: u8,
    timeout: Duration,
    trace_io: bool,
    cancel: Option<Arc<AtomicBool>>,
}

impl FrameSynchronizer {
    /// Create a synchronizer for the given wake byte, marker and timeout.
    pub fn new(wake_byte: u8, marker: u8, timeout: Duration) -> Self {
        Self {
            wake_byte,
            marker,
            timeout,
            trace_io: false,
            cancel: None,
        }
    }

    /// Log every discarded byte at debug level.
    pub fn with_trace_io(mut self, trace_io: bool) -> Self {
        self.trace_io = trace_io;
        self
    }

    /// Abandon the pass with [`TransportError::Cancelled`] once `cancel` is
    /// raised. Waits are sliced so the flag is seen within
    /// [`CANCEL_POLL_INTERVAL`].
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn slice(&self, deadline: Deadline) -> Deadline {
        match self.cancel {
            Some(_) => deadline.min(Deadline::after(CANCEL_POLL_INTERVAL)),
            None => deadline,
        }
    }

    /// Send the wake byte, then discard input until the marker is read.
    ///
    /// The whole pass, including the wait to write the wake byte, is bounded
    /// by the synchronizer's timeout (zero waits indefinitely). On expiry the
    /// error carries the most recent discarded bytes for diagnostics.
    pub fn prime_and_sync(&self, desc: &ChannelDescriptor) -> Result<SyncOutcome, TransportError> {
        let deadline = Deadline::from_timeout(Some(self.timeout));
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(desc);

        self.send_wake_byte(desc, deadline)?;

        let mut history: VecDeque<u8> = VecDeque::new();
        let mut discarded = 0usize;
        let mut byte = [0u8; 1];

        loop {
            if self.is_cancelled() {
                log::info!("Synchronization abandoned: shutdown requested");
                return Err(TransportError::Cancelled);
            }
            match wait_ready(&[fd], &[], self.slice(deadline)) {
                Ok(_) => {}
                Err(TransportError::IoTimeout) if !deadline.is_expired() => continue,
                Err(TransportError::IoTimeout) => {
                    let discarded_bytes: Vec<u8> = history.into_iter().collect();
                    log::warn!(
                        "RPC start byte 0x{:02x} not seen within {:?}; last discarded: {}",
                        self.marker,
                        self.timeout,
                        hex(&discarded_bytes)
                    );
                    return Err(TransportError::SyncTimeout {
                        marker: self.marker,
                        discarded: discarded_bytes,
                    });
                }
                Err(e) => return Err(e),
            }

            match desc.read_some(&mut byte) {
                Ok(0) => {
                    log::debug!("End of stream during sync");
                    return Err(TransportError::ChannelClosed);
                }
                Ok(_) if byte[0] == self.marker => {
                    log::debug!(
                        "Found RPC start byte 0x{:02x} after discarding {discarded} bytes",
                        self.marker
                    );
                    if self.trace_io && !history.is_empty() {
                        let noise: Vec<u8> = history.into_iter().collect();
                        log::debug!("Discarded before marker: {}", hex(&noise));
                    }
                    let mut buffer = SyncBuffer::new();
                    buffer.fill(vec![byte[0]]);
                    return Ok(SyncOutcome { buffer, discarded });
                }
                Ok(_) => {
                    discarded += 1;
                    if history.len() == SYNC_HISTORY_LIMIT {
                        history.pop_front();
                    }
                    history.push_back(byte[0]);
                }
                Err(e) if is_retryable(&e) => {}
                Err(e) if is_hangup(&e) => {
                    log::debug!("Link hung up during sync: {e}");
                    return Err(TransportError::ChannelClosed);
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    fn send_wake_byte(&self, desc: &ChannelDescriptor, deadline: Deadline) -> Result<(), TransportError> {
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(desc);
        loop {
            wait_ready(&[], &[fd], deadline)?;
            match desc.write_some(&[self.wake_byte]) {
                Ok(1) => {
                    log::debug!("Sent wake byte 0x{:02x}", self.wake_byte);
                    return Ok(());
                }
                Ok(_) => return Err(TransportError::ChannelClosed),
                Err(e) if is_retryable(&e) => {}
                Err(e) if is_hangup(&e) => return Err(TransportError::ChannelClosed),
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }
}

/// Errors that mean "nothing happened, try again".
pub(crate) fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Compact hex rendering for log lines.
pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::set_non_blocking;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    /// Non-blocking descriptor over one end of a socket pair; returns the peer.
    fn linked_descriptor() -> (ChannelDescriptor, UnixStream) {
        let (ours, theirs) = UnixStream::pair().expect("socketpair");
        let mut desc = ChannelDescriptor::from_file(File::from(OwnedFd::from(ours)), "<socketpair>");
        set_non_blocking(&mut desc).expect("non-blocking");
        (desc, theirs)
    }

    #[test]
    fn test_sync_buffer_delivers_once() {
        let mut buf = SyncBuffer::new();
        assert!(!buf.is_pending());
        buf.fill(vec![0xFE]);
        assert!(buf.is_pending());
        assert_eq!(buf.take(), Some(vec![0xFE]));
        assert_eq!(buf.take(), None);
    }

    #[test]
    fn test_discards_noise_and_keeps_marker() {
        let (desc, mut peer) = linked_descriptor();
        peer.write_all(&[0x01, 0x02, 0xFE, b'h']).expect("seed");

        let sync = FrameSynchronizer::new(0x33, 0xFE, Duration::from_secs(2));
        let mut outcome = sync.prime_and_sync(&desc).expect("sync");

        assert_eq!(outcome.discarded, 2);
        assert_eq!(outcome.buffer.take(), Some(vec![0xFE]));

        let mut wake = [0u8; 1];
        peer.read_exact(&mut wake).expect("wake byte");
        assert_eq!(wake[0], 0x33);

        // Bytes after the marker stay unread on the link.
        let mut rest = [0u8; 1];
        assert_eq!(desc.read_some(&mut rest).expect("rest"), 1);
        assert_eq!(rest[0], b'h');
    }

    #[test]
    fn test_times_out_with_history() {
        let (desc, mut peer) = linked_descriptor();
        peer.write_all(b"menu> ").expect("seed");

        let sync = FrameSynchronizer::new(0x33, 0xFE, Duration::from_millis(150));
        let err = sync.prime_and_sync(&desc).expect_err("no marker");

        match err {
            TransportError::SyncTimeout { marker, discarded } => {
                assert_eq!(marker, 0xFE);
                assert_eq!(discarded, b"menu> ".to_vec());
            }
            other => panic!("expected SyncTimeout, got {other:?}"),
        }
    }

    #[test]
    fn test_history_is_capped() {
        let (desc, mut peer) = linked_descriptor();
        let noise = vec![b'.'; SYNC_HISTORY_LIMIT + 100];
        let writer = std::thread::spawn(move || {
            peer.write_all(&noise).expect("noise");
            peer
        });

        let sync = FrameSynchronizer::new(0x33, 0xFE, Duration::from_millis(500));
        let err = sync.prime_and_sync(&desc).expect_err("no marker");
        let _peer = writer.join().expect("writer");

        match err {
            TransportError::SyncTimeout { discarded, .. } => {
                assert_eq!(discarded.len(), SYNC_HISTORY_LIMIT);
            }
            other => panic!("expected SyncTimeout, got {other:?}"),
        }
    }

    #[test]
    fn test_peer_gone_is_channel_closed() {
        let (desc, peer) = linked_descriptor();
        drop(peer);

        let sync = FrameSynchronizer::new(0x33, 0xFE, Duration::from_secs(2));
        let err = sync.prime_and_sync(&desc).expect_err("closed");
        assert!(err.is_closed(), "got {err:?}");
    }

    #[test]
    fn test_shutdown_request_abandons_sync() {
        let (desc, _peer) = linked_descriptor();
        let cancel = Arc::new(AtomicBool::new(false));
        let raiser = {
            let cancel = Arc::clone(&cancel);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                cancel.store(true, Ordering::Relaxed);
            })
        };

        let sync = FrameSynchronizer::new(0x33, 0xFE, Duration::ZERO).with_cancel(cancel);
        let start = std::time::Instant::now();
        let err = sync.prime_and_sync(&desc).expect_err("cancelled");

        assert!(err.is_cancelled(), "got {err:?}");
        assert!(start.elapsed() < Duration::from_secs(2));
        raiser.join().expect("raiser");
    }

    #[test]
    fn test_sliced_wait_still_honours_full_timeout() {
        let (desc, _peer) = linked_descriptor();
        let sync = FrameSynchronizer::new(0x33, 0xFE, Duration::from_millis(200))
            .with_cancel(Arc::new(AtomicBool::new(false)));

        let start = std::time::Instant::now();
        let err = sync.prime_and_sync(&desc).expect_err("no marker");

        assert!(matches!(err, TransportError::SyncTimeout { .. }), "got {err:?}");
        assert!(start.elapsed() >= Duration::from_millis(190));
    }

    #[test]
    fn test_hex_rendering() {
        assert_eq!(hex(&[0x01, 0xfe, 0x33]), "01 fe 33");
        assert_eq!(hex(&[]), "");
    }
}
