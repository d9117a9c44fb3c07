//! Multiplexed readiness wait over raw descriptors.
//!
//! Uses `libc::poll` directly, like the rest of the crate's descriptor
//! handling, so readiness is checked against the kernel fd with no
//! userspace buffering in between.

use std::io;
use std::os::unix::io::RawFd;

use super::deadline::Deadline;
use crate::error::TransportError;

/// Descriptors reported ready by one [`wait_ready`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Readiness {
    /// Descriptors with data to read.
    pub readable: Vec<RawFd>,
    /// Descriptors that can accept a write.
    pub writable: Vec<RawFd>,
    /// Descriptors in an exceptional state (priority data, error, hangup).
    pub exceptional: Vec<RawFd>,
}

impl Readiness {
    /// Whether nothing was reported ready.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty() && self.exceptional.is_empty()
    }
}

const EXCEPTIONAL: libc::c_short = libc::POLLPRI | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;

/// Wait until any descriptor in `read_set` is readable, any in `write_set`
/// is writable, or any of them reports an exceptional condition.
///
/// Fails with [`TransportError::IoTimeout`] if `deadline` passes with
/// nothing ready. An interrupted wait is resumed with the remaining time.
pub fn wait_ready(
    read_set: &[RawFd],
    write_set: &[RawFd],
    deadline: Deadline,
) -> Result<Readiness, TransportError> {
    let mut fds: Vec<libc::pollfd> = Vec::with_capacity(read_set.len() + write_set.len());
    for &fd in read_set {
        push_interest(&mut fds, fd, libc::POLLIN | libc::POLLPRI);
    }
    for &fd in write_set {
        push_interest(&mut fds, fd, libc::POLLOUT | libc::POLLPRI);
    }

    loop {
        for pfd in &mut fds {
            pfd.revents = 0;
        }

        // SAFETY: `fds` is a valid, exclusively borrowed array of `pollfd`
        // whose length is passed alongside it.
        let ready = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                deadline.poll_timeout_ms(),
            )
        };

        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                if deadline.is_expired() {
                    return Err(TransportError::IoTimeout);
                }
                continue;
            }
            return Err(TransportError::Io(err));
        }

        if ready == 0 {
            return Err(TransportError::IoTimeout);
        }

        let mut readiness = Readiness::default();
        for pfd in &fds {
            if pfd.revents & libc::POLLIN != 0 {
                readiness.readable.push(pfd.fd);
            }
            if pfd.revents & libc::POLLOUT != 0 {
                readiness.writable.push(pfd.fd);
            }
            if pfd.revents & EXCEPTIONAL != 0 {
                readiness.exceptional.push(pfd.fd);
            }
        }
        return Ok(readiness);
    }
}

/// Add `events` for `fd`, merging with an existing entry for the same fd.
fn push_interest(fds: &mut Vec<libc::pollfd>, fd: RawFd, events: libc::c_short) {
    if let Some(existing) = fds.iter_mut().find(|p| p.fd == fd) {
        existing.events |= events;
    } else {
        fds.push(libc::pollfd { fd, events, revents: 0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};

    #[test]
    fn test_times_out_when_nothing_ready() {
        let (a, _b) = UnixStream::pair().expect("socketpair");
        let start = Instant::now();
        let result = wait_ready(&[a.as_raw_fd()], &[], Deadline::after(Duration::from_millis(50)));
        assert!(matches!(result, Err(TransportError::IoTimeout)));
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_reports_readable() {
        let (a, mut b) = UnixStream::pair().expect("socketpair");
        b.write_all(b"x").expect("write");
        let readiness =
            wait_ready(&[a.as_raw_fd()], &[], Deadline::after(Duration::from_secs(1))).expect("ready");
        assert_eq!(readiness.readable, vec![a.as_raw_fd()]);
        assert!(readiness.writable.is_empty());
    }

    #[test]
    fn test_reports_writable() {
        let (a, _b) = UnixStream::pair().expect("socketpair");
        let readiness =
            wait_ready(&[], &[a.as_raw_fd()], Deadline::after(Duration::from_secs(1))).expect("ready");
        assert_eq!(readiness.writable, vec![a.as_raw_fd()]);
    }

    #[test]
    fn test_same_fd_in_both_sets_is_polled_once() {
        let (a, mut b) = UnixStream::pair().expect("socketpair");
        b.write_all(b"x").expect("write");
        let fd = a.as_raw_fd();
        let readiness = wait_ready(&[fd], &[fd], Deadline::Never).expect("ready");
        assert_eq!(readiness.readable, vec![fd]);
        assert_eq!(readiness.writable, vec![fd]);
    }

    #[test]
    fn test_peer_hangup_is_reported() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        drop(b);
        let readiness =
            wait_ready(&[a.as_raw_fd()], &[], Deadline::after(Duration::from_secs(1))).expect("ready");
        assert!(!readiness.is_empty());
    }
}
