//! Absolute deadlines for bounded waits.
//!
//! A [`Deadline`] is computed once per operation so that every retry inside
//! that operation shares the same budget.

use std::time::{Duration, Instant};

/// Absolute expiry instant, or no deadline at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Expires at the given instant.
    At(Instant),
    /// Never expires; waits block indefinitely.
    Never,
}

impl Deadline {
    /// Deadline `timeout` from now.
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        // Instant + huge Duration panics on overflow; treat it as unbounded.
        Instant::now()
            .checked_add(timeout)
            .map_or(Self::Never, Self::At)
    }

    /// Deadline for a caller-supplied timeout.
    ///
    /// An absent or zero timeout means wait indefinitely.
    #[must_use]
    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(t) if !t.is_zero() => Self::after(t),
            _ => Self::Never,
        }
    }

    /// Time left before expiry, saturating at zero. `None` if unbounded.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Self::At(at) => Some(at.saturating_duration_since(Instant::now())),
            Self::Never => None,
        }
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        match self {
            Self::At(at) => Instant::now() >= *at,
            Self::Never => false,
        }
    }

    /// The earlier of this deadline and `other`.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        match (self, other) {
            (Self::At(a), Self::At(b)) => Self::At(a.min(b)),
            (Self::At(a), Self::Never) | (Self::Never, Self::At(a)) => Self::At(a),
            (Self::Never, Self::Never) => Self::Never,
        }
    }

    /// Timeout argument for `poll(2)`: milliseconds remaining, rounded up,
    /// or `-1` for no deadline.
    ///
    /// Rounding up keeps a sub-millisecond remainder from turning into a
    /// zero-timeout busy loop.
    #[must_use]
    pub fn poll_timeout_ms(&self) -> libc::c_int {
        match self.remaining() {
            None => -1,
            Some(left) => {
                let micros = left.as_micros();
                let ms = micros.div_ceil(1000);
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_and_absent_timeouts_are_unbounded() {
        assert_eq!(Deadline::from_timeout(None), Deadline::Never);
        assert_eq!(Deadline::from_timeout(Some(Duration::ZERO)), Deadline::Never);
        assert!(matches!(
            Deadline::from_timeout(Some(Duration::from_millis(5))),
            Deadline::At(_)
        ));
    }

    #[test]
    fn test_never_has_no_remaining_and_infinite_poll_timeout() {
        let d = Deadline::Never;
        assert!(d.remaining().is_none());
        assert!(!d.is_expired());
        assert_eq!(d.poll_timeout_ms(), -1);
    }

    #[test]
    fn test_expired_deadline_saturates_to_zero() {
        let d = Deadline::At(Instant::now());
        std::thread::sleep(Duration::from_millis(2));
        assert!(d.is_expired());
        assert_eq!(d.remaining(), Some(Duration::ZERO));
        assert_eq!(d.poll_timeout_ms(), 0);
    }

    #[test]
    fn test_poll_timeout_rounds_up() {
        let d = Deadline::after(Duration::from_micros(1500));
        let ms = d.poll_timeout_ms();
        assert!((1..=2).contains(&ms), "got {ms}");
    }

    #[test]
    fn test_huge_timeout_does_not_overflow() {
        let d = Deadline::after(Duration::MAX);
        assert_eq!(d, Deadline::Never);
    }

    #[test]
    fn test_min_picks_earlier() {
        let near = Deadline::after(Duration::from_millis(10));
        let far = Deadline::after(Duration::from_secs(10));
        assert_eq!(near.min(far), near);
        assert_eq!(far.min(Deadline::Never), far);
        assert_eq!(Deadline::Never.min(Deadline::Never), Deadline::Never);
    }
}
