//! Identifier types for coroutines and timers

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a coroutine.
///
/// Ids are process-wide monotonic and never reused; `0` is reserved for
/// "no coroutine" (a thread's implicit main context reports this value).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CoId(u64);

static NEXT_CO_ID: AtomicU64 = AtomicU64::new(1);

impl CoId {
    /// Sentinel value for "no coroutine".
    pub const NONE: CoId = CoId(0);

    /// Allocate a fresh id.
    #[inline]
    pub fn next() -> Self {
        CoId(NEXT_CO_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild an id from its raw value.
    #[inline]
    pub const fn from_u64(v: u64) -> Self {
        CoId(v)
    }

    /// Check if this is the NONE sentinel.
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoId({})", self.0)
    }
}

/// Unique identifier for a timer.
///
/// Also monotonic; doubles as the tie-breaker when two timers share a
/// deadline, so the ordered timer structure never merges distinct entries.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TimerId(u64);

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

impl TimerId {
    /// Allocate a fresh id.
    #[inline]
    pub fn next() -> Self {
        TimerId(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimerId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_co_ids_monotonic() {
        let a = CoId::next();
        let b = CoId::next();
        assert!(b.as_u64() > a.as_u64());
        assert!(!a.is_none());
        assert!(CoId::NONE.is_none());
    }

    #[test]
    fn test_timer_ids_distinct() {
        let a = TimerId::next();
        let b = TimerId::next();
        assert_ne!(a, b);
    }
}
