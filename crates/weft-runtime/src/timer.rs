//! Deadline-ordered timers
//!
//! Timers live in an ordered map keyed by `(deadline, id)`; the monotonic id
//! breaks ties so two timers armed for the same instant stay distinct.
//! Mutating operations report whether the earliest deadline changed so the
//! owner can wake whatever is sleeping on it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use weft_core::id::TimerId;

pub type TimerCb = Arc<dyn Fn() + Send + Sync>;

/// One armed timer.
///
/// Cancellation clears the stored callback, so a callback captured by a
/// racing expiry sweep is the last reference to it.
pub struct Timer {
    id: TimerId,
    repeat: bool,
    interval: Mutex<Duration>,
    next_time: Mutex<Instant>,
    cb: Mutex<Option<TimerCb>>,
}

impl Timer {
    #[inline]
    pub fn id(&self) -> TimerId {
        self.id
    }

    #[inline]
    pub fn is_repeating(&self) -> bool {
        self.repeat
    }

    fn key(&self) -> (Instant, TimerId) {
        (*self.next_time.lock().unwrap(), self.id)
    }
}

/// The set of armed timers.
pub struct TimerQueue {
    inner: RwLock<BTreeMap<(Instant, TimerId), Arc<Timer>>>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    /// Arm a timer `interval` from now. Returns the timer and whether it
    /// became the earliest deadline.
    pub fn add(&self, interval: Duration, cb: TimerCb, repeat: bool) -> (Arc<Timer>, bool) {
        let timer = Arc::new(Timer {
            id: TimerId::next(),
            repeat,
            interval: Mutex::new(interval),
            next_time: Mutex::new(Instant::now() + interval),
            cb: Mutex::new(Some(cb)),
        });
        let key = timer.key();
        let mut map = self.inner.write().unwrap();
        map.insert(key, timer.clone());
        let is_front = map.keys().next() == Some(&key);
        (timer, is_front)
    }

    /// Arm a timer whose callback only runs while `cond` is still alive.
    pub fn add_conditional<T: Send + Sync + 'static>(
        &self,
        interval: Duration,
        cb: TimerCb,
        cond: Weak<T>,
        repeat: bool,
    ) -> (Arc<Timer>, bool) {
        let gated: TimerCb = Arc::new(move || {
            if cond.upgrade().is_some() {
                cb();
            }
        });
        self.add(interval, gated, repeat)
    }

    /// Disarm a timer. Returns `(found, earliest_changed)`.
    pub fn cancel(&self, timer: &Arc<Timer>) -> (bool, bool) {
        let mut map = self.inner.write().unwrap();
        let key = timer.key();
        let was_front = map.keys().next() == Some(&key);
        if map.remove(&key).is_none() {
            return (false, false);
        }
        timer.cb.lock().unwrap().take();
        (true, was_front)
    }

    /// Disarm every timer.
    pub fn cancel_all(&self) {
        let mut map = self.inner.write().unwrap();
        for timer in map.values() {
            timer.cb.lock().unwrap().take();
        }
        map.clear();
    }

    /// Change a timer's interval without moving its current deadline.
    /// Returns `(found, earliest_changed)`.
    pub fn reset(&self, timer: &Arc<Timer>, interval: Duration) -> (bool, bool) {
        if *timer.interval.lock().unwrap() == interval {
            return (true, false);
        }
        let map = self.inner.write().unwrap();
        let key = timer.key();
        if !map.contains_key(&key) {
            return (false, false);
        }
        *timer.interval.lock().unwrap() = interval;
        let is_front = map.keys().next() == Some(&key);
        (true, is_front)
    }

    /// Whether the timer is still armed.
    pub fn is_valid(&self, timer: &Arc<Timer>) -> bool {
        self.inner.read().unwrap().contains_key(&timer.key())
    }

    /// Time until the earliest deadline; `Some(ZERO)` when one is already
    /// due, `None` when no timer is armed.
    pub fn next_left_time(&self) -> Option<Duration> {
        let map = self.inner.read().unwrap();
        let (&(when, _), _) = map.first_key_value()?;
        Some(when.saturating_duration_since(Instant::now()))
    }

    /// Remove every due timer and return its callback, in deadline order.
    ///
    /// Repeating timers are re-armed relative to now, so a late sweep does
    /// not produce a burst of catch-up firings.
    pub fn take_expired(&self) -> Vec<TimerCb> {
        let now = Instant::now();
        let mut out = Vec::new();
        let mut map = self.inner.write().unwrap();
        while let Some((&(when, _), _)) = map.first_key_value() {
            if when > now {
                break;
            }
            let (_, timer) = map.pop_first().unwrap();
            if timer.repeat {
                let mut cb = timer.cb.lock().unwrap();
                if let Some(cb) = cb.as_ref() {
                    out.push(cb.clone());
                }
                drop(cb);
                let next = now + *timer.interval.lock().unwrap();
                *timer.next_time.lock().unwrap() = next;
                let key = (next, timer.id);
                map.insert(key, timer);
            } else if let Some(cb) = timer.cb.lock().unwrap().take() {
                out.push(cb);
            }
        }
        out
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_cb(c: &Arc<AtomicUsize>) -> TimerCb {
        let c = c.clone();
        Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_expire_in_deadline_order() {
        let q = TimerQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (ms, tag) in [(20u64, "b"), (10, "a"), (30, "c")] {
            let o = order.clone();
            q.add(
                Duration::from_millis(ms),
                Arc::new(move || o.lock().unwrap().push(tag)),
                false,
            );
        }
        std::thread::sleep(Duration::from_millis(50));
        for cb in q.take_expired() {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_add_reports_new_front() {
        let q = TimerQueue::new();
        let c = Arc::new(AtomicUsize::new(0));
        let (_a, front) = q.add(Duration::from_millis(100), counter_cb(&c), false);
        assert!(front);
        let (_b, front) = q.add(Duration::from_millis(200), counter_cb(&c), false);
        assert!(!front);
        let (_c, front) = q.add(Duration::from_millis(10), counter_cb(&c), false);
        assert!(front);
    }

    #[test]
    fn test_same_deadline_timers_stay_distinct() {
        let q = TimerQueue::new();
        let c = Arc::new(AtomicUsize::new(0));
        q.add(Duration::from_millis(5), counter_cb(&c), false);
        q.add(Duration::from_millis(5), counter_cb(&c), false);
        std::thread::sleep(Duration::from_millis(20));
        for cb in q.take_expired() {
            cb();
        }
        assert_eq!(c.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_clears_callback() {
        let q = TimerQueue::new();
        let c = Arc::new(AtomicUsize::new(0));
        let (t, _) = q.add(Duration::from_millis(5), counter_cb(&c), false);
        assert!(q.is_valid(&t));
        let (found, front) = q.cancel(&t);
        assert!(found);
        assert!(front);
        assert!(!q.is_valid(&t));
        std::thread::sleep(Duration::from_millis(20));
        assert!(q.take_expired().is_empty());
        assert_eq!(c.load(Ordering::SeqCst), 0);
        // A second cancel is a no-op.
        assert_eq!(q.cancel(&t), (false, false));
    }

    #[test]
    fn test_repeating_timer_rearms_from_now() {
        let q = TimerQueue::new();
        let c = Arc::new(AtomicUsize::new(0));
        let (t, _) = q.add(Duration::from_millis(10), counter_cb(&c), true);
        // Sweep well after several intervals have passed; only one firing
        // comes out and the next deadline is a full interval away.
        std::thread::sleep(Duration::from_millis(45));
        let fired = q.take_expired();
        assert_eq!(fired.len(), 1);
        let left = q.next_left_time().unwrap();
        assert!(left > Duration::from_millis(5), "left {:?}", left);
        assert!(q.is_valid(&t));
    }

    #[test]
    fn test_conditional_timer_skips_dead_cond() {
        let q = TimerQueue::new();
        let c = Arc::new(AtomicUsize::new(0));
        let cond = Arc::new(());
        let (_t, _) = q.add_conditional(
            Duration::from_millis(5),
            counter_cb(&c),
            Arc::downgrade(&cond),
            false,
        );
        drop(cond);
        std::thread::sleep(Duration::from_millis(20));
        for cb in q.take_expired() {
            cb();
        }
        assert_eq!(c.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_next_left_time() {
        let q = TimerQueue::new();
        assert!(q.next_left_time().is_none());
        let c = Arc::new(AtomicUsize::new(0));
        q.add(Duration::from_millis(50), counter_cb(&c), false);
        let left = q.next_left_time().unwrap();
        assert!(left <= Duration::from_millis(50));
        assert!(left > Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(q.next_left_time(), Some(Duration::ZERO));
    }

    #[test]
    fn test_reset_keeps_current_deadline() {
        let q = TimerQueue::new();
        let c = Arc::new(AtomicUsize::new(0));
        let (t, _) = q.add(Duration::from_millis(40), counter_cb(&c), true);
        let (found, _) = q.reset(&t, Duration::from_millis(5));
        assert!(found);
        // Deadline unchanged, so nothing is due yet.
        assert!(q.take_expired().is_empty());
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(q.take_expired().len(), 1);
        // The re-arm used the new interval.
        assert!(q.next_left_time().unwrap() <= Duration::from_millis(5));
    }
}
