//! Counting semaphore for idle worker threads
//!
//! Workers with nothing to run park here; `post` wakes exactly one of them.

use std::sync::{Condvar, Mutex};

pub struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Release one permit, waking a parked thread if any.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cv.notify_one();
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_post_then_wait() {
        let s = Semaphore::new();
        s.post();
        s.wait();
    }

    #[test]
    fn test_wait_blocks_until_post() {
        let s = Arc::new(Semaphore::new());
        let s2 = s.clone();
        let h = std::thread::spawn(move || s2.wait());
        std::thread::sleep(Duration::from_millis(30));
        assert!(!h.is_finished());
        s.post();
        h.join().unwrap();
    }
}
