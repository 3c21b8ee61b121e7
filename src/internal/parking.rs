use core::sync::atomic::{
    AtomicBool,
    Ordering::{AcqRel, Acquire, Release},
};
use parking_lot_core::{ParkResult, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};
use std::time::{Duration, Instant};

/// A one shot gate that a blocked transaction parks on until some committing writer opens it.
///
/// A latch is registered on every reference a retrying transaction observed. The first write to
/// any of them opens it. The address of the latch is the parking key, so each waiting thread has
/// its own queue and writers only wake the threads that actually care.
#[derive(Debug, Default)]
pub struct RetryLatch {
    open: AtomicBool,
}

impl RetryLatch {
    #[inline]
    pub fn new() -> Self {
        RetryLatch {
            open: AtomicBool::new(false),
        }
    }

    #[inline]
    fn key(&self) -> usize {
        self as *const Self as usize
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open.load(Acquire)
    }

    /// Opens the latch, waking any thread parked on it. Opening twice is harmless.
    #[inline]
    pub fn open(&self) {
        if !self.open.swap(true, Release) {
            self.unpark()
        }
    }

    #[inline(never)]
    #[cold]
    fn unpark(&self) {
        let _woken = unsafe { parking_lot_core::unpark_all(self.key(), DEFAULT_UNPARK_TOKEN) };
    }

    /// Marks a latch that nobody waits on anymore as opened, so wait lists drop it. Returns
    /// whether a writer got there first. Only the owning thread parks on a latch, so there is
    /// nobody to unpark.
    #[inline]
    fn expire(&self) -> bool {
        self.open.swap(true, AcqRel)
    }

    /// Blocks until the latch is opened. Returns `false` if `timeout` elapsed first, in which
    /// case the latch is expired.
    #[inline(never)]
    #[cold]
    pub fn await_open(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        while !self.is_open() {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return self.expire();
                }
            }
            let validate = || !self.is_open();
            let before_sleep = || {};
            let timed_out = |_, _| {};
            let result = unsafe {
                parking_lot_core::park(
                    self.key(),
                    validate,
                    before_sleep,
                    timed_out,
                    DEFAULT_PARK_TOKEN,
                    deadline,
                )
            };
            match result {
                ParkResult::Unparked(token) => debug_assert_eq!(token, DEFAULT_UNPARK_TOKEN),
                ParkResult::Invalid => {}
                ParkResult::TimedOut => return self.expire(),
            }
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::RetryLatch;
    use crossbeam_utils::thread;
    use std::time::Duration;

    #[test]
    fn open_before_await() {
        let latch = RetryLatch::new();
        latch.open();
        latch.open();
        assert!(latch.is_open());
        assert!(latch.await_open(None));
    }

    #[test]
    fn timeout() {
        let latch = RetryLatch::new();
        assert!(!latch.await_open(Some(Duration::from_millis(10))));
        // expired
        assert!(latch.is_open());
        latch.open();
    }

    #[test]
    fn wakeup() {
        let latch = RetryLatch::new();
        thread::scope(|s| {
            s.spawn(|_| {
                std::thread::sleep(Duration::from_millis(20));
                latch.open();
            });
            assert!(latch.await_open(None));
        })
        .unwrap();
    }
}
