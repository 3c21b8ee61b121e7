use core::sync::atomic::{
    AtomicU64,
    Ordering::{Acquire, Release},
};
use crossbeam_utils::CachePadded;

/// A monotonically increasing counter of committed writes.
///
/// Every transaction that publishes at least one write bumps this once, after it holds all of its
/// locks and before the first value is published. A transaction that sees the counter unchanged
/// since its last validation knows that nothing it read can have been overwritten.
#[derive(Debug)]
pub struct GlobalConflictCounter(CachePadded<AtomicU64>);

impl Default for GlobalConflictCounter {
    #[inline]
    fn default() -> Self {
        GlobalConflictCounter::new()
    }
}

impl GlobalConflictCounter {
    #[inline]
    pub fn new() -> Self {
        GlobalConflictCounter(CachePadded::new(AtomicU64::new(0)))
    }

    /// Current value of the counter.
    #[inline]
    pub fn count(&self) -> u64 {
        self.0.load(Acquire)
    }

    /// Increments the counter, returning the previous count.
    ///
    /// The counter is 64 bits wide; at one signal per nanosecond it takes centuries to wrap.
    #[inline]
    pub fn signal_conflict(&self) -> u64 {
        self.0.fetch_add(1, Release)
    }
}
