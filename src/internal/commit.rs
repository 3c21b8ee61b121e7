use crate::{
    internal::{
        conflict::GlobalConflictCounter,
        parking::RetryLatch,
        storage::TranlocalStorage,
        tranlocal::{PrepareParams, TranlocalMode},
    },
    stats,
    tx::TxError,
};
use std::sync::Arc;

impl dyn TranlocalStorage {
    /// Full validation of everything read so far.
    #[inline]
    pub fn has_read_conflict(&self) -> bool {
        stats::rich_conflict_scan();
        self.entries().iter().any(|entry| entry.has_read_conflict())
    }

    /// Locks and validates every tranlocal. On failure, the tranlocals keep track of what they
    /// acquired, and `release` undoes it.
    #[inline]
    pub fn prepare(&mut self, params: &PrepareParams) -> Result<(), TxError> {
        for entry in self.entries_mut() {
            entry.prepare(params)?
        }
        Ok(())
    }

    /// Publishes all dirty tranlocals and departs from the rest.
    ///
    /// The global conflict counter is bumped once, while every write lock is still held and
    /// before the first value becomes visible. Returns the number of published references.
    pub fn publish(&mut self, counter: &GlobalConflictCounter, read_biased_threshold: u32) -> usize {
        let entries = self.entries_mut();
        if entries.iter().any(|entry| entry.will_publish()) {
            drop(counter.signal_conflict());
        }
        let mut written = 0;
        for entry in entries {
            if entry.commit(read_biased_threshold) {
                written += 1
            }
        }
        stats::read_size(self.len() - written);
        stats::write_size(written);
        written
    }

    /// Departs from and unlocks every tranlocal without publishing.
    #[inline]
    pub fn release(&mut self) {
        for entry in self.entries_mut() {
            entry.abort()
        }
    }

    /// Whether anything was actually read, so a blocking retry has something to wait on.
    #[inline]
    pub fn has_observations(&self) -> bool {
        self.entries().iter().any(|entry| match entry.mode() {
            TranlocalMode::Read | TranlocalMode::Write => true,
            TranlocalMode::Commuting | TranlocalMode::Constructing => false,
        })
    }

    /// Registers `latch` on every reference that was read.
    #[inline(never)]
    #[cold]
    pub fn register_retry_latch(&self, latch: &Arc<RetryLatch>) -> usize {
        self.entries()
            .iter()
            .filter(|entry| entry.register_retry_latch(latch))
            .count()
    }
}
