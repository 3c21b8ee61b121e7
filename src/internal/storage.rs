//! Tranlocal storage: where a transaction keeps the references it has opened.
//!
//! The three shapes trade generality for speed. `MonoStorage` holds a single tranlocal,
//! `FixedStorage` a handful found by linear scan, and `VariableStorage` any number indexed by an
//! open addressed hash table. A transaction that outgrows its storage fails with a capacity error
//! and the factory hands out a bigger shape next time.

use crate::{internal::tranlocal::AnyTranlocal, tx::TxShape};
use core::fmt::{self, Debug, Formatter};

pub(crate) type Entry = Box<dyn AnyTranlocal>;

pub(crate) trait TranlocalStorage: Send {
    fn shape(&self) -> TxShape;

    /// Maximum number of tranlocals, or `None` if unbounded.
    fn capacity(&self) -> Option<usize>;

    /// Position of the tranlocal for the reference with address `identity`.
    fn find(&self, identity: usize) -> Option<usize>;

    /// Appends `entry`, whose identity must not already be present. Hands the entry back if the
    /// storage is full.
    fn push(&mut self, entry: Entry) -> Result<usize, Entry>;

    fn entries(&self) -> &[Entry];

    fn entries_mut(&mut self) -> &mut [Entry];

    /// Drops every tranlocal. They must have been released already.
    fn clear(&mut self);

    /// Clears and gives back memory accumulated by a large transaction.
    fn hard_reset(&mut self);

    #[inline]
    fn len(&self) -> usize {
        self.entries().len()
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl Debug for dyn TranlocalStorage {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TranlocalStorage")
            .field("shape", &self.shape())
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

pub(crate) fn new_storage(shape: TxShape, fixed_capacity: usize) -> Box<dyn TranlocalStorage> {
    match shape {
        TxShape::Mono => Box::new(MonoStorage::new()),
        TxShape::Fixed => Box::new(FixedStorage::new(fixed_capacity)),
        TxShape::Variable => Box::new(VariableStorage::new()),
    }
}

pub(crate) struct MonoStorage {
    entry: Vec<Entry>,
}

impl MonoStorage {
    pub fn new() -> Self {
        MonoStorage {
            entry: Vec::with_capacity(1),
        }
    }
}

impl TranlocalStorage for MonoStorage {
    #[inline]
    fn shape(&self) -> TxShape {
        TxShape::Mono
    }

    #[inline]
    fn capacity(&self) -> Option<usize> {
        Some(1)
    }

    #[inline]
    fn find(&self, identity: usize) -> Option<usize> {
        match self.entry.first() {
            Some(entry) if entry.identity() == identity => Some(0),
            _ => None,
        }
    }

    #[inline]
    fn push(&mut self, entry: Entry) -> Result<usize, Entry> {
        if self.entry.is_empty() {
            self.entry.push(entry);
            Ok(0)
        } else {
            Err(entry)
        }
    }

    #[inline]
    fn entries(&self) -> &[Entry] {
        &self.entry
    }

    #[inline]
    fn entries_mut(&mut self) -> &mut [Entry] {
        &mut self.entry
    }

    #[inline]
    fn clear(&mut self) {
        self.entry.clear()
    }

    #[inline]
    fn hard_reset(&mut self) {
        self.entry.clear()
    }
}

pub(crate) struct FixedStorage {
    entries:  Vec<Entry>,
    capacity: usize,
}

impl FixedStorage {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "zero capacity fixed storage");
        FixedStorage {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }
}

impl TranlocalStorage for FixedStorage {
    #[inline]
    fn shape(&self) -> TxShape {
        TxShape::Fixed
    }

    #[inline]
    fn capacity(&self) -> Option<usize> {
        Some(self.capacity)
    }

    #[inline]
    fn find(&self, identity: usize) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.identity() == identity)
    }

    #[inline]
    fn push(&mut self, entry: Entry) -> Result<usize, Entry> {
        if self.entries.len() < self.capacity {
            self.entries.push(entry);
            Ok(self.entries.len() - 1)
        } else {
            Err(entry)
        }
    }

    #[inline]
    fn entries(&self) -> &[Entry] {
        &self.entries
    }

    #[inline]
    fn entries_mut(&mut self) -> &mut [Entry] {
        &mut self.entries
    }

    #[inline]
    fn clear(&mut self) {
        self.entries.clear()
    }

    #[inline]
    fn hard_reset(&mut self) {
        self.entries.clear()
    }
}

const EMPTY: u32 = u32::MAX;
const INITIAL_SLOTS: usize = 16;

/// Dense entries plus an open addressed (linear probing) index of positions into them.
///
/// The slot count is a power of two and is doubled as soon as more than half of it is in use.
pub(crate) struct VariableStorage {
    entries: Vec<Entry>,
    slots:   Vec<u32>,
}

impl VariableStorage {
    pub fn new() -> Self {
        VariableStorage {
            entries: Vec::with_capacity(INITIAL_SLOTS / 2),
            slots:   vec![EMPTY; INITIAL_SLOTS],
        }
    }

    #[inline]
    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    #[inline]
    fn home(&self, identity: usize) -> usize {
        fxhash::hash(&identity) & self.mask()
    }

    fn insert_slot(&mut self, identity: usize, position: u32) {
        let mask = self.mask();
        let mut slot = self.home(identity);
        while self.slots[slot] != EMPTY {
            slot = (slot + 1) & mask;
        }
        self.slots[slot] = position;
    }

    #[inline(never)]
    #[cold]
    fn grow(&mut self) {
        let new_len = self.slots.len() * 2;
        self.slots.clear();
        self.slots.resize(new_len, EMPTY);
        for position in 0..self.entries.len() {
            let identity = self.entries[position].identity();
            self.insert_slot(identity, position as u32)
        }
    }

    /// Number of index slots. Exposed for tests of the growth policy.
    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

impl TranlocalStorage for VariableStorage {
    #[inline]
    fn shape(&self) -> TxShape {
        TxShape::Variable
    }

    #[inline]
    fn capacity(&self) -> Option<usize> {
        None
    }

    fn find(&self, identity: usize) -> Option<usize> {
        let mask = self.mask();
        let mut slot = self.home(identity);
        loop {
            let position = self.slots[slot];
            if position == EMPTY {
                return None;
            }
            if likely!(self.entries[position as usize].identity() == identity) {
                return Some(position as usize);
            }
            slot = (slot + 1) & mask;
        }
    }

    fn push(&mut self, entry: Entry) -> Result<usize, Entry> {
        if (self.entries.len() + 1) * 2 > self.slots.len() {
            self.grow()
        }
        let identity = entry.identity();
        let position = self.entries.len();
        self.entries.push(entry);
        self.insert_slot(identity, position as u32);
        Ok(position)
    }

    #[inline]
    fn entries(&self) -> &[Entry] {
        &self.entries
    }

    #[inline]
    fn entries_mut(&mut self) -> &mut [Entry] {
        &mut self.entries
    }

    fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            for slot in self.slots.iter_mut() {
                *slot = EMPTY
            }
        }
    }

    fn hard_reset(&mut self) {
        self.entries.clear();
        self.entries.shrink_to(INITIAL_SLOTS / 2);
        self.slots.clear();
        self.slots.resize(INITIAL_SLOTS, EMPTY);
        self.slots.shrink_to_fit();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        internal::{
            parking::RetryLatch,
            tranlocal::{PrepareParams, TranlocalMode},
        },
        tx::{LockMode, TxError},
    };
    use core::any::Any;
    use std::sync::Arc;

    struct Fake(usize);

    impl AnyTranlocal for Fake {
        fn identity(&self) -> usize {
            self.0
        }

        fn mode(&self) -> TranlocalMode {
            TranlocalMode::Read
        }

        fn lock_mode(&self) -> LockMode {
            LockMode::None
        }

        fn has_read_conflict(&self) -> bool {
            false
        }

        fn prepare(&mut self, _: &PrepareParams) -> Result<(), TxError> {
            Ok(())
        }

        fn will_publish(&self) -> bool {
            false
        }

        fn commit(&mut self, _: u32) -> bool {
            false
        }

        fn abort(&mut self) {}

        fn register_retry_latch(&self, _: &Arc<RetryLatch>) -> bool {
            false
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn fake(identity: usize) -> Entry {
        Box::new(Fake(identity))
    }

    #[test]
    fn mono() {
        let mut storage = MonoStorage::new();
        assert_eq!(storage.find(8), None);
        assert_eq!(storage.push(fake(8)).ok(), Some(0));
        assert_eq!(storage.find(8), Some(0));
        assert_eq!(storage.find(16), None);
        assert!(storage.push(fake(16)).is_err());
        storage.clear();
        assert!(storage.is_empty());
    }

    #[test]
    fn fixed_overflow() {
        let mut storage = FixedStorage::new(3);
        for i in 1..=3 {
            assert_eq!(storage.push(fake(i * 8)).ok(), Some(i - 1));
        }
        assert!(storage.push(fake(32)).is_err());
        assert_eq!(storage.find(16), Some(1));
        assert_eq!(storage.len(), 3);
    }

    #[test]
    fn variable_grows_and_shrinks() {
        let mut storage = VariableStorage::new();
        for i in 1..=1000 {
            assert_eq!(storage.push(fake(i * 8)).ok(), Some(i - 1));
        }
        assert!(storage.slot_count() >= 2000);
        for i in 1..=1000 {
            assert_eq!(storage.find(i * 8), Some(i - 1));
        }
        assert_eq!(storage.find(8008), None);

        storage.clear();
        assert_eq!(storage.find(8), None);
        assert!(storage.slot_count() >= 2000);

        storage.hard_reset();
        assert_eq!(storage.slot_count(), INITIAL_SLOTS);
        assert_eq!(storage.push(fake(8)).ok(), Some(0));
        assert_eq!(storage.find(8), Some(0));
    }
}
