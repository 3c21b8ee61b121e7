//! The transactional reference [`TRef`].
//!
//! # Examples
//!
//! Creating a reference and updating it in a transaction:
//!
//! ```
//! use reftx::{stm::Stm, tref::TRef};
//!
//! let stm = Stm::new();
//! let x = TRef::new(&stm, 10);
//! stm.atomic(|tx| {
//!     let value = x.get(tx)?;
//!     x.set(tx, value * 2)
//! })
//! .unwrap();
//! assert_eq!(x.atomic_get(), Ok(20));
//! ```
//!
//! Working with the tranlocal directly using [`open_for_write`]:
//!
//! ```
//! use reftx::{stm::Stm, tref::TRef, tx::LockMode};
//!
//! let stm = Stm::new();
//! let names = TRef::new(&stm, vec!["a".to_owned()]);
//! stm.atomic(|tx| {
//!     let tranlocal = names.open_for_write(tx, LockMode::None)?;
//!     tranlocal.get_mut().push("b".to_owned());
//!     Ok(())
//! })
//! .unwrap();
//! assert_eq!(names.atomic_weak_get().len(), 2);
//! ```
//!
//! [`open_for_write`]: struct.TRef.html#method.open_for_write

use crate::{
    internal::{
        orec::{Arrive, Orec, VERSION_UNCOMMITTED},
        parking::RetryLatch,
        tranlocal::{Tranlocal, TranlocalMode},
    },
    stm::Stm,
    transaction::Transaction,
    tx::{LockMode, TValue, TxError},
};
use core::{
    fmt::{self, Debug, Formatter},
    mem,
    ops::Add,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// The shared part of a reference.
pub(crate) struct RefCore<T> {
    pub(crate) orec: Orec,
    value:           RwLock<T>,
    listeners:       Mutex<Vec<Arc<RetryLatch>>>,
    pub(crate) stm:  Stm,
}

impl<T: TValue> RefCore<T> {
    #[inline]
    pub(crate) fn identity(this: &Arc<Self>) -> usize {
        Arc::as_ptr(this) as *const u8 as usize
    }

    /// The committed value together with its version.
    #[inline]
    pub(crate) fn snapshot(&self) -> (T, u64) {
        let guard = self.value.read();
        let version = self.orec.version();
        (guard.clone(), version)
    }

    /// Stores a new committed value and version. The caller holds the exclusive lock.
    #[inline]
    pub(crate) fn publish(&self, value: T, version: u64) {
        let mut guard = self.value.write();
        *guard = value;
        self.orec.publish_version(version);
    }

    /// Adds `latch` to the wait list, or opens it right away if the reference moved past
    /// `observed` already.
    pub(crate) fn register_retry_latch(&self, latch: &Arc<RetryLatch>, observed: u64) {
        let mut listeners = self.listeners.lock();
        if self.orec.version() != observed {
            drop(listeners);
            latch.open();
            return;
        }
        listeners.retain(|listener| !listener.is_open());
        listeners.push(latch.clone());
    }

    /// Opens every latch waiting on this reference. Called after publishing.
    #[inline]
    pub(crate) fn wake_listeners(&self) {
        let latches = mem::replace(&mut *self.listeners.lock(), Vec::new());
        for latch in latches {
            latch.open()
        }
    }

    fn listener_count(&self) -> usize {
        let mut listeners = self.listeners.lock();
        listeners.retain(|listener| !listener.is_open());
        listeners.len()
    }
}

/// Releases an exclusively locked orec if an atomic update unwinds.
struct ExclusiveGuard<'a> {
    orec:  &'a Orec,
    armed: bool,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.orec.depart_after_failure_and_unlock(LockMode::Exclusive)
        }
    }
}

/// A transactional reference to a value of type `T`.
///
/// Cloning a `TRef` clones the handle; both handles refer to the same shared value.
pub struct TRef<T>(Arc<RefCore<T>>);

impl<T> Clone for TRef<T> {
    #[inline]
    fn clone(&self) -> Self {
        TRef(self.0.clone())
    }
}

impl<T: TValue> PartialEq for TRef<T> {
    #[inline]
    fn eq(&self, rhs: &Self) -> bool {
        Arc::ptr_eq(&self.0, &rhs.0)
    }
}

impl<T: TValue> Eq for TRef<T> {}

impl<T: TValue> Debug for TRef<T> {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TRef")
            .field("orec", &self.0.orec)
            .field("value", &"...")
            .finish()
    }
}

impl<T: TValue> TRef<T> {
    /// Creates a committed reference, usable by any transaction of `stm`.
    #[inline]
    pub fn new(stm: &Stm, value: T) -> Self {
        TRef(Arc::new(RefCore {
            orec:      Orec::new(),
            value:     RwLock::new(value),
            listeners: Mutex::new(Vec::new()),
            stm:       stm.clone(),
        }))
    }

    /// Creates a reference inside `tx`. Nobody else can observe it until `tx` commits. If `tx`
    /// aborts the reference stays unusable.
    pub fn new_in(tx: &mut Transaction, value: T) -> Result<Self, TxError> {
        let core = Arc::new(RefCore {
            orec:      Orec::constructing(),
            value:     RwLock::new(value.clone()),
            listeners: Mutex::new(Vec::new()),
            stm:       tx.stm().clone(),
        });
        tx.construct(&core, value)?;
        Ok(TRef(core))
    }

    /// Opens the reference for reading, taking at least `lock`.
    #[inline]
    pub fn open_for_read<'tx>(
        &self,
        tx: &'tx mut Transaction,
        lock: LockMode,
    ) -> Result<&'tx mut Tranlocal<T>, TxError> {
        tx.open_for_read(&self.0, lock)
    }

    /// Opens the reference for writing, taking at least `lock`.
    #[inline]
    pub fn open_for_write<'tx>(
        &self,
        tx: &'tx mut Transaction,
        lock: LockMode,
    ) -> Result<&'tx mut Tranlocal<T>, TxError> {
        tx.open_for_write(&self.0, lock)
    }

    /// Gives access to a reference created with [`new_in`](#method.new_in) by the same
    /// transaction.
    #[inline]
    pub fn open_for_construction<'tx>(
        &self,
        tx: &'tx mut Transaction,
    ) -> Result<&'tx mut Tranlocal<T>, TxError> {
        tx.open_for_construction(&self.0)
    }

    /// Queues `function` to be applied to the value at commit time, without reading it now.
    ///
    /// Commuting updates of different transactions don't conflict with each other. If the
    /// reference is read later in the same transaction the queue is applied at that point.
    #[inline]
    pub fn commute(
        &self,
        tx: &mut Transaction,
        function: impl FnOnce(T) -> T + Send + 'static,
    ) -> Result<(), TxError> {
        tx.commute(&self.0, Box::new(function))
    }

    #[inline]
    pub fn get(&self, tx: &mut Transaction) -> Result<T, TxError> {
        Ok(self.open_for_read(tx, LockMode::None)?.get().clone())
    }

    #[inline]
    pub fn set(&self, tx: &mut Transaction, value: T) -> Result<(), TxError> {
        drop(self.open_for_write(tx, LockMode::None)?.set(value));
        Ok(())
    }

    #[inline]
    pub fn get_and_set(&self, tx: &mut Transaction, value: T) -> Result<T, TxError> {
        Ok(self.open_for_write(tx, LockMode::None)?.set(value))
    }

    pub fn alter_and_get(
        &self,
        tx: &mut Transaction,
        function: impl FnOnce(&T) -> T,
    ) -> Result<T, TxError> {
        let tranlocal = self.open_for_write(tx, LockMode::None)?;
        let new = function(tranlocal.get());
        drop(tranlocal.set(new.clone()));
        Ok(new)
    }

    pub fn get_and_alter(
        &self,
        tx: &mut Transaction,
        function: impl FnOnce(&T) -> T,
    ) -> Result<T, TxError> {
        let tranlocal = self.open_for_write(tx, LockMode::None)?;
        let new = function(tranlocal.get());
        Ok(tranlocal.set(new))
    }

    /// Takes a read lock, so no other transaction can commit a change to the reference before
    /// `tx` completes.
    #[inline]
    pub fn ensure(&self, tx: &mut Transaction) -> Result<(), TxError> {
        self.open_for_read(tx, LockMode::Read).map(|_| ())
    }

    /// Returns `Err(TxError::Retry)` unless `predicate` holds for the current value. Run inside
    /// [`TxExecutor::atomic`](crate::stm::TxExecutor::atomic), this blocks until another
    /// transaction changes the reference.
    pub fn await_until(
        &self,
        tx: &mut Transaction,
        predicate: impl FnOnce(&T) -> bool,
    ) -> Result<(), TxError> {
        if predicate(self.open_for_read(tx, LockMode::None)?.get()) {
            Ok(())
        } else {
            Err(TxError::Retry)
        }
    }

    /// Reads the committed value outside of any transaction. Fails if the reference is
    /// exclusively locked.
    pub fn atomic_get(&self) -> Result<T, TxError> {
        let config = self.0.stm.config();
        let arrive = self.0.orec.arrive(false, config.spin_count);
        if arrive == Arrive::LockedOut {
            return Err(TxError::Locked);
        }
        let (value, version) = self.0.snapshot();
        if arrive == Arrive::Normal {
            self.0.orec.depart_after_reading(config.read_biased_threshold);
        }
        if unlikely!(version == VERSION_UNCOMMITTED) {
            return Err(TxError::Locked);
        }
        Ok(value)
    }

    /// Reads the last committed value, ignoring locks.
    #[inline]
    pub fn atomic_weak_get(&self) -> T {
        self.0.snapshot().0
    }

    /// Applies `function` under an exclusive lock. Returns the old and the new value. Equal values
    /// are not published.
    fn atomic_update(&self, function: impl FnOnce(&T) -> T) -> Result<(T, T), TxError> {
        let config = self.0.stm.config();
        let orec = &self.0.orec;
        if !orec.arrive_and_lock(LockMode::Exclusive, config.spin_count) {
            return Err(TxError::Locked);
        }
        let mut guard = ExclusiveGuard { orec, armed: true };
        let (old, version) = self.0.snapshot();
        if unlikely!(version == VERSION_UNCOMMITTED) {
            return Err(TxError::Locked);
        }
        let new = function(&old);
        guard.armed = false;
        if new == old {
            orec.depart_after_reading_and_unlock(LockMode::Exclusive, config.read_biased_threshold);
        } else {
            drop(self.0.stm.conflict_counter().signal_conflict());
            self.0.publish(new.clone(), version + 1);
            orec.depart_after_update_and_unlock(LockMode::Exclusive);
            self.0.wake_listeners();
        }
        Ok((old, new))
    }

    #[inline]
    pub fn atomic_set(&self, value: T) -> Result<(), TxError> {
        self.atomic_update(move |_| value).map(drop)
    }

    #[inline]
    pub fn atomic_get_and_set(&self, value: T) -> Result<T, TxError> {
        self.atomic_update(move |_| value).map(|(old, _)| old)
    }

    /// Sets the value to `new` if it currently equals `expected`.
    pub fn atomic_compare_and_set(&self, expected: &T, new: T) -> Result<bool, TxError> {
        let mut swapped = false;
        drop(self.atomic_update(|current| {
            if current == expected {
                swapped = true;
                new
            } else {
                current.clone()
            }
        })?);
        Ok(swapped)
    }

    #[inline]
    pub fn atomic_alter_and_get(&self, function: impl FnOnce(&T) -> T) -> Result<T, TxError> {
        self.atomic_update(function).map(|(_, new)| new)
    }

    #[inline]
    pub fn atomic_get_and_alter(&self, function: impl FnOnce(&T) -> T) -> Result<T, TxError> {
        self.atomic_update(function).map(|(old, _)| old)
    }

    /// Blocks until `predicate` holds for the committed value, and returns that value.
    ///
    /// Gives up with [`TxError::RetryTimeout`] after the configured timeout of the owning
    /// [`Stm`].
    pub fn atomic_await(&self, mut predicate: impl FnMut(&T) -> bool) -> Result<T, TxError> {
        let timeout = self.0.stm.config().timeout;
        loop {
            let (value, version) = self.0.snapshot();
            if version != VERSION_UNCOMMITTED && predicate(&value) {
                return Ok(value);
            }
            let latch = Arc::new(RetryLatch::new());
            self.0.register_retry_latch(&latch, version);
            if !latch.await_open(timeout) {
                return Err(TxError::RetryTimeout);
            }
        }
    }

    /// How `tx` has opened this reference, if at all.
    #[inline]
    pub fn mode_in(&self, tx: &Transaction) -> Option<TranlocalMode> {
        tx.mode_of(RefCore::identity(&self.0))
    }

    /// Committed version. `0` while the constructing transaction is running.
    #[inline]
    pub fn version(&self) -> u64 {
        self.0.orec.version()
    }

    #[inline]
    pub fn lock_mode(&self) -> LockMode {
        self.0.orec.lock_mode()
    }

    #[inline]
    pub fn surplus(&self) -> u32 {
        self.0.orec.surplus()
    }

    #[inline]
    pub fn is_read_biased(&self) -> bool {
        self.0.orec.is_read_biased()
    }

    #[inline]
    pub fn readonly_count(&self) -> u32 {
        self.0.orec.readonly_count()
    }

    /// Number of blocked transactions registered on this reference.
    #[inline]
    pub fn listener_count(&self) -> usize {
        self.0.listener_count()
    }
}

impl<T: TValue + Add<Output = T>> TRef<T> {
    #[inline]
    pub fn atomic_increment_and_get(&self, amount: T) -> Result<T, TxError> {
        self.atomic_alter_and_get(move |current| current.clone() + amount)
    }

    #[inline]
    pub fn atomic_get_and_increment(&self, amount: T) -> Result<T, TxError> {
        self.atomic_get_and_alter(move |current| current.clone() + amount)
    }
}

#[cfg(test)]
mod test {
    use crate::{
        stm::Stm,
        tref::TRef,
        tx::{LockMode, TxError},
    };
    use crossbeam_utils::thread;
    use std::time::Duration;

    #[test]
    fn atomic_ops() {
        let stm = Stm::new();
        let x = TRef::new(&stm, 5);
        assert_eq!(x.version(), 1);
        assert_eq!(x.atomic_get(), Ok(5));
        assert_eq!(x.atomic_get_and_set(6), Ok(5));
        assert_eq!(x.version(), 2);
        assert_eq!(x.atomic_compare_and_set(&5, 7), Ok(false));
        assert_eq!(x.atomic_compare_and_set(&6, 7), Ok(true));
        assert_eq!(x.atomic_increment_and_get(3), Ok(10));
        assert_eq!(x.atomic_get_and_increment(1), Ok(10));
        assert_eq!(x.atomic_alter_and_get(|x| x * 2), Ok(22));
        assert_eq!(x.atomic_get_and_alter(|x| x - 2), Ok(22));
        assert_eq!(x.atomic_weak_get(), 20);
        assert_eq!(x.surplus(), 0);
        assert_eq!(x.lock_mode(), LockMode::None);
    }

    #[test]
    fn atomic_set_equal_is_not_published() {
        let stm = Stm::new();
        let x = TRef::new(&stm, 5);
        let before = stm.global_conflict_count();
        x.atomic_set(5).unwrap();
        assert_eq!(x.version(), 1);
        assert_eq!(stm.global_conflict_count(), before);
        x.atomic_set(6).unwrap();
        assert_eq!(x.version(), 2);
        assert_eq!(stm.global_conflict_count(), before + 1);
    }

    #[test]
    fn atomic_ops_see_locks() {
        let stm = Stm::new();
        let x = TRef::new(&stm, 0);
        let mut tx = stm.new_transaction();
        x.open_for_write(&mut tx, LockMode::Exclusive).unwrap();
        assert_eq!(x.atomic_get(), Err(TxError::Locked));
        assert_eq!(x.atomic_set(1), Err(TxError::Locked));
        assert_eq!(x.atomic_weak_get(), 0);
        tx.abort().unwrap();
        assert_eq!(x.atomic_get(), Ok(0));
        assert_eq!(x.surplus(), 0);
    }

    #[test]
    fn atomic_update_panic_unlocks() {
        let stm = Stm::new();
        let x = TRef::new(&stm, 0);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            x.atomic_alter_and_get(|_| panic!("boom"))
        }));
        assert!(result.is_err());
        assert_eq!(x.lock_mode(), LockMode::None);
        assert_eq!(x.surplus(), 0);
        assert_eq!(x.atomic_get(), Ok(0));
    }

    #[test]
    fn atomic_await() {
        let stm = Stm::new();
        let x = TRef::new(&stm, 0);
        thread::scope(|s| {
            s.spawn(|_| {
                std::thread::sleep(Duration::from_millis(20));
                x.atomic_set(3).unwrap();
            });
            assert_eq!(x.atomic_await(|x| *x == 3), Ok(3));
        })
        .unwrap();
    }
}
