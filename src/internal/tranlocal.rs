//! Transaction local copies of references.
//!
//! A [`Tranlocal`] is created the first time a transaction touches a reference and is released
//! (departed, unlocked, published) exactly once, at commit or abort. Transactions store them type
//! erased behind [`AnyTranlocal`].

use crate::{
    internal::{
        orec::{Arrive, VERSION_FIRST, VERSION_UNCOMMITTED},
        parking::RetryLatch,
    },
    tref::RefCore,
    tx::{LockMode, TValue, TxError},
};
use core::{
    any::Any,
    fmt::{self, Debug, Formatter},
    mem,
};
use std::sync::Arc;

/// What a transaction intends to do with a reference.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TranlocalMode {
    Read,
    Write,
    /// Blind, deferred modifications. The value has not been read yet.
    Commuting,
    /// The reference was created by the owning transaction.
    Constructing,
}

pub(crate) type CommutingFunction<T> = Box<dyn FnOnce(T) -> T + Send>;

/// A transaction's view of one reference.
pub struct Tranlocal<T: TValue> {
    core:                  Arc<RefCore<T>>,
    mode:                  TranlocalMode,
    value:                 Option<T>,
    old_value:             Option<T>,
    version:               u64,
    lock_mode:             LockMode,
    has_depart_obligation: bool,
    is_dirty:              bool,
    commuting_functions:   Vec<CommutingFunction<T>>,
}

impl<T: TValue + Debug> Debug for Tranlocal<T> {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Tranlocal")
            .field("mode", &self.mode)
            .field("value", &self.value)
            .field("version", &self.version)
            .field("lock_mode", &self.lock_mode)
            .field("has_depart_obligation", &self.has_depart_obligation)
            .field("is_dirty", &self.is_dirty)
            .field("pending_commutes", &self.commuting_functions.len())
            .finish()
    }
}

/// Parameters of the prepare phase that come from the transaction.
#[derive(Copy, Clone, Debug)]
pub(crate) struct PrepareParams {
    pub dirty_check:    bool,
    pub validate_reads: bool,
    pub spins:          u32,
}

/// Registers on `core`'s orec. Returns whether a depart obligation was taken, or `None` if the
/// reference can't be observed right now.
#[inline]
fn arrive<T: TValue>(
    core: &RefCore<T>,
    lock: LockMode,
    for_update: bool,
    spins: u32,
) -> Option<bool> {
    if lock == LockMode::None {
        match core.orec.arrive(for_update, spins) {
            Arrive::Normal => Some(true),
            Arrive::Unregistered => Some(false),
            Arrive::LockedOut => None,
        }
    } else if core.orec.arrive_and_lock(lock, spins) {
        Some(true)
    } else {
        None
    }
}

impl<T: TValue> Tranlocal<T> {
    /// Opens `core` for reading or writing, taking `lock`.
    pub(crate) fn load(
        core: &Arc<RefCore<T>>,
        mode: TranlocalMode,
        lock: LockMode,
        spins: u32,
    ) -> Result<Self, TxError> {
        debug_assert!(mode == TranlocalMode::Read || mode == TranlocalMode::Write);
        let mut tranlocal = Tranlocal {
            core: core.clone(),
            mode,
            value: None,
            old_value: None,
            version: VERSION_UNCOMMITTED,
            lock_mode: LockMode::None,
            has_depart_obligation: false,
            is_dirty: false,
            commuting_functions: Vec::new(),
        };
        tranlocal.arrive_and_snapshot(lock, mode == TranlocalMode::Write, spins)?;
        Ok(tranlocal)
    }

    pub(crate) fn commuting(core: &Arc<RefCore<T>>) -> Self {
        Tranlocal {
            core:                  core.clone(),
            mode:                  TranlocalMode::Commuting,
            value:                 None,
            old_value:             None,
            version:               VERSION_UNCOMMITTED,
            lock_mode:             LockMode::None,
            has_depart_obligation: false,
            is_dirty:              false,
            commuting_functions:   Vec::new(),
        }
    }

    /// A tranlocal for a reference whose orec was born exclusively locked.
    pub(crate) fn constructing(core: &Arc<RefCore<T>>, value: T) -> Self {
        Tranlocal {
            core:                  core.clone(),
            mode:                  TranlocalMode::Constructing,
            value:                 Some(value),
            old_value:             None,
            version:               VERSION_UNCOMMITTED,
            lock_mode:             LockMode::Exclusive,
            has_depart_obligation: true,
            is_dirty:              true,
            commuting_functions:   Vec::new(),
        }
    }

    fn arrive_and_snapshot(
        &mut self,
        lock: LockMode,
        for_update: bool,
        spins: u32,
    ) -> Result<(), TxError> {
        let obligation = match arrive(&self.core, lock, for_update, spins) {
            Some(obligation) => obligation,
            None => return Err(TxError::ReadWriteConflict),
        };
        self.has_depart_obligation = obligation;
        self.lock_mode = if obligation { lock } else { LockMode::None };

        let (value, version) = self.core.snapshot();
        if unlikely!(version == VERSION_UNCOMMITTED) {
            // leftover of an aborted construction
            self.release_after_failure();
            return Err(TxError::ReadWriteConflict);
        }
        self.version = version;
        self.old_value = Some(value.clone());
        self.value = Some(value);
        Ok(())
    }

    /// The value as seen (and possibly modified) by the transaction.
    #[inline]
    pub fn get(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => fatal!("reading the value of an unevaluated commuting tranlocal"),
        }
    }

    /// Mutable access to the value.
    ///
    /// # Panics
    ///
    /// Panics unless the tranlocal was opened for writing or construction. A reference opened
    /// with `open_for_read` has to be reopened with `open_for_write` first.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        assert!(
            self.mode == TranlocalMode::Write || self.mode == TranlocalMode::Constructing,
            "modifying a tranlocal that was opened in {:?} mode",
            self.mode
        );
        match &mut self.value {
            Some(value) => value,
            None => fatal!("writing the value of an unevaluated commuting tranlocal"),
        }
    }

    /// Replaces the value, returning the previous one.
    #[inline]
    pub fn set(&mut self, value: T) -> T {
        mem::replace(self.get_mut(), value)
    }

    #[inline]
    pub fn mode(&self) -> TranlocalMode {
        self.mode
    }

    /// The committed version the value was read from; `0` for constructions.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    #[inline]
    pub fn has_depart_obligation(&self) -> bool {
        self.has_depart_obligation
    }

    /// Whether commit will publish this tranlocal. Decided during prepare for plain writes.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    /// Number of commuting functions still waiting to be applied.
    #[inline]
    pub fn pending_commutes(&self) -> usize {
        self.commuting_functions.len()
    }

    /// Takes a depart obligation if we don't have one yet. Needed before writing or locking a
    /// reference that was read through a read biased orec.
    fn ensure_obligation(&mut self, spins: u32) -> bool {
        if self.has_depart_obligation {
            return true;
        }
        match self.core.orec.arrive(true, spins) {
            Arrive::Normal => {
                self.has_depart_obligation = true;
                true
            }
            Arrive::Unregistered | Arrive::LockedOut => false,
        }
    }

    /// Escalates the held lock to at least `lock`. The version we read must still be current once
    /// the lock is held.
    pub(crate) fn acquire(&mut self, lock: LockMode, spins: u32) -> Result<(), TxError> {
        if lock <= self.lock_mode {
            return Ok(());
        }
        if !self.ensure_obligation(spins) {
            return Err(TxError::ReadWriteConflict);
        }
        let locked = if self.lock_mode == LockMode::None {
            self.core.orec.try_lock_after_arrive(lock, spins)
        } else {
            self.core.orec.upgrade_lock(self.lock_mode, lock, spins)
        };
        if !locked {
            return Err(TxError::ReadWriteConflict);
        }
        self.lock_mode = lock;
        if self.core.orec.version() != self.version {
            return Err(TxError::ReadWriteConflict);
        }
        Ok(())
    }

    /// Turns a read into a write.
    pub(crate) fn upgrade_to_write(&mut self, spins: u32) -> Result<(), TxError> {
        match self.mode {
            TranlocalMode::Read => {
                if !self.ensure_obligation(spins) {
                    return Err(TxError::ReadWriteConflict);
                }
                self.mode = TranlocalMode::Write;
                Ok(())
            }
            TranlocalMode::Write | TranlocalMode::Constructing => Ok(()),
            TranlocalMode::Commuting => {
                fatal!("upgrading an unevaluated commuting tranlocal")
            }
        }
    }

    pub(crate) fn push_commute(&mut self, function: CommutingFunction<T>) {
        debug_assert_eq!(self.mode, TranlocalMode::Commuting);
        self.commuting_functions.push(function)
    }

    /// Applies `function` to the already loaded value.
    pub(crate) fn apply(&mut self, function: CommutingFunction<T>) {
        let value = self.value.take();
        match value {
            Some(value) => self.value = Some(function(value)),
            None => fatal!("applying a function to an unloaded tranlocal"),
        }
    }

    /// Loads the current value of a commuting tranlocal and applies the pending functions in the
    /// order they were queued. The tranlocal becomes a write.
    pub(crate) fn evaluate_commutes(&mut self, lock: LockMode, spins: u32) -> Result<(), TxError> {
        debug_assert_eq!(self.mode, TranlocalMode::Commuting);
        self.arrive_and_snapshot(lock, true, spins)?;
        self.mode = TranlocalMode::Write;
        for function in mem::replace(&mut self.commuting_functions, Vec::new()) {
            self.apply(function)
        }
        Ok(())
    }

    /// Departs and unlocks without publishing.
    #[inline]
    pub(crate) fn release(&mut self) {
        self.release_after_failure()
    }

    fn release_after_failure(&mut self) {
        if self.has_depart_obligation {
            if self.lock_mode == LockMode::None {
                self.core.orec.depart_after_failure()
            } else {
                self.core.orec.depart_after_failure_and_unlock(self.lock_mode)
            }
        }
        self.has_depart_obligation = false;
        self.lock_mode = LockMode::None;
    }

    fn release_after_reading(&mut self, threshold: u32) {
        if self.has_depart_obligation {
            if self.lock_mode == LockMode::None {
                self.core.orec.depart_after_reading(threshold)
            } else {
                self.core
                    .orec
                    .depart_after_reading_and_unlock(self.lock_mode, threshold)
            }
        }
        self.has_depart_obligation = false;
        self.lock_mode = LockMode::None;
    }
}

/// The type erased interface a transaction uses to drive its tranlocals through prepare, commit
/// and abort.
pub(crate) trait AnyTranlocal: Send {
    /// Address of the reference; unique among live references.
    fn identity(&self) -> usize;

    fn mode(&self) -> TranlocalMode;

    fn lock_mode(&self) -> LockMode;

    /// True if the value read may no longer be the committed one.
    fn has_read_conflict(&self) -> bool;

    /// Locks dirty writes exclusively and validates everything else.
    fn prepare(&mut self, params: &PrepareParams) -> Result<(), TxError>;

    /// Whether `commit` will publish a new version.
    fn will_publish(&self) -> bool;

    /// Publishes or departs. Returns true if a new version was published.
    fn commit(&mut self, read_biased_threshold: u32) -> bool;

    fn abort(&mut self);

    /// Adds `latch` to the reference's wait list. Returns false if nothing was read.
    fn register_retry_latch(&self, latch: &Arc<RetryLatch>) -> bool;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: TValue> AnyTranlocal for Tranlocal<T> {
    #[inline]
    fn identity(&self) -> usize {
        RefCore::identity(&self.core)
    }

    #[inline]
    fn mode(&self) -> TranlocalMode {
        self.mode
    }

    #[inline]
    fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    #[inline]
    fn has_read_conflict(&self) -> bool {
        match self.mode {
            TranlocalMode::Commuting | TranlocalMode::Constructing => false,
            TranlocalMode::Read | TranlocalMode::Write => self
                .core
                .orec
                .has_read_conflict(self.version, self.lock_mode),
        }
    }

    fn prepare(&mut self, params: &PrepareParams) -> Result<(), TxError> {
        match self.mode {
            TranlocalMode::Constructing => Ok(()),
            TranlocalMode::Commuting => {
                self.evaluate_commutes(LockMode::Exclusive, params.spins)?;
                self.is_dirty = !params.dirty_check || self.value != self.old_value;
                Ok(())
            }
            TranlocalMode::Write => {
                self.is_dirty = !params.dirty_check || self.value != self.old_value;
                if self.is_dirty {
                    self.acquire(LockMode::Exclusive, params.spins)
                } else if params.validate_reads && self.has_read_conflict() {
                    Err(TxError::ReadWriteConflict)
                } else {
                    Ok(())
                }
            }
            TranlocalMode::Read => {
                if params.validate_reads && self.has_read_conflict() {
                    Err(TxError::ReadWriteConflict)
                } else {
                    Ok(())
                }
            }
        }
    }

    #[inline]
    fn will_publish(&self) -> bool {
        match self.mode {
            TranlocalMode::Constructing => true,
            TranlocalMode::Write => self.is_dirty,
            TranlocalMode::Read | TranlocalMode::Commuting => false,
        }
    }

    fn commit(&mut self, read_biased_threshold: u32) -> bool {
        if self.will_publish() {
            invariant!(
                self.lock_mode == LockMode::Exclusive && self.has_depart_obligation,
                "publishing without holding the exclusive lock"
            );
            let version = if self.mode == TranlocalMode::Constructing {
                VERSION_FIRST
            } else {
                self.version + 1
            };
            let value = match self.value.take() {
                Some(value) => value,
                None => fatal!("publishing an unevaluated tranlocal"),
            };
            self.core.publish(value, version);
            self.core.orec.depart_after_update_and_unlock(LockMode::Exclusive);
            self.has_depart_obligation = false;
            self.lock_mode = LockMode::None;
            self.core.wake_listeners();
            true
        } else {
            self.release_after_reading(read_biased_threshold);
            false
        }
    }

    #[inline]
    fn abort(&mut self) {
        self.release_after_failure()
    }

    fn register_retry_latch(&self, latch: &Arc<RetryLatch>) -> bool {
        match self.mode {
            TranlocalMode::Read | TranlocalMode::Write => {
                self.core.register_retry_latch(latch, self.version);
                true
            }
            TranlocalMode::Commuting | TranlocalMode::Constructing => false,
        }
    }

    #[inline]
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Downcasts a stored tranlocal back to its concrete type.
#[inline]
pub(crate) fn downcast_mut<T: TValue>(tranlocal: &mut dyn AnyTranlocal) -> &mut Tranlocal<T> {
    match tranlocal.as_any_mut().downcast_mut::<Tranlocal<T>>() {
        Some(tranlocal) => tranlocal,
        None => fatal!("tranlocal stored with a different type than its reference"),
    }
}
