//! The [`Transaction`] state machine.
//!
//! A transaction is `Active` until it is prepared, committed or aborted. Every error returned by
//! one of its operations has already aborted it, so all locks and depart obligations are released
//! by the time the caller sees the error. Dropping a live transaction aborts it too.

use crate::{
    config::{SpeculativeConfig, TxConfig},
    internal::{
        parking::RetryLatch,
        storage::{self, Entry, TranlocalStorage},
        tranlocal::{downcast_mut, CommutingFunction, PrepareParams, Tranlocal, TranlocalMode},
    },
    stats,
    stm::Stm,
    tref::RefCore,
    tx::{
        IsolationLevel, LockMode, SpeculativeReason, TValue, TxError, TxEvent, TxFlavor,
        TxListener, TxShape, TxStatus,
    },
};
use core::{
    fmt::{self, Debug, Formatter},
    mem,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, trace};

pub struct Transaction {
    stm:                  Stm,
    config:               Arc<TxConfig>,
    speculative:          Arc<SpeculativeConfig>,
    storage:              Box<dyn TranlocalStorage>,
    flavor:               TxFlavor,
    status:               TxStatus,
    abort_only:           bool,
    evaluating_commute:   bool,
    has_writes:           bool,
    constructions:        usize,
    local_conflict_count: u64,
    listeners:            Vec<Arc<dyn TxListener>>,
}

impl Debug for Transaction {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Transaction")
            .field("family", &self.config.family_name)
            .field("status", &self.status)
            .field("flavor", &self.flavor)
            .field("storage", &self.storage)
            .field("abort_only", &self.abort_only)
            .field("has_writes", &self.has_writes)
            .field("local_conflict_count", &self.local_conflict_count)
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.status.is_alive() {
            self.abort_internal()
        }
    }
}

/// Applies commuting functions with the reentrancy flag raised.
#[inline]
fn evaluate_commutes<T: TValue>(
    tranlocal: &mut Tranlocal<T>,
    evaluating_commute: &mut bool,
    lock: LockMode,
    spins: u32,
) -> Result<(), TxError> {
    *evaluating_commute = true;
    let result = tranlocal.evaluate_commutes(lock, spins);
    *evaluating_commute = false;
    result
}

#[inline]
fn apply_commute<T: TValue>(
    tranlocal: &mut Tranlocal<T>,
    evaluating_commute: &mut bool,
    function: CommutingFunction<T>,
) {
    *evaluating_commute = true;
    tranlocal.apply(function);
    *evaluating_commute = false;
}

impl Transaction {
    pub(crate) fn new(
        stm: Stm,
        config: Arc<TxConfig>,
        speculative: Arc<SpeculativeConfig>,
        shape: TxShape,
        flavor: TxFlavor,
    ) -> Self {
        let storage = storage::new_storage(shape, config.max_fixed_length_transaction_size);
        let local_conflict_count = stm.conflict_counter().count();
        Transaction {
            stm,
            config,
            speculative,
            storage,
            flavor,
            status: TxStatus::Active,
            abort_only: false,
            evaluating_commute: false,
            has_writes: false,
            constructions: 0,
            local_conflict_count,
            listeners: Vec::new(),
        }
    }

    /// Prepares a dead transaction for another run.
    pub(crate) fn init(
        &mut self,
        stm: Stm,
        config: Arc<TxConfig>,
        speculative: Arc<SpeculativeConfig>,
        flavor: TxFlavor,
    ) {
        debug_assert!(!self.status.is_alive(), "reusing a live transaction");
        debug_assert!(self.storage.is_empty(), "reusing a transaction that was not cleaned");
        self.local_conflict_count = stm.conflict_counter().count();
        self.stm = stm;
        self.config = config;
        self.speculative = speculative;
        self.flavor = flavor;
        self.status = TxStatus::Active;
        self.abort_only = false;
        self.evaluating_commute = false;
        self.has_writes = false;
        self.constructions = 0;
        self.listeners.clear();
    }

    /// Aborts if needed and drops everything a large transaction accumulated.
    pub(crate) fn hard_reset(&mut self) {
        if self.status.is_alive() {
            self.abort_internal()
        }
        self.storage.hard_reset();
        self.listeners = Vec::new();
    }

    #[inline]
    pub fn status(&self) -> TxStatus {
        self.status
    }

    #[inline]
    pub fn is_abort_only(&self) -> bool {
        self.abort_only
    }

    #[inline]
    pub fn flavor(&self) -> TxFlavor {
        self.flavor
    }

    #[inline]
    pub fn shape(&self) -> TxShape {
        self.storage.shape()
    }

    /// Number of references opened so far.
    #[inline]
    pub fn size(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    #[inline]
    pub fn stm(&self) -> &Stm {
        &self.stm
    }

    /// Mode of the tranlocal held for the reference at `identity`.
    #[inline]
    pub(crate) fn mode_of(&self, identity: usize) -> Option<TranlocalMode> {
        self.storage
            .find(identity)
            .map(|index| self.storage.entries()[index].mode())
    }

    /// True if no tranlocal is held, which is always the case once the transaction is dead.
    #[inline]
    pub fn is_cleaned(&self) -> bool {
        self.storage.is_empty()
    }

    #[inline(never)]
    #[cold]
    fn fail(&mut self, error: TxError) -> TxError {
        if self.status.is_alive() {
            self.abort_internal()
        }
        if error.is_conflict() {
            stats::read_write_conflict()
        }
        if self.config.control_flow_errors_reused {
            trace!(family = %self.config.family_name, %error, "transaction failed");
        } else {
            debug!(
                family = %self.config.family_name,
                flavor = ?self.flavor,
                shape = ?self.storage.shape(),
                %error,
                "transaction failed"
            );
        }
        error
    }

    #[inline(never)]
    #[cold]
    fn speculative_failure(&mut self, reason: SpeculativeReason) -> TxError {
        self.speculative.signal(reason);
        stats::speculative_failure();
        self.fail(TxError::SpeculativeConfiguration(reason))
    }

    /// Common checks before touching a reference.
    #[inline]
    fn check_open(&mut self, stm: &Stm) -> Result<(), TxError> {
        match self.status {
            TxStatus::Active => {}
            TxStatus::Prepared => return Err(self.fail(TxError::PreparedTransaction)),
            TxStatus::Committed | TxStatus::Aborted => return Err(TxError::DeadTransaction),
        }
        if unlikely!(self.evaluating_commute) {
            return Err(self.fail(TxError::IllegalCommute));
        }
        if unlikely!(!self.stm.same(stm)) {
            return Err(self.fail(TxError::StmMismatch));
        }
        Ok(())
    }

    #[inline]
    fn check_writable(&mut self) -> Result<(), TxError> {
        if unlikely!(self.config.readonly) {
            Err(self.fail(TxError::Readonly))
        } else {
            Ok(())
        }
    }

    #[inline]
    fn check_lock(&mut self, lock: LockMode) -> Result<(), TxError> {
        if lock != LockMode::None && self.flavor == TxFlavor::Lean {
            Err(self.speculative_failure(SpeculativeReason::Locks))
        } else {
            Ok(())
        }
    }

    #[inline]
    fn check_alive(&mut self) -> Result<(), TxError> {
        match self.status {
            TxStatus::Active => Ok(()),
            TxStatus::Prepared => Err(self.fail(TxError::PreparedTransaction)),
            TxStatus::Committed | TxStatus::Aborted => Err(TxError::DeadTransaction),
        }
    }

    #[inline]
    fn tranlocal_at<T: TValue>(&mut self, index: usize) -> &mut Tranlocal<T> {
        downcast_mut(&mut *self.storage.entries_mut()[index])
    }

    fn push(&mut self, entry: Entry) -> Result<usize, TxError> {
        match self.storage.push(entry) {
            Ok(index) => Ok(index),
            Err(mut entry) => {
                entry.abort();
                self.speculative.signal_capacity(self.storage.len() + 1);
                Err(self.speculative_failure(SpeculativeReason::Capacity))
            }
        }
    }

    /// Makes sure everything read so far still belongs to one snapshot, after a new reference
    /// was loaded.
    fn validate_on_open(&mut self) -> Result<(), TxError> {
        if self.config.isolation_level == IsolationLevel::ReadCommitted {
            return Ok(());
        }
        let scan_length = self.config.maximum_poor_mans_conflict_scan_length;
        let count = self.stm.conflict_counter().count();
        // Past the scan length the counter is no longer trusted and every open rescans.
        let rich = scan_length == 0 || self.storage.len() > scan_length;
        if !rich && likely!(count == self.local_conflict_count) {
            stats::skipped_scan();
            return Ok(());
        }
        if self.storage.has_read_conflict() {
            return Err(self.fail(TxError::ReadWriteConflict));
        }
        self.local_conflict_count = count;
        Ok(())
    }

    pub(crate) fn open_for_read<T: TValue>(
        &mut self,
        core: &Arc<RefCore<T>>,
        lock: LockMode,
    ) -> Result<&mut Tranlocal<T>, TxError> {
        self.check_open(&core.stm)?;
        let lock = lock.max(self.config.read_lock_mode);
        self.check_lock(lock)?;
        let spins = self.config.spin_count;

        let index = match self.storage.find(RefCore::identity(core)) {
            Some(index) => {
                let mut evaluated = false;
                let result = {
                    let tranlocal: &mut Tranlocal<T> =
                        downcast_mut(&mut *self.storage.entries_mut()[index]);
                    if tranlocal.mode() == TranlocalMode::Commuting {
                        evaluated = true;
                        evaluate_commutes(tranlocal, &mut self.evaluating_commute, lock, spins)
                    } else {
                        tranlocal.acquire(lock, spins)
                    }
                };
                if let Err(error) = result {
                    return Err(self.fail(error));
                }
                if evaluated {
                    self.validate_on_open()?;
                }
                index
            }
            None => {
                let tranlocal = match Tranlocal::load(core, TranlocalMode::Read, lock, spins) {
                    Ok(tranlocal) => tranlocal,
                    Err(error) => return Err(self.fail(error)),
                };
                let index = self.push(Box::new(tranlocal))?;
                self.validate_on_open()?;
                index
            }
        };
        Ok(self.tranlocal_at(index))
    }

    pub(crate) fn open_for_write<T: TValue>(
        &mut self,
        core: &Arc<RefCore<T>>,
        lock: LockMode,
    ) -> Result<&mut Tranlocal<T>, TxError> {
        self.check_open(&core.stm)?;
        self.check_writable()?;
        let lock = lock.max(self.config.write_lock_mode);
        self.check_lock(lock)?;
        let spins = self.config.spin_count;

        let index = match self.storage.find(RefCore::identity(core)) {
            Some(index) => {
                let mut evaluated = false;
                let result = {
                    let tranlocal: &mut Tranlocal<T> =
                        downcast_mut(&mut *self.storage.entries_mut()[index]);
                    match tranlocal.mode() {
                        TranlocalMode::Commuting => {
                            evaluated = true;
                            evaluate_commutes(tranlocal, &mut self.evaluating_commute, lock, spins)
                        }
                        TranlocalMode::Read => tranlocal
                            .upgrade_to_write(spins)
                            .and_then(|()| tranlocal.acquire(lock, spins)),
                        TranlocalMode::Write | TranlocalMode::Constructing => {
                            tranlocal.acquire(lock, spins)
                        }
                    }
                };
                if let Err(error) = result {
                    return Err(self.fail(error));
                }
                self.has_writes = true;
                if evaluated {
                    self.validate_on_open()?;
                }
                index
            }
            None => {
                let tranlocal = match Tranlocal::load(core, TranlocalMode::Write, lock, spins) {
                    Ok(tranlocal) => tranlocal,
                    Err(error) => return Err(self.fail(error)),
                };
                let index = self.push(Box::new(tranlocal))?;
                self.has_writes = true;
                self.validate_on_open()?;
                index
            }
        };
        Ok(self.tranlocal_at(index))
    }

    pub(crate) fn open_for_construction<T: TValue>(
        &mut self,
        core: &Arc<RefCore<T>>,
    ) -> Result<&mut Tranlocal<T>, TxError> {
        self.check_open(&core.stm)?;
        self.check_writable()?;
        match self.storage.find(RefCore::identity(core)) {
            Some(index) if self.storage.entries()[index].mode() == TranlocalMode::Constructing => {
                Ok(self.tranlocal_at(index))
            }
            _ => Err(self.fail(TxError::NotConstructable)),
        }
    }

    /// Registers a reference born exclusively locked inside this transaction.
    pub(crate) fn construct<T: TValue>(
        &mut self,
        core: &Arc<RefCore<T>>,
        value: T,
    ) -> Result<(), TxError> {
        let mut tranlocal = Tranlocal::constructing(core, value);
        let mut checked = self.check_open(&core.stm);
        if checked.is_ok() {
            checked = self.check_writable();
        }
        if checked.is_ok() && self.flavor == TxFlavor::Lean && self.constructions > 0 {
            checked = Err(self.speculative_failure(SpeculativeReason::Constructions));
        }
        if let Err(error) = checked {
            // the orec was born locked on our behalf
            tranlocal.release();
            return Err(error);
        }
        drop(self.push(Box::new(tranlocal))?);
        self.constructions += 1;
        self.has_writes = true;
        Ok(())
    }

    pub(crate) fn commute<T: TValue>(
        &mut self,
        core: &Arc<RefCore<T>>,
        function: CommutingFunction<T>,
    ) -> Result<(), TxError> {
        self.check_open(&core.stm)?;
        self.check_writable()?;
        let spins = self.config.spin_count;

        match self.storage.find(RefCore::identity(core)) {
            Some(index) => {
                let result = {
                    let tranlocal: &mut Tranlocal<T> =
                        downcast_mut(&mut *self.storage.entries_mut()[index]);
                    match tranlocal.mode() {
                        TranlocalMode::Commuting => {
                            tranlocal.push_commute(function);
                            Ok(())
                        }
                        TranlocalMode::Read => match tranlocal.upgrade_to_write(spins) {
                            Ok(()) => {
                                apply_commute(tranlocal, &mut self.evaluating_commute, function);
                                Ok(())
                            }
                            Err(error) => Err(error),
                        },
                        TranlocalMode::Write | TranlocalMode::Constructing => {
                            apply_commute(tranlocal, &mut self.evaluating_commute, function);
                            Ok(())
                        }
                    }
                };
                if let Err(error) = result {
                    return Err(self.fail(error));
                }
            }
            None => {
                let mut tranlocal = Tranlocal::commuting(core);
                tranlocal.push_commute(function);
                drop(self.push(Box::new(tranlocal))?);
            }
        }
        self.has_writes = true;
        Ok(())
    }

    /// Adds a listener for this transaction's lifecycle events.
    pub fn register(&mut self, listener: Arc<dyn TxListener>) -> Result<(), TxError> {
        self.check_alive()?;
        if self.flavor == TxFlavor::Lean {
            return Err(self.speculative_failure(SpeculativeReason::Listeners));
        }
        self.listeners.push(listener);
        Ok(())
    }

    /// Makes commit fail with [`TxError::AbortOnly`].
    pub fn set_abort_only(&mut self) -> Result<(), TxError> {
        self.check_alive()?;
        if self.flavor == TxFlavor::Lean {
            return Err(self.speculative_failure(SpeculativeReason::AbortOnly));
        }
        self.abort_only = true;
        Ok(())
    }

    fn notify(&mut self, event: TxEvent) {
        let config = self.config.clone();
        let listeners = mem::replace(&mut self.listeners, Vec::new());
        for listener in config.permanent_listeners.iter().chain(listeners.iter()) {
            listener.notify(self, event)
        }
        self.listeners = listeners;
    }

    /// Locks everything that will be written and validates everything that was read. After a
    /// successful prepare, commit can not fail.
    pub fn prepare(&mut self) -> Result<(), TxError> {
        match self.status {
            TxStatus::Active => {}
            TxStatus::Prepared => return Ok(()),
            TxStatus::Committed | TxStatus::Aborted => return Err(TxError::DeadTransaction),
        }
        if self.abort_only {
            return Err(self.fail(TxError::AbortOnly));
        }
        self.notify(TxEvent::PrePrepare);
        let params = PrepareParams {
            dirty_check:    self.config.dirty_check,
            validate_reads: self.has_writes
                && self.config.isolation_level == IsolationLevel::RepeatableRead,
            spins:          self.config.spin_count,
        };
        if let Err(error) = self.storage.prepare(&params) {
            return Err(self.fail(error));
        }
        self.status = TxStatus::Prepared;
        Ok(())
    }

    /// Prepares if necessary, then publishes every write. Committing a committed transaction does
    /// nothing.
    pub fn commit(&mut self) -> Result<(), TxError> {
        match self.status {
            TxStatus::Committed => return Ok(()),
            TxStatus::Aborted => return Err(TxError::DeadTransaction),
            TxStatus::Active => self.prepare()?,
            TxStatus::Prepared => {}
        }
        let written = self
            .storage
            .publish(self.stm.conflict_counter(), self.config.read_biased_threshold);
        self.storage.clear();
        self.status = TxStatus::Committed;
        stats::commit();
        trace!(family = %self.config.family_name, written, "transaction committed");
        self.notify(TxEvent::PostCommit);
        Ok(())
    }

    /// Releases everything without publishing. Aborting an aborted transaction does nothing.
    pub fn abort(&mut self) -> Result<(), TxError> {
        match self.status {
            TxStatus::Aborted => Ok(()),
            TxStatus::Committed => Err(TxError::DeadTransaction),
            TxStatus::Active | TxStatus::Prepared => {
                self.abort_internal();
                Ok(())
            }
        }
    }

    fn abort_internal(&mut self) {
        self.storage.release();
        self.storage.clear();
        self.status = TxStatus::Aborted;
        stats::abort();
        self.notify(TxEvent::PostAbort);
    }

    /// Aborts and blocks until one of the references read by this transaction is changed by
    /// another transaction, or the configured timeout elapses.
    #[inline]
    pub fn retry(&mut self) -> Result<(), TxError> {
        let timeout = self.config.timeout;
        self.retry_with_timeout(timeout)
    }

    /// Like [`retry`](#method.retry), with an explicit timeout.
    pub fn retry_with_timeout(&mut self, timeout: Option<Duration>) -> Result<(), TxError> {
        self.check_alive()?;
        if !self.config.blocking_allowed {
            return Err(self.fail(TxError::RetryNotAllowed));
        }
        if !self.storage.has_observations() {
            return Err(self.fail(TxError::RetryNotPossible));
        }
        let latch = Arc::new(RetryLatch::new());
        let registered = self.storage.register_retry_latch(&latch);
        self.abort_internal();

        stats::retry_park();
        debug!(family = %self.config.family_name, registered, "transaction blocked");
        if latch.await_open(timeout) {
            Ok(())
        } else {
            Err(self.fail(TxError::RetryTimeout))
        }
    }

    #[cfg(test)]
    pub(crate) fn set_evaluating_commute(&mut self, evaluating_commute: bool) {
        self.evaluating_commute = evaluating_commute
    }
}
