//! The [`Stm`] instance and the atomic block runner [`TxExecutor`].
//!
//! An `Stm` ties references and transactions together: it owns the global conflict counter they
//! validate against and the default configuration. References of one `Stm` can not be used by
//! transactions of another.
//!
//! # Examples
//!
//! ```
//! use reftx::{stm::Stm, tref::TRef};
//!
//! let stm = Stm::new();
//! let a = TRef::new(&stm, 1);
//! let b = TRef::new(&stm, 2);
//! stm.atomic(|tx| {
//!     let temp = a.get(tx)?;
//!     let b_val = b.get(tx)?;
//!     a.set(tx, b_val)?;
//!     b.set(tx, temp)
//! })
//! .unwrap();
//! assert_eq!(a.atomic_get(), Ok(2));
//! assert_eq!(b.atomic_get(), Ok(1));
//! ```

use crate::{
    config::{ConfigError, SpeculativeConfig, TxConfig},
    factory::{TxFactory, TxPool},
    internal::conflict::GlobalConflictCounter,
    stats,
    transaction::Transaction,
    tref::TRef,
    tx::{TValue, TxError},
};
use core::fmt::{self, Debug, Formatter};
use crossbeam_utils::Backoff;
use std::sync::Arc;
use tracing::{trace, warn};

struct StmInner {
    counter:     GlobalConflictCounter,
    config:      Arc<TxConfig>,
    speculative: Arc<SpeculativeConfig>,
}

/// A transactional memory instance. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Stm(Arc<StmInner>);

impl Debug for Stm {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Stm")
            .field("conflict_count", &self.0.counter.count())
            .field("config", &self.0.config)
            .finish()
    }
}

impl Default for Stm {
    #[inline]
    fn default() -> Self {
        Stm::new()
    }
}

impl Stm {
    /// Creates an instance with the default configuration.
    pub fn new() -> Self {
        Stm(Arc::new(StmInner {
            counter:     GlobalConflictCounter::new(),
            config:      Arc::new(TxConfig::default()),
            speculative: Arc::new(SpeculativeConfig::new()),
        }))
    }

    /// Creates an instance whose default transactions use `config`.
    pub fn with_config(config: TxConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Stm(Arc::new(StmInner {
            counter:     GlobalConflictCounter::new(),
            config:      Arc::new(config),
            speculative: Arc::new(SpeculativeConfig::new()),
        })))
    }

    /// The default configuration. Also used by the atomic operations of references.
    #[inline]
    pub fn config(&self) -> &TxConfig {
        &self.0.config
    }

    #[inline]
    pub(crate) fn conflict_counter(&self) -> &GlobalConflictCounter {
        &self.0.counter
    }

    /// Number of write commits so far.
    #[inline]
    pub fn global_conflict_count(&self) -> u64 {
        self.0.counter.count()
    }

    #[inline]
    pub(crate) fn same(&self, rhs: &Stm) -> bool {
        Arc::ptr_eq(&self.0, &rhs.0)
    }

    /// The factory for default transactions. All default factories of an `Stm` share their
    /// speculative configuration.
    #[inline]
    pub fn factory(&self) -> TxFactory {
        TxFactory::from_parts(
            self.clone(),
            self.0.config.clone(),
            self.0.speculative.clone(),
        )
    }

    /// A factory with its own configuration and speculative state.
    #[inline]
    pub fn factory_with(&self, config: TxConfig) -> Result<TxFactory, ConfigError> {
        TxFactory::new(self, config)
    }

    #[inline]
    pub fn executor(&self) -> TxExecutor {
        TxExecutor::new(self.factory())
    }

    #[inline]
    pub fn new_transaction(&self) -> Transaction {
        self.factory().new_transaction()
    }

    #[inline]
    pub fn new_tref<T: TValue>(&self, value: T) -> TRef<T> {
        TRef::new(self, value)
    }

    /// Runs `f` as an atomic block with the default configuration. See [`TxExecutor::atomic`].
    #[inline]
    pub fn atomic<F, O>(&self, f: F) -> Result<O, TxError>
    where
        F: FnMut(&mut Transaction) -> Result<O, TxError>,
    {
        self.executor().atomic(f)
    }
}

/// Runs closures as transactions until they commit.
#[derive(Clone, Debug)]
pub struct TxExecutor {
    factory: TxFactory,
}

impl TxExecutor {
    #[inline]
    pub fn new(factory: TxFactory) -> Self {
        TxExecutor { factory }
    }

    #[inline]
    pub fn factory(&self) -> &TxFactory {
        &self.factory
    }

    /// Runs `f` in a transaction and commits it.
    ///
    /// - On a conflict the transaction is thrown away and `f` runs again in a fresh one, after an
    ///   exponential backoff.
    /// - If `f` returns [`TxError::Retry`], the thread blocks until something `f` read changes,
    ///   then `f` runs again.
    /// - On a speculative failure `f` runs again in a transaction that supports what it needs.
    /// - Any other error is returned.
    ///
    /// Gives up with [`TxError::TooManyRetries`] after `max_retries` attempts.
    ///
    /// # Examples
    ///
    /// ```
    /// use reftx::{stm::Stm, tref::TRef};
    ///
    /// let stm = Stm::new();
    /// let x = TRef::new(&stm, String::from("gonna be overwritten"));
    /// let prev_x = stm
    ///     .executor()
    ///     .atomic(|tx| x.get_and_set(tx, "overwritten".to_owned()))
    ///     .unwrap();
    /// assert_eq!(prev_x, "gonna be overwritten");
    /// ```
    #[inline]
    pub fn atomic<F, O>(&self, f: F) -> Result<O, TxError>
    where
        F: FnMut(&mut Transaction) -> Result<O, TxError>,
    {
        let mut pool = TxPool::new();
        self.atomic_with(&mut pool, f)
    }

    /// Like [`atomic`](#method.atomic), drawing transactions from `pool`.
    pub fn atomic_with<F, O>(&self, pool: &mut TxPool, mut f: F) -> Result<O, TxError>
    where
        F: FnMut(&mut Transaction) -> Result<O, TxError>,
    {
        let factory = &self.factory;
        let max_retries = factory.config().max_retries;
        let backoff = Backoff::new();
        let mut tx = factory.new_transaction_from(pool);
        for attempt in 0..max_retries {
            let result = match f(&mut tx) {
                Ok(o) => tx.commit().map(|()| o),
                Err(error) => Err(error),
            };
            match result {
                Ok(o) => {
                    stats::transaction_retries(attempt);
                    pool.put(tx);
                    return Ok(o);
                }
                Err(TxError::Retry) => match tx.retry() {
                    Ok(()) => {}
                    Err(error) => {
                        pool.put(tx);
                        // the observations died with the transaction
                        if error == TxError::DeadTransaction {
                            return Err(TxError::RetryNotPossible);
                        }
                        return Err(error);
                    }
                },
                Err(error) if error.is_conflict() => {
                    trace!(family = %factory.config().family_name, attempt, "conflict, backing off");
                    backoff.snooze();
                }
                Err(TxError::SpeculativeConfiguration(_)) => {
                    tx = factory.upgrade_after_speculative_failure(tx, pool);
                    continue;
                }
                Err(error) => {
                    pool.put(tx);
                    return Err(error);
                }
            }
            pool.put(tx);
            tx = factory.new_transaction_from(pool);
        }
        pool.put(tx);
        warn!(
            family = %factory.config().family_name,
            max_retries,
            "giving up on transaction"
        );
        Err(TxError::TooManyRetries(max_retries))
    }
}

#[cfg(test)]
mod test {
    use crate::{
        config::TxConfig,
        factory::TxPool,
        stm::Stm,
        tref::TRef,
        tx::{LockMode, TxError, TxFlavor},
    };
    use std::time::Duration;

    #[test]
    fn atomic_commits() {
        let stm = Stm::new();
        let x = stm.new_tref(1);
        let r = stm.atomic(|tx| x.alter_and_get(tx, |x| x + 1)).unwrap();
        assert_eq!(r, 2);
        assert_eq!(x.atomic_get(), Ok(2));
    }

    #[test]
    fn speculative_failures_are_retried() {
        let stm = Stm::new();
        let x = stm.new_tref(1);
        let mut flavors = Vec::new();
        stm.atomic(|tx| {
            flavors.push(tx.flavor());
            x.ensure(tx)
        })
        .unwrap();
        assert_eq!(flavors, vec![TxFlavor::Lean, TxFlavor::Fat]);
        assert!(stm.factory().speculative().is_locks_detected());
        assert_eq!(x.lock_mode(), LockMode::None);
    }

    #[test]
    fn user_errors_are_returned() {
        let stm = Stm::new();
        let x = stm.new_tref(1);
        let result: Result<(), _> = stm.atomic(|tx| {
            x.set(tx, 5)?;
            Err(TxError::AbortOnly)
        });
        assert_eq!(result, Err(TxError::AbortOnly));
        assert_eq!(x.atomic_get(), Ok(1));
        assert_eq!(x.surplus(), 0);
    }

    #[test]
    fn too_many_retries() {
        let stm = Stm::with_config(TxConfig::new().with_max_retries(3)).unwrap();
        let x = stm.new_tref(1);
        let mut attempts = 0;
        let result: Result<(), _> = stm.atomic(|tx| {
            attempts += 1;
            x.get(tx)?;
            Err(TxError::ReadWriteConflict)
        });
        assert_eq!(result, Err(TxError::TooManyRetries(3)));
        assert_eq!(attempts, 3);
        assert_eq!(x.surplus(), 0);
    }

    #[test]
    fn retry_timeout() {
        let stm = Stm::with_config(TxConfig::new().with_timeout(Some(Duration::from_millis(10))))
            .unwrap();
        let x = stm.new_tref(false);
        let result = stm.atomic(|tx| x.await_until(tx, |x| *x));
        assert_eq!(result, Err(TxError::RetryTimeout));
    }

    #[test]
    fn retry_not_possible() {
        let stm = Stm::new();
        let result: Result<(), _> = stm.atomic(|_| Err(TxError::Retry));
        assert_eq!(result, Err(TxError::RetryNotPossible));
    }

    #[test]
    fn retry_after_abort() {
        let stm = Stm::new();
        let x = stm.new_tref(1);
        let mut attempts = 0;
        let result: Result<(), _> = stm.atomic(|tx| {
            attempts += 1;
            x.get(tx)?;
            drop(tx.abort());
            Err(TxError::Retry)
        });
        assert_eq!(result, Err(TxError::RetryNotPossible));
        assert_eq!(attempts, 1);
        assert_eq!(x.surplus(), 0);
    }

    #[test]
    fn pooled_executor() {
        let stm = Stm::new();
        let x = stm.new_tref(0);
        let executor = stm.executor();
        let mut pool = TxPool::new();
        for _ in 0..10 {
            executor
                .atomic_with(&mut pool, |tx| x.alter_and_get(tx, |x| x + 1))
                .unwrap();
        }
        assert_eq!(x.atomic_get(), Ok(10));
    }
}
