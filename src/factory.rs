//! Creating transactions: [`TxFactory`] and the reuse pool [`TxPool`].
//!
//! A factory owns a frozen [`TxConfig`] and the [`SpeculativeConfig`] its transactions learn
//! into. When speculation is on, it hands out the cheapest transaction that has not yet been
//! proven insufficient. A transaction that fails with
//! [`TxError::SpeculativeConfiguration`](crate::tx::TxError::SpeculativeConfiguration) is traded
//! in through [`TxFactory::upgrade_after_speculative_failure`].

use crate::{
    config::{ConfigError, SpeculativeConfig, TxConfig},
    stats,
    stm::Stm,
    transaction::Transaction,
    tx::{TxFlavor, TxShape},
};
use core::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use tracing::debug;

/// Transactions kept per shape. Past this, returned transactions are dropped.
const POOL_DEPTH: usize = 4;

/// Dead transactions waiting to be reused, one free list per shape.
///
/// A pool is owned by whoever runs transactions, typically one per thread. Nothing about it is
/// global.
#[derive(Default)]
pub struct TxPool {
    mono:     Vec<Transaction>,
    fixed:    Vec<Transaction>,
    variable: Vec<Transaction>,
}

impl Debug for TxPool {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TxPool")
            .field("mono", &self.mono.len())
            .field("fixed", &self.fixed.len())
            .field("variable", &self.variable.len())
            .finish()
    }
}

impl TxPool {
    #[inline]
    pub fn new() -> Self {
        Default::default()
    }

    #[inline]
    fn list(&mut self, shape: TxShape) -> &mut Vec<Transaction> {
        match shape {
            TxShape::Mono => &mut self.mono,
            TxShape::Fixed => &mut self.fixed,
            TxShape::Variable => &mut self.variable,
        }
    }

    /// Number of pooled transactions of `shape`.
    #[inline]
    pub fn len(&self, shape: TxShape) -> usize {
        match shape {
            TxShape::Mono => self.mono.len(),
            TxShape::Fixed => self.fixed.len(),
            TxShape::Variable => self.variable.len(),
        }
    }

    #[inline]
    fn take(&mut self, shape: TxShape) -> Option<Transaction> {
        self.list(shape).pop()
    }

    /// Returns a transaction for reuse. A live transaction is aborted first.
    pub fn put(&mut self, mut tx: Transaction) {
        tx.hard_reset();
        let list = self.list(tx.shape());
        if list.len() < POOL_DEPTH {
            list.push(tx)
        }
    }
}

/// Creates transactions sharing one configuration.
#[derive(Clone)]
pub struct TxFactory {
    stm:         Stm,
    config:      Arc<TxConfig>,
    speculative: Arc<SpeculativeConfig>,
}

impl Debug for TxFactory {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TxFactory")
            .field("config", &self.config)
            .field("speculative", &self.speculative)
            .finish()
    }
}

impl TxFactory {
    /// Validates and freezes `config`.
    pub fn new(stm: &Stm, config: TxConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(TxFactory {
            stm:         stm.clone(),
            config:      Arc::new(config),
            speculative: Arc::new(SpeculativeConfig::new()),
        })
    }

    #[inline]
    pub(crate) fn from_parts(
        stm: Stm,
        config: Arc<TxConfig>,
        speculative: Arc<SpeculativeConfig>,
    ) -> Self {
        TxFactory {
            stm,
            config,
            speculative,
        }
    }

    #[inline]
    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    #[inline]
    pub fn speculative(&self) -> &SpeculativeConfig {
        &self.speculative
    }

    #[inline]
    pub fn stm(&self) -> &Stm {
        &self.stm
    }

    /// The cheapest shape and flavor not yet proven insufficient.
    pub fn choose(&self) -> (TxShape, TxFlavor) {
        if !self.config.speculative {
            return (TxShape::Variable, TxFlavor::Fat);
        }
        let length = self.speculative.minimal_length();
        let shape = if length <= 1 {
            TxShape::Mono
        } else if length <= self.config.max_fixed_length_transaction_size {
            TxShape::Fixed
        } else {
            TxShape::Variable
        };
        let flavor = if self.speculative.is_fat_required() {
            TxFlavor::Fat
        } else {
            TxFlavor::Lean
        };
        (shape, flavor)
    }

    #[inline]
    pub fn new_transaction(&self) -> Transaction {
        let (shape, flavor) = self.choose();
        Transaction::new(
            self.stm.clone(),
            self.config.clone(),
            self.speculative.clone(),
            shape,
            flavor,
        )
    }

    /// Like [`new_transaction`](#method.new_transaction), reusing a pooled transaction of the
    /// right shape if there is one.
    pub fn new_transaction_from(&self, pool: &mut TxPool) -> Transaction {
        let (shape, flavor) = self.choose();
        match pool.take(shape) {
            Some(mut tx)
                if shape != TxShape::Fixed
                    || tx.config().max_fixed_length_transaction_size
                        == self.config.max_fixed_length_transaction_size =>
            {
                stats::pool_hit();
                tx.init(
                    self.stm.clone(),
                    self.config.clone(),
                    self.speculative.clone(),
                    flavor,
                );
                tx
            }
            _ => {
                stats::pool_miss();
                Transaction::new(
                    self.stm.clone(),
                    self.config.clone(),
                    self.speculative.clone(),
                    shape,
                    flavor,
                )
            }
        }
    }

    /// Trades a transaction that failed speculatively for one that supports what it tried to do.
    ///
    /// The failure has already been recorded in the shared speculative configuration, so every
    /// later transaction of this factory starts out at least as capable.
    pub fn upgrade_after_speculative_failure(
        &self,
        failed: Transaction,
        pool: &mut TxPool,
    ) -> Transaction {
        let (from_shape, from_flavor) = (failed.shape(), failed.flavor());
        pool.put(failed);
        let tx = self.new_transaction_from(pool);
        debug!(
            family = %self.config.family_name,
            ?from_shape,
            ?from_flavor,
            to_shape = ?tx.shape(),
            to_flavor = ?tx.flavor(),
            "speculative upgrade"
        );
        tx
    }
}
