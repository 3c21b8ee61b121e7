//! Transaction configuration.
//!
//! A [`TxConfig`] is built once, validated, and then frozen inside a
//! [`TxFactory`](crate::factory::TxFactory). Every transaction of that factory shares it, along
//! with a [`SpeculativeConfig`] that records what the transactions turned out to need.

use crate::tx::{IsolationLevel, LockMode, SpeculativeReason, TxListener};
use core::{
    fmt::{self, Debug, Formatter},
    sync::atomic::{
        AtomicBool, AtomicUsize,
        Ordering::{Relaxed, Release},
    },
};
use std::{borrow::Cow, sync::Arc, time::Duration};
use thiserror::Error;

/// Problems found by [`TxConfig::validate`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_fixed_length_transaction_size must be at least 1")]
    ZeroFixedLength,

    #[error("max_retries must be at least 1")]
    ZeroRetries,

    #[error("write_lock_mode ({write:?}) can not be weaker than read_lock_mode ({read:?})")]
    LockModeOrder { read: LockMode, write: LockMode },

    #[error("a readonly transaction can not take write_lock_mode {0:?}")]
    ReadonlyWriteLock(LockMode),
}

/// Options of a family of transactions.
#[derive(Clone)]
pub struct TxConfig {
    /// Writes, commutes and constructions fail with `Readonly`.
    pub readonly: bool,

    /// Whether `retry` may block the thread.
    pub blocking_allowed: bool,

    /// Writes of values equal to the value read are not published.
    pub dirty_check: bool,

    /// Number of opened references up to which an open only revalidates when the global
    /// conflict counter moved. Past it every open revalidates everything read. `0` revalidates
    /// on every open.
    pub maximum_poor_mans_conflict_scan_length: usize,

    /// Minimum lock taken by every read.
    pub read_lock_mode: LockMode,

    /// Minimum lock taken by every write.
    pub write_lock_mode: LockMode,

    pub isolation_level: IsolationLevel,

    /// Capacity of the `Fixed` transaction shape.
    pub max_fixed_length_transaction_size: usize,

    /// Listeners notified about every transaction of this configuration.
    pub permanent_listeners: Vec<Arc<dyn TxListener>>,

    /// When `false`, every control flow error is logged with its transaction context.
    pub control_flow_errors_reused: bool,

    /// Start with the cheapest transaction shape and learn from failures.
    pub speculative: bool,

    /// Consecutive read only departures that switch an orec to read biased. `0` disables read
    /// biasing.
    pub read_biased_threshold: u32,

    /// Compare exchange attempts before lock acquisition gives up on a contended orec.
    pub spin_count: u32,

    /// How long a blocking retry waits. `None` waits forever.
    pub timeout: Option<Duration>,

    /// Attempts the executor makes before failing with `TooManyRetries`.
    pub max_retries: usize,

    /// Name used in diagnostics.
    pub family_name: Cow<'static, str>,
}

impl Default for TxConfig {
    fn default() -> Self {
        TxConfig {
            readonly: false,
            blocking_allowed: true,
            dirty_check: true,
            maximum_poor_mans_conflict_scan_length: 20,
            read_lock_mode: LockMode::None,
            write_lock_mode: LockMode::None,
            isolation_level: IsolationLevel::RepeatableRead,
            max_fixed_length_transaction_size: 20,
            permanent_listeners: Vec::new(),
            control_flow_errors_reused: true,
            speculative: true,
            read_biased_threshold: 16,
            spin_count: 64,
            timeout: None,
            max_retries: 1000,
            family_name: Cow::Borrowed("anonymous"),
        }
    }
}

impl Debug for TxConfig {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TxConfig")
            .field("family_name", &self.family_name)
            .field("readonly", &self.readonly)
            .field("blocking_allowed", &self.blocking_allowed)
            .field("dirty_check", &self.dirty_check)
            .field(
                "maximum_poor_mans_conflict_scan_length",
                &self.maximum_poor_mans_conflict_scan_length,
            )
            .field("read_lock_mode", &self.read_lock_mode)
            .field("write_lock_mode", &self.write_lock_mode)
            .field("isolation_level", &self.isolation_level)
            .field(
                "max_fixed_length_transaction_size",
                &self.max_fixed_length_transaction_size,
            )
            .field("permanent_listeners", &self.permanent_listeners.len())
            .field("control_flow_errors_reused", &self.control_flow_errors_reused)
            .field("speculative", &self.speculative)
            .field("read_biased_threshold", &self.read_biased_threshold)
            .field("spin_count", &self.spin_count)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl TxConfig {
    #[inline]
    pub fn new() -> Self {
        Default::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_fixed_length_transaction_size == 0 {
            return Err(ConfigError::ZeroFixedLength);
        }
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroRetries);
        }
        if self.write_lock_mode < self.read_lock_mode {
            return Err(ConfigError::LockModeOrder {
                read:  self.read_lock_mode,
                write: self.write_lock_mode,
            });
        }
        if self.readonly && self.write_lock_mode > self.read_lock_mode {
            return Err(ConfigError::ReadonlyWriteLock(self.write_lock_mode));
        }
        Ok(())
    }

    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn with_blocking_allowed(mut self, blocking_allowed: bool) -> Self {
        self.blocking_allowed = blocking_allowed;
        self
    }

    pub fn with_dirty_check(mut self, dirty_check: bool) -> Self {
        self.dirty_check = dirty_check;
        self
    }

    pub fn with_maximum_poor_mans_conflict_scan_length(mut self, length: usize) -> Self {
        self.maximum_poor_mans_conflict_scan_length = length;
        self
    }

    pub fn with_read_lock_mode(mut self, mode: LockMode) -> Self {
        self.read_lock_mode = mode;
        self
    }

    pub fn with_write_lock_mode(mut self, mode: LockMode) -> Self {
        self.write_lock_mode = mode;
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn with_max_fixed_length_transaction_size(mut self, size: usize) -> Self {
        self.max_fixed_length_transaction_size = size;
        self
    }

    pub fn with_permanent_listener(mut self, listener: Arc<dyn TxListener>) -> Self {
        self.permanent_listeners.push(listener);
        self
    }

    pub fn with_control_flow_errors_reused(mut self, reused: bool) -> Self {
        self.control_flow_errors_reused = reused;
        self
    }

    pub fn with_speculative(mut self, speculative: bool) -> Self {
        self.speculative = speculative;
        self
    }

    pub fn with_read_biased_threshold(mut self, threshold: u32) -> Self {
        self.read_biased_threshold = threshold;
        self
    }

    pub fn with_spin_count(mut self, spin_count: u32) -> Self {
        self.spin_count = spin_count;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_family_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.family_name = name.into();
        self
    }
}

/// What the transactions of one factory have been observed to need.
///
/// Every flag only ever goes from `false` to `true`, and `minimal_length` only grows, so
/// concurrent updates never lose information.
#[derive(Debug, Default)]
pub struct SpeculativeConfig {
    locks_detected:         AtomicBool,
    listeners_detected:     AtomicBool,
    abort_only_detected:    AtomicBool,
    constructions_detected: AtomicBool,
    minimal_length:         AtomicUsize,
}

impl SpeculativeConfig {
    #[inline]
    pub fn new() -> Self {
        Default::default()
    }

    /// Records that a lean transaction hit `reason`.
    pub fn signal(&self, reason: SpeculativeReason) {
        let flag = match reason {
            SpeculativeReason::Capacity => return,
            SpeculativeReason::Locks => &self.locks_detected,
            SpeculativeReason::Listeners => &self.listeners_detected,
            SpeculativeReason::AbortOnly => &self.abort_only_detected,
            SpeculativeReason::Constructions => &self.constructions_detected,
        };
        flag.store(true, Release)
    }

    /// Records that a transaction needed room for at least `length` references.
    #[inline]
    pub fn signal_capacity(&self, length: usize) {
        drop(self.minimal_length.fetch_max(length, Release))
    }

    #[inline]
    pub fn minimal_length(&self) -> usize {
        self.minimal_length.load(Relaxed)
    }

    #[inline]
    pub fn is_locks_detected(&self) -> bool {
        self.locks_detected.load(Relaxed)
    }

    #[inline]
    pub fn is_listeners_detected(&self) -> bool {
        self.listeners_detected.load(Relaxed)
    }

    #[inline]
    pub fn is_abort_only_detected(&self) -> bool {
        self.abort_only_detected.load(Relaxed)
    }

    #[inline]
    pub fn is_constructions_detected(&self) -> bool {
        self.constructions_detected.load(Relaxed)
    }

    /// True once anything only a fat transaction supports has been seen.
    #[inline]
    pub fn is_fat_required(&self) -> bool {
        self.is_locks_detected()
            || self.is_listeners_detected()
            || self.is_abort_only_detected()
            || self.is_constructions_detected()
    }
}
