//! Functionality for working with transactions: errors, lock modes, lifecycle events.

use crate::transaction::Transaction;
use core::fmt::{self, Debug, Formatter};
use thiserror::Error;

/// Types which can be stored in a [`TRef`](crate::tref::TRef).
///
/// `PartialEq` is used for dirty checking: a write of a value equal to the one read is not
/// published.
pub trait TValue: Clone + PartialEq + Send + Sync + 'static {}
impl<T: Clone + PartialEq + Send + Sync + 'static> TValue for T {}

/// The lock a transaction holds (or asks for) on a reference.
///
/// Modes are ordered; a transaction only ever escalates.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    /// Optimistic access, validated by version.
    None,

    /// Shared lock. Compatible with other `Read` locks, blocks writers from locking.
    Read,

    /// Single writer lock. Plain readers can still read the committed value.
    Write,

    /// Single owner lock. Nobody else can read or lock.
    Exclusive,
}

impl Default for LockMode {
    #[inline]
    fn default() -> Self {
        LockMode::None
    }
}

impl LockMode {
    #[inline]
    pub(crate) const fn to_bits(self) -> u64 {
        match self {
            LockMode::None => 0,
            LockMode::Read => 1,
            LockMode::Write => 2,
            LockMode::Exclusive => 3,
        }
    }

    #[inline]
    pub(crate) const fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0 => LockMode::None,
            1 => LockMode::Read,
            2 => LockMode::Write,
            _ => LockMode::Exclusive,
        }
    }
}

/// How strictly reads are kept consistent with each other.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    /// Every read sees committed data, but reads of different references may come from
    /// different points in time. Pure reads are not revalidated at commit.
    ReadCommitted,

    /// Once read, a value never changes for the rest of the transaction, and all reads belong to
    /// one consistent snapshot.
    RepeatableRead,
}

impl Default for IsolationLevel {
    #[inline]
    fn default() -> Self {
        IsolationLevel::RepeatableRead
    }
}

/// Lifecycle state of a [`Transaction`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TxStatus {
    Active,
    Prepared,
    Committed,
    Aborted,
}

impl TxStatus {
    #[inline]
    pub fn is_alive(self) -> bool {
        match self {
            TxStatus::Active | TxStatus::Prepared => true,
            TxStatus::Committed | TxStatus::Aborted => false,
        }
    }
}

/// How a transaction stores its tranlocals.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TxShape {
    /// Exactly one reference.
    Mono,
    /// A small, fixed number of references, found by linear scan.
    Fixed,
    /// Any number of references, found through a hash index.
    Variable,
}

/// Which features a transaction supports.
///
/// A `Lean` transaction refuses explicit locks, listeners, `set_abort_only` and more than one
/// construction with [`TxError::SpeculativeConfiguration`]. A `Fat` transaction supports
/// everything.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TxFlavor {
    Lean,
    Fat,
}

/// Events delivered to a [`TxListener`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TxEvent {
    PrePrepare,
    PostCommit,
    PostAbort,
}

/// A lifecycle listener. Registered on one transaction with
/// [`Transaction::register`](crate::transaction::Transaction::register), or on every transaction
/// of a configuration with [`TxConfig::with_permanent_listener`](crate::config::TxConfig).
pub trait TxListener: Send + Sync {
    fn notify(&self, tx: &Transaction, event: TxEvent);
}

/// Why a lean or undersized transaction gave up.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SpeculativeReason {
    /// More distinct references were opened than the transaction shape can hold.
    Capacity,
    /// An explicit lock mode was requested.
    Locks,
    /// A listener was registered.
    Listeners,
    /// `set_abort_only` was called.
    AbortOnly,
    /// More than one reference was constructed.
    Constructions,
}

/// Errors and control flow signals surfaced by transactions and references.
///
/// Every error returned from a transactional operation has already aborted the transaction
/// (except [`TxError::Retry`] which is a request, and the errors raised by
/// [`TRef`](crate::tref::TRef)'s atomic operations, which run without one).
#[derive(Error, Clone, PartialEq, Eq)]
pub enum TxError {
    /// The transaction is already committed or aborted.
    #[error("transaction is dead")]
    DeadTransaction,

    /// The transaction is prepared and can no longer be used for reads, writes or listeners.
    #[error("transaction is prepared")]
    PreparedTransaction,

    /// Optimistic validation failed or an incompatible lock is held by another party.
    #[error("read write conflict")]
    ReadWriteConflict,

    /// An atomic (transaction free) operation found the reference locked.
    #[error("reference is locked")]
    Locked,

    /// A write, commute or construction was attempted in a readonly transaction.
    #[error("transaction is readonly")]
    Readonly,

    /// Commit was attempted after `set_abort_only`.
    #[error("transaction is abort only")]
    AbortOnly,

    /// The transaction does not support what was asked of it and must be retried with a richer
    /// one.
    #[error("speculative configuration failure: {0:?}")]
    SpeculativeConfiguration(SpeculativeReason),

    /// The transaction is evaluating a commute function.
    #[error("illegal operation while evaluating a commuting function")]
    IllegalCommute,

    /// `retry` on a transaction that has nothing to wait on.
    #[error("retry is not possible: nothing was read")]
    RetryNotPossible,

    /// `retry` on a transaction whose configuration does not allow blocking.
    #[error("blocking retry is not allowed")]
    RetryNotAllowed,

    /// A blocking retry ran out of time.
    #[error("retry timed out")]
    RetryTimeout,

    /// Request to block until something in the read set changes. Return this from the closure
    /// passed to [`TxExecutor::atomic`](crate::stm::TxExecutor::atomic).
    #[error("retry requested")]
    Retry,

    /// The reference belongs to a different [`Stm`](crate::stm::Stm).
    #[error("reference belongs to a different stm")]
    StmMismatch,

    /// `open_for_construction` on a reference that is not fresh.
    #[error("reference is not under construction by this transaction")]
    NotConstructable,

    /// The executor gave up.
    #[error("too many retries: {0}")]
    TooManyRetries(usize),
}

impl Debug for TxError {
    #[cold]
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, formatter)
    }
}

impl TxError {
    /// Returns true if running the transaction again from scratch may succeed.
    #[inline]
    pub fn is_conflict(&self) -> bool {
        match self {
            TxError::ReadWriteConflict | TxError::Locked => true,
            _ => false,
        }
    }

    #[inline]
    pub fn is_speculative(&self) -> bool {
        match self {
            TxError::SpeculativeConfiguration(_) => true,
            _ => false,
        }
    }
}
