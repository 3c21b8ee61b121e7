//! The orec ("ownable reference") is the concurrency control header embedded in every `TRef`.
//!
//! All of the shared state except the committed version is packed into a single `u64` so that
//! every transition (arrive, depart, lock, upgrade, unlock) is one compare exchange:
//!
//! ```text
//!  63   62..54          53..52     51..32            31..0
//! bias  readonly count  lock mode  read lock count   surplus
//! ```
//!
//! - `surplus` counts the parties that have arrived and not yet departed. While read biased, one
//!   unit of surplus is a "phantom" left behind by the reader that flipped the bias. It stands in
//!   for the readers that no longer register.
//! - `lock mode` is one of None, Read, Write or Exclusive; `read lock count` is only non zero in
//!   Read mode.
//! - `readonly count` counts consecutive read only departures and saturates.
//!
//! The committed version lives next to the word. It is only ever stored while the value lock of
//! the owning `TRef` is held for writing, which is what makes (value, version) pairs consistent.

use crate::tx::LockMode;
use core::{
    fmt::{self, Debug, Formatter},
    sync::atomic::{
        AtomicU64,
        Ordering::{AcqRel, Acquire, Relaxed, Release},
    },
};
use crossbeam_utils::Backoff;

type Word = u64;

const SURPLUS_MASK: Word = 0xFFFF_FFFF;

const READ_LOCK_SHIFT: u32 = 32;
const READ_LOCK_MAX: Word = 0xF_FFFF;
const READ_LOCK_MASK: Word = READ_LOCK_MAX << READ_LOCK_SHIFT;

const LOCK_MODE_SHIFT: u32 = 52;
const LOCK_MODE_MASK: Word = 0b11 << LOCK_MODE_SHIFT;

const READONLY_SHIFT: u32 = 54;
const READONLY_MAX: Word = 0x1FF;
const READONLY_MASK: Word = READONLY_MAX << READONLY_SHIFT;

const READ_BIASED_BIT: Word = 1 << 63;

/// Version of a reference that was constructed, but whose constructing transaction has not
/// committed.
pub const VERSION_UNCOMMITTED: u64 = 0;

/// Version of a freshly committed reference.
pub const VERSION_FIRST: u64 = 1;

#[inline]
const fn surplus(w: Word) -> Word {
    w & SURPLUS_MASK
}

#[inline]
const fn with_surplus(w: Word, surplus: Word) -> Word {
    (w & !SURPLUS_MASK) | surplus
}

#[inline]
const fn read_lock_count(w: Word) -> Word {
    (w & READ_LOCK_MASK) >> READ_LOCK_SHIFT
}

#[inline]
const fn with_read_lock_count(w: Word, count: Word) -> Word {
    (w & !READ_LOCK_MASK) | (count << READ_LOCK_SHIFT)
}

#[inline]
const fn lock_mode(w: Word) -> LockMode {
    LockMode::from_bits((w & LOCK_MODE_MASK) >> LOCK_MODE_SHIFT)
}

#[inline]
const fn with_lock_mode(w: Word, mode: LockMode) -> Word {
    (w & !LOCK_MODE_MASK) | (mode.to_bits() << LOCK_MODE_SHIFT)
}

#[inline]
const fn readonly_count(w: Word) -> Word {
    (w & READONLY_MASK) >> READONLY_SHIFT
}

#[inline]
const fn with_readonly_count(w: Word, count: Word) -> Word {
    (w & !READONLY_MASK) | (count << READONLY_SHIFT)
}

#[inline]
const fn is_read_biased(w: Word) -> bool {
    w & READ_BIASED_BIT != 0
}

/// Can `mode` be granted to a party that does not hold any lock yet?
#[inline]
fn lock_compatible(w: Word, mode: LockMode) -> bool {
    match mode {
        LockMode::None => lock_mode(w) != LockMode::Exclusive,
        LockMode::Read => match lock_mode(w) {
            LockMode::None => true,
            LockMode::Read => read_lock_count(w) < READ_LOCK_MAX,
            _ => false,
        },
        LockMode::Write | LockMode::Exclusive => lock_mode(w) == LockMode::None,
    }
}

#[inline]
fn with_lock_acquired(w: Word, mode: LockMode) -> Word {
    match mode {
        LockMode::None => w,
        LockMode::Read => with_lock_mode(
            with_read_lock_count(w, read_lock_count(w) + 1),
            LockMode::Read,
        ),
        LockMode::Write | LockMode::Exclusive => with_lock_mode(w, mode),
    }
}

#[inline]
fn with_lock_released(w: Word, mode: LockMode) -> Word {
    match mode {
        LockMode::None => w,
        LockMode::Read => {
            let count = read_lock_count(w);
            invariant!(
                lock_mode(w) == LockMode::Read && count > 0,
                "releasing a read lock that is not held ({:?})",
                OrecWord(w)
            );
            let w = with_read_lock_count(w, count - 1);
            if count == 1 {
                with_lock_mode(w, LockMode::None)
            } else {
                w
            }
        }
        LockMode::Write | LockMode::Exclusive => {
            invariant!(
                lock_mode(w) == mode,
                "releasing a {:?} lock that is not held ({:?})",
                mode,
                OrecWord(w)
            );
            with_lock_mode(w, LockMode::None)
        }
    }
}

#[inline]
fn departed(w: Word) -> Word {
    let s = surplus(w);
    invariant!(s > 0, "surplus underflow ({:?})", OrecWord(w));
    with_surplus(w, s - 1)
}

/// Outcome of [`Orec::arrive`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Arrive {
    /// Surplus was incremented; the caller must depart exactly once.
    Normal,

    /// The orec is read biased; nothing was registered and the caller must not depart.
    Unregistered,

    /// The orec is exclusively locked, or the word was too contended to register on.
    LockedOut,
}

pub struct Orec {
    word:    AtomicU64,
    version: AtomicU64,
}

struct OrecWord(Word);

impl Debug for OrecWord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let w = self.0;
        f.debug_struct("Orec")
            .field("surplus", &surplus(w))
            .field("lock_mode", &lock_mode(w))
            .field("read_lock_count", &read_lock_count(w))
            .field("readonly_count", &readonly_count(w))
            .field("read_biased", &is_read_biased(w))
            .finish()
    }
}

impl Debug for Orec {
    #[inline(never)]
    #[cold]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let w = self.word.load(Relaxed);
        f.debug_struct("Orec")
            .field("version", &self.version.load(Relaxed))
            .field("surplus", &surplus(w))
            .field("lock_mode", &lock_mode(w))
            .field("read_lock_count", &read_lock_count(w))
            .field("readonly_count", &readonly_count(w))
            .field("read_biased", &is_read_biased(w))
            .finish()
    }
}

impl Orec {
    /// A quiescent, committed orec.
    #[inline]
    pub const fn new() -> Self {
        Orec {
            word:    AtomicU64::new(0),
            version: AtomicU64::new(VERSION_FIRST),
        }
    }

    /// An orec born exclusively locked by its constructing transaction, which holds one unit of
    /// surplus.
    #[inline]
    pub const fn constructing() -> Self {
        Orec {
            word:    AtomicU64::new(with_lock_mode(1, LockMode::Exclusive)),
            version: AtomicU64::new(VERSION_UNCOMMITTED),
        }
    }

    #[inline]
    fn load(&self) -> Word {
        self.word.load(Acquire)
    }

    #[inline]
    fn cas(&self, current: Word, new: Word) -> Result<Word, Word> {
        self.word.compare_exchange_weak(current, new, AcqRel, Acquire)
    }

    /// Applies `f` until the compare exchange succeeds. Used for transitions that must not fail.
    #[inline]
    fn update(&self, mut f: impl FnMut(Word) -> Word) -> Word {
        let backoff = Backoff::new();
        let mut current = self.load();
        loop {
            match self.cas(current, f(current)) {
                Ok(prev) => return prev,
                Err(actual) => {
                    current = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Registers the caller as an observer of this reference.
    ///
    /// Plain reads of a read biased orec are not registered. An exclusive lock locks everybody
    /// out immediately; losing more than `spins` compare exchanges in a row also reports
    /// `LockedOut`.
    pub fn arrive(&self, for_update: bool, spins: u32) -> Arrive {
        let backoff = Backoff::new();
        let mut current = self.load();
        let mut attempts = 0;
        loop {
            if lock_mode(current) == LockMode::Exclusive {
                return Arrive::LockedOut;
            }
            if is_read_biased(current) && !for_update {
                return Arrive::Unregistered;
            }
            let s = surplus(current);
            invariant!(s < SURPLUS_MASK, "surplus overflow ({:?})", OrecWord(current));
            match self.cas(current, with_surplus(current, s + 1)) {
                Ok(_) => return Arrive::Normal,
                Err(actual) => {
                    attempts += 1;
                    if unlikely!(attempts > spins) {
                        return Arrive::LockedOut;
                    }
                    current = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Arrives and acquires `mode` in one step.
    #[must_use]
    pub fn arrive_and_lock(&self, mode: LockMode, spins: u32) -> bool {
        self.try_transition(spins, |w| {
            if lock_compatible(w, mode) {
                let s = surplus(w);
                invariant!(s < SURPLUS_MASK, "surplus overflow ({:?})", OrecWord(w));
                Some(with_surplus(with_lock_acquired(w, mode), s + 1))
            } else {
                None
            }
        })
    }

    /// Acquires `mode` for a party that already arrived and holds no lock.
    #[must_use]
    pub fn try_lock_after_arrive(&self, mode: LockMode, spins: u32) -> bool {
        self.try_transition(spins, |w| {
            if lock_compatible(w, mode) {
                invariant!(surplus(w) > 0, "locking without arriving ({:?})", OrecWord(w));
                Some(with_lock_acquired(w, mode))
            } else {
                None
            }
        })
    }

    /// Escalates a lock held by the caller from `from` to `to`.
    ///
    /// A read lock can only be escalated by the last remaining reader; a write lock always
    /// escalates to exclusive since no one else can hold anything but a plain observation.
    #[must_use]
    pub fn upgrade_lock(&self, from: LockMode, to: LockMode, spins: u32) -> bool {
        debug_assert!(from <= to, "lock downgrade requested");
        if from == to {
            return true;
        }
        match from {
            LockMode::None => self.try_lock_after_arrive(to, spins),
            LockMode::Read => {
                if to == LockMode::Read {
                    return true;
                }
                self.try_transition(spins, |w| {
                    invariant!(
                        lock_mode(w) == LockMode::Read && read_lock_count(w) > 0,
                        "upgrading a read lock that is not held ({:?})",
                        OrecWord(w)
                    );
                    if read_lock_count(w) == 1 {
                        Some(with_lock_mode(with_read_lock_count(w, 0), to))
                    } else {
                        None
                    }
                })
            }
            LockMode::Write => {
                drop(self.update(|w| {
                    invariant!(
                        lock_mode(w) == LockMode::Write,
                        "upgrading a write lock that is not held ({:?})",
                        OrecWord(w)
                    );
                    with_lock_mode(w, to)
                }));
                true
            }
            LockMode::Exclusive => true,
        }
    }

    #[inline]
    fn try_transition(&self, spins: u32, f: impl Fn(Word) -> Option<Word>) -> bool {
        let backoff = Backoff::new();
        let mut current = self.load();
        let mut attempts = 0;
        loop {
            let new = match f(current) {
                Some(new) => new,
                // an incompatible lock is a conflict, not contention
                None => return false,
            };
            match self.cas(current, new) {
                Ok(_) => return true,
                Err(actual) => {
                    attempts += 1;
                    if unlikely!(attempts > spins) {
                        return false;
                    }
                    current = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Plain departure, without any bookkeeping.
    #[inline]
    pub fn depart(&self) {
        drop(self.update(departed))
    }

    /// Departure of a party that only read. Counts towards the read bias and may flip the orec to
    /// read biased, in which case the departing unit of surplus stays behind as the phantom.
    pub fn depart_after_reading(&self, threshold: u32) {
        drop(self.update(|w| Self::readonly_departure(w, threshold)))
    }

    /// Releases `mode` and departs as a reader.
    pub fn depart_after_reading_and_unlock(&self, mode: LockMode, threshold: u32) {
        drop(self.update(|w| Self::readonly_departure(with_lock_released(w, mode), threshold)))
    }

    #[inline]
    fn readonly_departure(w: Word, threshold: u32) -> Word {
        let s = surplus(w);
        invariant!(s > 0, "surplus underflow ({:?})", OrecWord(w));
        let count = (readonly_count(w) + 1).min(READONLY_MAX);
        let w = with_readonly_count(w, count);
        if !is_read_biased(w) && threshold > 0 && count >= threshold as Word {
            w | READ_BIASED_BIT
        } else {
            with_surplus(w, s - 1)
        }
    }

    /// Departure after an abort. Does not count as a read.
    pub fn depart_after_failure(&self) {
        self.depart()
    }

    /// Releases `mode` and departs after an abort.
    pub fn depart_after_failure_and_unlock(&self, mode: LockMode) {
        drop(self.update(|w| departed(with_lock_released(w, mode))))
    }

    /// Releases `mode` and departs after publishing a new version. Any write reverts the orec to
    /// write biased, dropping the phantom surplus if there was one.
    pub fn depart_after_update_and_unlock(&self, mode: LockMode) {
        drop(self.update(|w| {
            let biased = is_read_biased(w);
            let mut w = departed(with_lock_released(w, mode));
            if biased {
                w = departed(w & !READ_BIASED_BIT);
            }
            with_readonly_count(w, 0)
        }))
    }

    /// True if a tranlocal that observed `observed_version` while holding `held` can no longer
    /// trust its read. Locks held by the caller pin the version. Other parties' read and write
    /// locks do not invalidate a read, an exclusive lock does.
    #[inline]
    pub fn has_read_conflict(&self, observed_version: u64, held: LockMode) -> bool {
        if held != LockMode::None {
            return false;
        }
        if lock_mode(self.load()) == LockMode::Exclusive {
            return true;
        }
        self.version() != observed_version
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Acquire)
    }

    /// Stores a new committed version. Must only be called by the exclusive lock holder, while
    /// holding the value lock, after the value has been written.
    #[inline]
    pub fn publish_version(&self, version: u64) {
        debug_assert!(
            self.lock_mode() == LockMode::Exclusive,
            "publishing a version without holding the exclusive lock"
        );
        self.version.store(version, Release)
    }

    #[inline]
    pub fn lock_mode(&self) -> LockMode {
        lock_mode(self.load())
    }

    #[inline]
    pub fn surplus(&self) -> u32 {
        surplus(self.load()) as u32
    }

    #[inline]
    pub fn read_lock_count(&self) -> u32 {
        read_lock_count(self.load()) as u32
    }

    #[inline]
    pub fn readonly_count(&self) -> u32 {
        readonly_count(self.load()) as u32
    }

    #[inline]
    pub fn is_read_biased(&self) -> bool {
        is_read_biased(self.load())
    }
}
