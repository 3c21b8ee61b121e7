//! Statistics collection. Enabled with `--features stats`.

use core::{
    cell::RefCell,
    fmt::{self, Debug, Formatter},
    ops::Deref,
};
use parking_lot::Mutex;

#[derive(Copy, Clone, Default, Debug)]
struct MinMaxTotal {
    min:   u64,
    max:   u64,
    total: u64,
}

#[doc(hidden)]
#[derive(Default)]
pub struct Size {
    min_max_total: Option<MinMaxTotal>,
    count:         u64,
}

impl Debug for Size {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Size")
            .field("count", &self.count)
            .field("min", &self.min_max_total.map(|x| x.min))
            .field("max", &self.min_max_total.map(|x| x.max))
            .field("total", &self.min_max_total.map(|x| x.total))
            .field(
                "avg",
                &self
                    .min_max_total
                    .map(|x| x.total as f64 / self.count as f64),
            )
            .finish()
    }
}

impl Size {
    fn record(&mut self, size: u64) {
        self.count += 1;
        if let Some(ref mut min_max_total) = &mut self.min_max_total {
            min_max_total.min = min_max_total.min.min(size);
            min_max_total.max = min_max_total.max.max(size);
            min_max_total.total += size;
        } else {
            self.min_max_total = Some(MinMaxTotal {
                min:   size,
                max:   size,
                total: size,
            });
        }
    }

    fn merge(&mut self, rhs: &Self) {
        self.count += rhs.count;
        self.min_max_total = match (self.min_max_total, rhs.min_max_total) {
            (Some(a), Some(b)) => Some(MinMaxTotal {
                min:   a.min.min(b.min),
                max:   a.max.max(b.max),
                total: a.total + b.total,
            }),
            (a, b) => a.or(b),
        };
    }

    /// Number of samples.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum of all samples.
    pub fn total(&self) -> u64 {
        self.min_max_total.unwrap_or_default().total
    }
}

#[doc(hidden)]
#[derive(Default, Debug)]
pub struct Event {
    count: u64,
}

impl Event {
    fn happened(&mut self) {
        self.count += 1
    }

    fn merge(&mut self, rhs: &Self) {
        self.count += rhs.count
    }

    /// Number of occurrences.
    pub fn count(&self) -> u64 {
        self.count
    }
}

macro_rules! stats_func {
    ($(#[$attr:meta])* $name:ident: Event) => {
        #[inline]
        $(#[$attr])*
        pub(crate) fn $name() {
            if cfg!(feature = "stats") {
                with_thread_stats(|stats| stats.$name.happened())
            }
        }
    };
    ($(#[$attr:meta])* $name:ident: Size) => {
        #[inline]
        $(#[$attr])*
        pub(crate) fn $name(size: usize) {
            if cfg!(feature = "stats") {
                let size = size as u64;
                with_thread_stats(|stats| stats.$name.record(size))
            }
        }
    };
}

macro_rules! stats {
    ($($(#[$attr:meta])* $names:ident: $kinds:tt),* $(,)*) => {
        /// A collection of reftx statistics.
        #[derive(Default, Debug)]
        pub struct Stats {
            $($(#[$attr])*pub $names: $kinds),*
        }

        impl Stats {
            fn merge(&mut self, rhs: &Self) {
                $(self.$names.merge(&rhs.$names));*
            }
        }

        $(stats_func!{$(#[$attr])* $names: $kinds})*
    };
}

stats! {
    /// Number of retries per successful atomic block.
    transaction_retries: Size,

    /// Number of tranlocals that were only departed from at commit time.
    read_size:           Size,

    /// Number of references published at commit time.
    write_size:          Size,

    /// A committed transaction.
    commit:              Event,

    /// An aborted transaction, for any reason.
    abort:               Event,

    /// A transaction failed because of a read write conflict or a locked reference.
    read_write_conflict: Event,

    /// A full revalidation of everything read.
    rich_conflict_scan:  Event,

    /// A quiet global conflict counter let an open skip revalidation.
    skipped_scan:        Event,

    /// A lean or undersized transaction ran into something it doesn't support.
    speculative_failure: Event,

    /// A blocking retry parked its thread.
    retry_park:          Event,

    /// A transaction was reused from a pool.
    pool_hit:            Event,

    /// A pool had no transaction of the right shape.
    pool_miss:           Event,
}

impl Stats {
    /// Prints a summary of the stats object.
    pub fn print_summary(&self) {
        println!("{:#?}", self);

        let transactions = self.commit.count + self.abort.count;
        println!(
            "{:>12}: {:>12} {:>9}: {:.4} {:>13}: {:.4}",
            "transactions",
            transactions,
            "abort rate",
            self.abort.count as f64 / transactions as f64,
            "retry avg",
            self.transaction_retries.total() as f64 / self.transaction_retries.count as f64
        );
        println!(
            "{:>12}: {:>12} {:>9}: {:.4} {:>13}: {:.4}",
            "scans",
            self.rich_conflict_scan.count,
            "skip rate",
            self.skipped_scan.count as f64
                / (self.rich_conflict_scan.count + self.skipped_scan.count) as f64,
            "pool hit rate",
            self.pool_hit.count as f64 / (self.pool_hit.count + self.pool_miss.count) as f64
        );
    }
}

/// Thread local statistics.
///
/// To reduce overhead of stats tracking, each thread has it's own `Stats` object which is flushed
/// to the global `Stats` object on thread exit or when manually requested.
pub struct ThreadStats(RefCell<Stats>);

impl Debug for ThreadStats {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.pad("ThreadStats { .. }")
    }
}

impl Drop for ThreadStats {
    fn drop(&mut self) {
        self.flush()
    }
}

#[cfg_attr(not(feature = "stats"), allow(dead_code))]
impl ThreadStats {
    fn new() -> Self {
        // initialize global now, lazy_static may not be usable during thread local destruction
        lazy_static::initialize(&GLOBAL);
        ThreadStats(Default::default())
    }

    /// Flushes the thread stats to the global thread stats object.
    ///
    /// After flushing, `self` is reset.
    pub fn flush(&self) {
        let mut borrow = self.0.borrow_mut();
        GLOBAL.lock().merge(&*borrow);
        *borrow = Default::default()
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "stats")] {
        thread_local! {
            static THREAD_STAT: ThreadStats = ThreadStats::new();
        }

        #[inline]
        fn with_thread_stats(f: impl FnOnce(&mut Stats)) {
            drop(THREAD_STAT.try_with(|thread_stats| f(&mut thread_stats.0.borrow_mut())))
        }

        /// Flushes the current thread's statistics into the global stats object.
        pub fn thread_flush() {
            drop(THREAD_STAT.try_with(ThreadStats::flush))
        }
    } else {
        #[inline(always)]
        fn with_thread_stats(_: impl FnOnce(&mut Stats)) {}

        /// Flushes the current thread's statistics into the global stats object.
        pub fn thread_flush() {}
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL: Mutex<Stats> = Mutex::default();
}

/// Returns the global stats object, or None if the feature is disabled.
pub fn stats() -> Option<impl Deref<Target = Stats>> {
    if cfg!(feature = "stats") {
        Some(GLOBAL.lock())
    } else {
        None
    }
}

/// Prints a summary of the global stats object.
///
/// It may be necessary to run `stats::thread_flush()` first.
pub fn print_stats() {
    match self::stats() {
        Some(stats) => stats.print_summary(),
        None => println!("`reftx/stats` feature is not enabled"),
    }
}
