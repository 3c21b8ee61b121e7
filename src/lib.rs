//! An ownable reference software transactional memory library.
//!
//! `reftx` keeps a small concurrency control header, the orec, inside every transactional
//! reference. Transactions work on private copies (tranlocals) and publish them at commit under
//! short exclusive locks. A single global conflict counter lets most transactions skip
//! revalidation entirely.
//!
//! # Examples
//!
//! Creating an [`Stm`] and some references:
//! ```
//! use reftx::{stm::Stm, tref::TRef};
//!
//! let stm = Stm::new();
//! let a = TRef::new(&stm, 0);
//! let b = stm.new_tref(42);
//! ```
//!
//! Performing a transaction to swap the two values:
//! ```
//! # use reftx::{stm::Stm, tref::TRef};
//! # let stm = Stm::new();
//! # let a = TRef::new(&stm, 0);
//! # let b = stm.new_tref(42);
//! stm.atomic(|tx| {
//!     let temp = a.get(tx)?;
//!     let b_val = b.get(tx)?;
//!     a.set(tx, b_val)?;
//!     b.set(tx, temp)
//! })
//! .unwrap();
//! assert_eq!(b.atomic_get(), Ok(0));
//! assert_eq!(a.atomic_get(), Ok(42));
//! ```
//!
//! # Features
//!
//! * Optimistic reads validated by version, with optional pessimistic `Read`, `Write` and
//!   `Exclusive` locks per reference or per configuration.
//! * Read biased references: a reference that is read far more often than written stops
//!   registering its readers.
//! * Commuting updates that don't conflict with each other, applied at commit time.
//! * Blocking retry via [`TxError::Retry`](crate::tx::TxError::Retry): the thread sleeps until a
//!   reference it read is written.
//! * Speculative transaction sizing: transactions start as the cheapest variant and are upgraded
//!   after they prove insufficient. Dead transactions can be reused through a [`TxPool`].
//! * Atomic operations on single references without a transaction.
//!
//! ## Shared Memory
//!
//! * [`TRef`], a transactional reference.
//!
//! ## Running Transactions
//!
//! * [`atomic`], runs a closure as a transaction with the default configuration.
//! * [`TxExecutor`], runs closures with a custom configuration.
//! * [`TxFactory`], creates transactions to be driven by hand.
//!
//! [`Stm`]: stm/struct.Stm.html
//! [`TRef`]: tref/struct.TRef.html
//! [`TxPool`]: factory/struct.TxPool.html
//! [`TxFactory`]: factory/struct.TxFactory.html
//! [`TxExecutor`]: stm/struct.TxExecutor.html
//! [`atomic`]: stm/struct.Stm.html#method.atomic

#![warn(macro_use_extern_crate)]
#![warn(missing_debug_implementations)]
#![warn(unused_lifetimes)]
#![cfg_attr(not(test), warn(unused_results))]
#![deny(rust_2018_compatibility)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

#[macro_use]
mod internal;

pub mod config;
pub mod factory;
pub mod stats;
pub mod stm;
pub mod transaction;
pub mod tref;
pub mod tx;

pub use internal::tranlocal::{Tranlocal, TranlocalMode};

#[cfg(test)]
mod memory {
    use crate::{config::TxConfig, stm::Stm, tref::TRef, tx::LockMode};
    use crossbeam_utils::thread;
    use std::sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc,
    };

    struct Counted(Arc<AtomicUsize>);

    impl Clone for Counted {
        fn clone(&self) -> Self {
            Counted::new(&self.0)
        }
    }

    impl Counted {
        fn new(live: &Arc<AtomicUsize>) -> Self {
            live.fetch_add(1, Relaxed);
            Counted(live.clone())
        }
    }

    impl PartialEq for Counted {
        fn eq(&self, _: &Self) -> bool {
            false
        }
    }

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Relaxed);
        }
    }

    #[test]
    fn leak_single() {
        const ITER_COUNT: usize = 100_000;
        let live = Arc::new(AtomicUsize::new(0));
        let stm = Stm::new();
        let x = TRef::new(&stm, vec![1, 2, 3, 4]);
        thread::scope(|s| {
            s.spawn(|_| {
                for _ in 0..ITER_COUNT {
                    stm.atomic(|tx| x.set(tx, vec![1, 2, 3, 4])).unwrap();
                }
            });
        })
        .unwrap();
        drop(x);

        let y = TRef::new(&stm, Counted::new(&live));
        for _ in 0..1000 {
            stm.atomic(|tx| y.set(tx, Counted::new(&live))).unwrap();
        }
        drop(y);
        assert_eq!(live.load(Relaxed), 0);
    }

    #[test]
    fn leak_multi() {
        const ITER_COUNT: usize = 2_000;
        const THREAD_COUNT: usize = 8;
        let live = Arc::new(AtomicUsize::new(0));
        let stm = Stm::with_config(TxConfig::new().with_max_retries(usize::MAX)).unwrap();
        let x = TRef::new(&stm, Counted::new(&live));
        thread::scope(|s| {
            for i in 0..THREAD_COUNT {
                s.builder()
                    .name(format!("scoped_thread#{}", i))
                    .spawn(|_| {
                        for _ in 0..ITER_COUNT {
                            stm.atomic(|tx| x.set(tx, Counted::new(&live))).unwrap();
                        }
                    })
                    .unwrap();
            }
        })
        .unwrap();
        drop(x);
        assert_eq!(live.load(Relaxed), 0);
    }

    #[test]
    fn zero_sized() {
        #[derive(Clone, PartialEq)]
        struct Zero;

        const ITER_COUNT: usize = 10_000;
        const THREAD_COUNT: usize = 16;
        let stm = Stm::new();
        let x = TRef::new(&stm, Zero);
        thread::scope(|s| {
            for _ in 0..THREAD_COUNT {
                s.spawn(|_| {
                    for _ in 0..ITER_COUNT {
                        stm.atomic(|tx| {
                            drop(x.get(tx)?);
                            x.set(tx, Zero)
                        })
                        .unwrap();
                    }
                });
            }
        })
        .unwrap();
        // equal values are never published
        assert_eq!(x.version(), 1);
        assert_eq!(x.lock_mode(), LockMode::None);
    }
}
