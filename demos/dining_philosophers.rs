use crossbeam_utils::thread;
use reftx::{
    config::TxConfig,
    stm::Stm,
    tref::TRef,
    tx::TxError,
};
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

const NUM_PHILOSOPHERS: usize = 5;
const FOOD_ITERATIONS: usize = 100_000;
const EAT_TIME_MICROS: u64 = 1;

struct Fork {
    in_use: TRef<bool>,
}

impl Fork {
    fn new(stm: &Stm) -> Self {
        Fork {
            in_use: TRef::new(stm, false),
        }
    }
}

/// a bit contrived
fn main() {
    let stm = Stm::with_config(TxConfig::new().with_max_retries(usize::MAX)).unwrap();
    let total_retry_count = AtomicUsize::new(0);
    let total_retry_count = &total_retry_count;

    let mut forks = Vec::new();
    for _ in 0..NUM_PHILOSOPHERS {
        forks.push(Fork::new(&stm));
    }

    thread::scope(|scope| {
        for i in 0..NUM_PHILOSOPHERS {
            let left_fork = &forks[i];
            let right_fork = &forks[(i + 1) % NUM_PHILOSOPHERS];
            let executor = stm.executor();
            scope.spawn(move |_| {
                let mut retry_count = 0;
                for _i in 0..FOOD_ITERATIONS {
                    executor
                        .atomic(|tx| {
                            if left_fork.in_use.get(tx)? || right_fork.in_use.get(tx)? {
                                retry_count += 1;
                                // sleeps until one of the forks we looked at is put down
                                Err(TxError::Retry)
                            } else {
                                left_fork.in_use.set(tx, true)?;
                                right_fork.in_use.set(tx, true)
                            }
                        })
                        .unwrap();

                    std::thread::sleep(std::time::Duration::from_micros(EAT_TIME_MICROS));

                    executor
                        .atomic(|tx| {
                            left_fork.in_use.set(tx, false)?;
                            right_fork.in_use.set(tx, false)
                        })
                        .unwrap();
                }
                total_retry_count.fetch_add(retry_count, Relaxed);
            });
        }
    })
    .unwrap();
    println!("Total Retry Count: {:?}", total_retry_count.load(Relaxed));
    reftx::stats::print_stats();
}
