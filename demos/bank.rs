use crossbeam_utils::thread;
use reftx::{
    config::TxConfig,
    factory::TxPool,
    stm::{Stm, TxExecutor},
    tref::TRef,
    tx::TxError,
};
use std::time::Instant;

const ACCOUNTS: usize = 64;
const INITIAL_BALANCE: u64 = 1_000;
const TELLERS: usize = 4;
const TRANSFERS: usize = 100_000;

#[derive(Clone, Debug, PartialEq)]
struct Account {
    balance:   u64,
    transfers: u32,
}

/// Moves `amount` between two accounts, waiting until `from` can cover it.
fn transfer(
    executor: &TxExecutor,
    pool: &mut TxPool,
    from: &TRef<Account>,
    to: &TRef<Account>,
    amount: u64,
) -> Result<(), TxError> {
    executor.atomic_with(pool, |tx| {
        from.await_until(tx, |account| account.balance >= amount)?;
        from.alter_and_get(tx, |account| Account {
            balance:   account.balance - amount,
            transfers: account.transfers + 1,
        })?;
        // deposits never conflict with each other
        to.commute(tx, move |account| Account {
            balance:   account.balance + amount,
            transfers: account.transfers + 1,
        })
    })
}

fn main() {
    let stm = Stm::with_config(
        TxConfig::new()
            .with_family_name("bank")
            .with_max_retries(usize::MAX),
    )
    .unwrap();
    let accounts: Vec<_> = (0..ACCOUNTS)
        .map(|_| {
            TRef::new(
                &stm,
                Account {
                    balance:   INITIAL_BALANCE,
                    transfers: 0,
                },
            )
        })
        .collect();
    let auditor = TxExecutor::new(
        stm.factory_with(TxConfig::new().with_readonly(true).with_family_name("audit"))
            .unwrap(),
    );

    let start = Instant::now();
    thread::scope(|scope| {
        for teller in 0..TELLERS {
            let accounts = &accounts;
            let executor = stm.executor();
            scope.spawn(move |_| {
                let mut pool = TxPool::new();
                for i in 0..TRANSFERS {
                    let from = (teller * 31 + i * 17) % ACCOUNTS;
                    let to = (from + 1 + i % (ACCOUNTS - 1)) % ACCOUNTS;
                    let amount = (i % 50) as u64;
                    transfer(&executor, &mut pool, &accounts[from], &accounts[to], amount)
                        .unwrap();
                }
            });
        }
        scope.spawn(|_| {
            for _ in 0..100 {
                let total = auditor
                    .atomic(|tx| {
                        let mut total = 0;
                        for account in &accounts {
                            total += account.get(tx)?.balance;
                        }
                        Ok(total)
                    })
                    .unwrap();
                assert_eq!(total, INITIAL_BALANCE * ACCOUNTS as u64);
            }
        });
    })
    .unwrap();

    let transfers: u32 = accounts
        .iter()
        .map(|account| account.atomic_weak_get().transfers)
        .sum();
    println!(
        "{} transfers in {:?}, {} conflicts",
        transfers / 2,
        start.elapsed(),
        stm.global_conflict_count()
    );
    reftx::stats::print_stats();
}
