mod protocol {
    use crossbeam_utils::thread;
    use reftx::{
        config::TxConfig,
        stm::Stm,
        tref::TRef,
        tx::{LockMode, TxError, TxStatus},
        TranlocalMode,
    };

    fn fat_stm() -> Stm {
        Stm::with_config(TxConfig::new().with_speculative(false)).unwrap()
    }

    #[test]
    fn write_commit() {
        let stm = Stm::new();
        let r = TRef::new(&stm, 10);
        let version = r.version();

        let mut tx = stm.new_transaction();
        *r.open_for_write(&mut tx, LockMode::None).unwrap().get_mut() = 15;
        tx.commit().unwrap();

        assert_eq!(r.atomic_get(), Ok(15));
        assert_eq!(r.version(), version + 1);
        assert_eq!(r.lock_mode(), LockMode::None);
        assert_eq!(r.surplus(), 0);
    }

    #[test]
    fn read_of_exclusively_locked() {
        let stm = fat_stm();
        let r = TRef::new(&stm, 10);
        let version = r.version();

        let mut other = stm.new_transaction();
        r.open_for_write(&mut other, LockMode::Exclusive).unwrap();

        let mut tx = stm.new_transaction();
        assert_eq!(r.get(&mut tx), Err(TxError::ReadWriteConflict));
        assert_eq!(tx.status(), TxStatus::Aborted);
        assert_eq!(r.atomic_weak_get(), 10);
        assert_eq!(r.version(), version);
        assert_eq!(r.lock_mode(), LockMode::Exclusive);
        assert_eq!(r.surplus(), 1);

        other.abort().unwrap();
        assert_eq!(r.lock_mode(), LockMode::None);
        assert_eq!(r.surplus(), 0);
    }

    #[test]
    fn blind_commute() {
        let stm = Stm::new();
        let r = TRef::new(&stm, 10);
        let version = r.version();

        let mut tx = stm.new_transaction();
        r.commute(&mut tx, |x| x + 1).unwrap();
        assert_eq!(r.mode_in(&tx), Some(TranlocalMode::Commuting));
        assert_eq!(r.atomic_get(), Ok(10));
        assert_eq!(r.surplus(), 0);
        tx.commit().unwrap();

        assert_eq!(r.atomic_get(), Ok(11));
        assert_eq!(r.version(), version + 1);
        assert_eq!(r.surplus(), 0);
    }

    #[test]
    fn unchanged_write_is_not_published() {
        let stm = Stm::new();
        let r = TRef::new(&stm, 10);
        let version = r.version();
        let count = stm.global_conflict_count();

        let mut tx = stm.new_transaction();
        assert_eq!(*r.open_for_write(&mut tx, LockMode::None).unwrap().get(), 10);
        tx.prepare().unwrap();
        assert_eq!(r.lock_mode(), LockMode::None);
        tx.commit().unwrap();

        assert_eq!(r.version(), version);
        assert_eq!(stm.global_conflict_count(), count);
        assert_eq!(r.surplus(), 0);
    }

    #[test]
    fn dirty_check_disabled() {
        let stm = Stm::with_config(TxConfig::new().with_dirty_check(false)).unwrap();
        let r = TRef::new(&stm, 10);
        let count = stm.global_conflict_count();
        stm.atomic(|tx| r.set(tx, 10)).unwrap();
        assert_eq!(r.version(), 2);
        assert_eq!(stm.global_conflict_count(), count + 1);
    }

    #[test]
    fn version_monotonicity() {
        let stm = Stm::new();
        let r = TRef::new(&stm, 0);
        let before = r.version();
        for i in 1..=10 {
            stm.atomic(|tx| r.set(tx, i)).unwrap();
            assert_eq!(stm.atomic(|tx| r.get(tx)), Ok(i));
        }
        assert_eq!(r.version(), before + 10);
    }

    #[test]
    fn read_your_writes() {
        let stm = Stm::new();
        let r = TRef::new(&stm, "a".to_owned());
        let mut tx = stm.new_transaction();
        r.open_for_write(&mut tx, LockMode::None)
            .unwrap()
            .get_mut()
            .push('b');
        assert_eq!(r.get(&mut tx), Ok("ab".to_owned()));
        assert_eq!(
            r.open_for_write(&mut tx, LockMode::None).unwrap().get(),
            "ab"
        );
        assert_eq!(r.atomic_get(), Ok("a".to_owned()));
        tx.commit().unwrap();
        assert_eq!(r.atomic_get(), Ok("ab".to_owned()));
    }

    #[test]
    fn commute_order() {
        let stm = Stm::new();
        let r = TRef::new(&stm, 10);
        stm.atomic(|tx| {
            r.commute(tx, |x| x + 1)?;
            r.commute(tx, |x| x * 2)
        })
        .unwrap();
        assert_eq!(r.atomic_get(), Ok(22));
    }

    #[test]
    fn commute_then_read() {
        let stm = Stm::new();
        let r = TRef::new(&stm, 10);
        let seen = stm
            .atomic(|tx| {
                r.commute(tx, |x| x + 1)?;
                let seen = r.get(tx)?;
                r.commute(tx, |x| x * 2)?;
                Ok(seen)
            })
            .unwrap();
        assert_eq!(seen, 11);
        assert_eq!(r.atomic_get(), Ok(22));
    }

    #[test]
    fn commutes_dont_conflict() {
        let stm = Stm::new();
        let r = TRef::new(&stm, 10);
        let mut a = stm.new_transaction();
        let mut b = stm.new_transaction();
        r.commute(&mut a, |x| x + 1).unwrap();
        r.commute(&mut b, |x| x + 1).unwrap();
        a.commit().unwrap();
        b.commit().unwrap();
        assert_eq!(r.atomic_get(), Ok(12));
        assert_eq!(r.version(), 3);
    }

    #[test]
    fn reads_conflict() {
        let stm = Stm::new();
        let r = TRef::new(&stm, 10);
        let w = TRef::new(&stm, 0);
        let mut tx = stm
            .factory_with(TxConfig::new().with_speculative(false))
            .unwrap()
            .new_transaction();
        assert_eq!(r.get(&mut tx), Ok(10));
        w.set(&mut tx, 1).unwrap();
        r.atomic_set(11).unwrap();
        assert_eq!(tx.commit(), Err(TxError::ReadWriteConflict));
        assert_eq!(w.atomic_get(), Ok(0));
        assert_eq!(w.surplus(), 0);
        assert_eq!(r.surplus(), 0);
    }

    #[test]
    fn abort_cleanliness() {
        let stm = fat_stm();
        let refs: Vec<_> = (0..4).map(|i| TRef::new(&stm, i)).collect();

        // another transaction holds a read lock throughout
        let mut holder = stm.new_transaction();
        refs[0].ensure(&mut holder).unwrap();

        let mut tx = stm.new_transaction();
        refs[0].open_for_read(&mut tx, LockMode::Read).unwrap();
        refs[1].open_for_write(&mut tx, LockMode::Write).unwrap();
        refs[2].open_for_write(&mut tx, LockMode::Exclusive).unwrap();
        refs[3].set(&mut tx, 30).unwrap();
        tx.prepare().unwrap();
        assert_eq!(refs[3].lock_mode(), LockMode::Exclusive);
        tx.abort().unwrap();

        assert_eq!(refs[0].lock_mode(), LockMode::Read);
        assert_eq!(refs[0].surplus(), 1);
        for r in &refs[1..] {
            assert_eq!(r.lock_mode(), LockMode::None);
            assert_eq!(r.surplus(), 0);
        }
        assert_eq!(refs[3].atomic_get(), Ok(3));

        holder.commit().unwrap();
        assert_eq!(refs[0].lock_mode(), LockMode::None);
        assert_eq!(refs[0].surplus(), 0);
    }

    #[test]
    fn ensure_blocks_writers() {
        let stm = fat_stm();
        let r = TRef::new(&stm, 10);
        let mut reader = stm.new_transaction();
        r.ensure(&mut reader).unwrap();

        let mut writer = stm.new_transaction();
        r.set(&mut writer, 11).unwrap();
        assert_eq!(writer.commit(), Err(TxError::ReadWriteConflict));
        assert_eq!(r.atomic_set(12), Err(TxError::Locked));

        reader.commit().unwrap();
        let mut writer = stm.new_transaction();
        r.set(&mut writer, 11).unwrap();
        writer.commit().unwrap();
        assert_eq!(r.atomic_get(), Ok(11));
    }

    #[test]
    fn pessimistic_writes() {
        let stm = Stm::with_config(
            TxConfig::new()
                .with_speculative(false)
                .with_write_lock_mode(LockMode::Exclusive),
        )
        .unwrap();
        let r = TRef::new(&stm, 10);
        let mut tx = stm.new_transaction();
        r.set(&mut tx, 11).unwrap();
        assert_eq!(r.lock_mode(), LockMode::Exclusive);

        let mut other = stm.new_transaction();
        assert_eq!(r.get(&mut other), Err(TxError::ReadWriteConflict));
        tx.commit().unwrap();
        assert_eq!(r.atomic_get(), Ok(11));
    }

    #[test]
    fn at_most_one_writer() {
        const THREAD_COUNT: usize = 4;
        const ITER_COUNT: usize = 1_000;

        let stm = Stm::with_config(TxConfig::new().with_max_retries(usize::MAX)).unwrap();
        let r = TRef::new(&stm, 0);
        let before = stm.global_conflict_count();
        thread::scope(|s| {
            for _ in 0..THREAD_COUNT {
                s.spawn(|_| {
                    for _ in 0..ITER_COUNT {
                        stm.atomic(|tx| r.alter_and_get(tx, |x| x + 1)).unwrap();
                    }
                });
            }
        })
        .unwrap();
        let total = THREAD_COUNT * ITER_COUNT;
        assert_eq!(r.atomic_get(), Ok(total));
        assert_eq!(r.version(), 1 + total as u64);
        assert_eq!(stm.global_conflict_count(), before + total as u64);
        assert_eq!(r.lock_mode(), LockMode::None);
    }

    #[test]
    fn concurrent_commutes() {
        const THREAD_COUNT: usize = 4;
        const ITER_COUNT: usize = 1_000;

        let stm = Stm::with_config(TxConfig::new().with_max_retries(usize::MAX)).unwrap();
        let r = TRef::new(&stm, 0);
        thread::scope(|s| {
            for _ in 0..THREAD_COUNT {
                s.spawn(|_| {
                    for _ in 0..ITER_COUNT {
                        stm.atomic(|tx| r.commute(tx, |x| x + 1)).unwrap();
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(r.atomic_get(), Ok(THREAD_COUNT * ITER_COUNT));
    }

    #[test]
    fn user_panic_releases() {
        let stm = fat_stm();
        let r = TRef::new(&stm, 10);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut tx = stm.new_transaction();
            r.set(&mut tx, 11).unwrap();
            tx.prepare().unwrap();
            panic!("user code failed")
        }));
        assert!(result.is_err());
        assert_eq!(r.lock_mode(), LockMode::None);
        assert_eq!(r.surplus(), 0);
        assert_eq!(r.atomic_get(), Ok(10));
    }
}
