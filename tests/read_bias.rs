mod read_bias {
    use crossbeam_utils::thread;
    use reftx::{config::TxConfig, stm::Stm, tref::TRef, tx::LockMode};

    const THRESHOLD: u32 = 4;

    fn biased_stm() -> Stm {
        Stm::with_config(TxConfig::new().with_read_biased_threshold(THRESHOLD)).unwrap()
    }

    #[test]
    fn readers_flip_the_bias() {
        let stm = biased_stm();
        let x = TRef::new(&stm, 7);
        for i in 1..THRESHOLD {
            assert_eq!(stm.atomic(|tx| x.get(tx)), Ok(7));
            assert_eq!(x.readonly_count(), i);
            assert!(!x.is_read_biased());
            assert_eq!(x.surplus(), 0);
        }
        assert_eq!(stm.atomic(|tx| x.get(tx)), Ok(7));
        assert!(x.is_read_biased());
        // the phantom
        assert_eq!(x.surplus(), 1);

        // readers of a biased reference don't register
        let mut tx = stm.new_transaction();
        assert_eq!(x.get(&mut tx), Ok(7));
        assert_eq!(x.surplus(), 1);
        tx.commit().unwrap();
        assert_eq!(x.surplus(), 1);
        assert_eq!(x.atomic_get(), Ok(7));
        assert_eq!(x.surplus(), 1);
    }

    #[test]
    fn writes_revert_the_bias() {
        let stm = biased_stm();
        let x = TRef::new(&stm, 7);
        for _ in 0..THRESHOLD {
            x.atomic_get().unwrap();
        }
        assert!(x.is_read_biased());

        stm.atomic(|tx| x.set(tx, 8)).unwrap();
        assert!(!x.is_read_biased());
        assert_eq!(x.surplus(), 0);
        assert_eq!(x.readonly_count(), 0);
        assert_eq!(x.version(), 2);

        x.atomic_get().unwrap();
        assert_eq!(x.readonly_count(), 1);
        assert_eq!(x.surplus(), 0);
    }

    #[test]
    fn read_then_write_biased() {
        let stm = biased_stm();
        let x = TRef::new(&stm, 7);
        for _ in 0..THRESHOLD {
            x.atomic_get().unwrap();
        }
        let mut tx = stm.new_transaction();
        assert_eq!(x.get(&mut tx), Ok(7));
        x.set(&mut tx, 9).unwrap();
        assert_eq!(x.surplus(), 2);
        tx.commit().unwrap();
        assert_eq!(x.atomic_get(), Ok(9));
        assert!(!x.is_read_biased());
        assert_eq!(x.lock_mode(), LockMode::None);
        assert_eq!(x.surplus(), 0);
    }

    #[test]
    fn bias_disabled() {
        let stm = Stm::with_config(TxConfig::new().with_read_biased_threshold(0)).unwrap();
        let x = TRef::new(&stm, 7);
        for _ in 0..1_000 {
            x.atomic_get().unwrap();
        }
        assert!(!x.is_read_biased());
        assert_eq!(x.surplus(), 0);
    }

    // Readers of a biased reference are invisible to its orec, so a concurrent writer must still
    // invalidate them through the version.
    #[test]
    fn biased_readers_see_writes() {
        const ITER_COUNT: usize = 2_000;

        let stm = Stm::with_config(
            TxConfig::new()
                .with_read_biased_threshold(THRESHOLD)
                .with_max_retries(usize::MAX),
        )
        .unwrap();
        let x = TRef::new(&stm, 0);
        let y = TRef::new(&stm, 0);
        thread::scope(|s| {
            s.spawn(|_| {
                for i in 1..=ITER_COUNT {
                    stm.atomic(|tx| {
                        x.set(tx, i)?;
                        y.set(tx, i)
                    })
                    .unwrap();
                }
            });
            for _ in 0..2 {
                s.spawn(|_| {
                    for _ in 0..ITER_COUNT {
                        let (a, b) = stm.atomic(|tx| Ok((x.get(tx)?, y.get(tx)?))).unwrap();
                        assert_eq!(a, b);
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(x.atomic_get(), Ok(ITER_COUNT));
        assert_eq!(x.lock_mode(), LockMode::None);
    }
}
