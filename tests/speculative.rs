mod speculative {
    use parking_lot::Mutex;
    use reftx::{
        config::TxConfig,
        factory::TxPool,
        stm::{Stm, TxExecutor},
        transaction::Transaction,
        tref::TRef,
        tx::{TxError, TxEvent, TxFlavor, TxListener, TxShape},
    };
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TxEvent>>);

    impl Recorder {
        fn take(&self) -> Vec<TxEvent> {
            std::mem::replace(&mut *self.0.lock(), Vec::new())
        }
    }

    impl TxListener for Recorder {
        fn notify(&self, _: &Transaction, event: TxEvent) {
            self.0.lock().push(event)
        }
    }

    #[test]
    fn grows_to_fit() {
        let stm = Stm::new();
        let executor = TxExecutor::new(
            stm.factory_with(TxConfig::new().with_max_fixed_length_transaction_size(3))
                .unwrap(),
        );
        let refs: Vec<_> = (0..5).map(|i| TRef::new(&stm, i)).collect();

        let mut shapes = Vec::new();
        let sum = executor
            .atomic(|tx| {
                shapes.push(tx.shape());
                let mut sum = 0;
                for r in &refs {
                    sum += r.get(tx)?;
                }
                Ok(sum)
            })
            .unwrap();
        assert_eq!(sum, 10);
        assert_eq!(shapes, vec![TxShape::Mono, TxShape::Fixed, TxShape::Variable]);

        // learned for good
        shapes.clear();
        executor
            .atomic(|tx| {
                shapes.push(tx.shape());
                refs[0].get(tx)
            })
            .unwrap();
        assert_eq!(shapes, vec![TxShape::Variable]);
        for r in &refs {
            assert_eq!(r.surplus(), 0);
        }
    }

    #[test]
    fn fat_features() {
        let stm = Stm::new();
        let executor = TxExecutor::new(stm.factory_with(TxConfig::new()).unwrap());
        let x = TRef::new(&stm, 1);
        let recorder = Arc::new(Recorder::default());

        let mut flavors = Vec::new();
        executor
            .atomic(|tx| {
                flavors.push(tx.flavor());
                tx.register(recorder.clone())?;
                x.set(tx, 2)
            })
            .unwrap();
        assert_eq!(flavors, vec![TxFlavor::Lean, TxFlavor::Fat]);
        assert!(executor.factory().speculative().is_listeners_detected());
        assert_eq!(recorder.take(), vec![TxEvent::PrePrepare, TxEvent::PostCommit]);
        assert_eq!(x.atomic_get(), Ok(2));

        // fat from now on
        let result: Result<(), _> = executor.atomic(|tx| {
            assert_eq!(tx.flavor(), TxFlavor::Fat);
            tx.register(recorder.clone())?;
            x.set(tx, 3)?;
            tx.set_abort_only()?;
            Ok(())
        });
        assert_eq!(result, Err(TxError::AbortOnly));
        assert_eq!(recorder.take(), vec![TxEvent::PostAbort]);
        assert_eq!(x.atomic_get(), Ok(2));
        assert_eq!(x.surplus(), 0);
    }

    #[test]
    fn constructions() {
        let stm = Stm::new();
        let executor = TxExecutor::new(stm.factory_with(TxConfig::new()).unwrap());
        let mut flavors = Vec::new();
        let (a, b) = executor
            .atomic(|tx| {
                flavors.push(tx.flavor());
                let a = TRef::new_in(tx, 1)?;
                let b = TRef::new_in(tx, 2)?;
                Ok((a, b))
            })
            .unwrap();
        assert_eq!(flavors, vec![TxFlavor::Lean, TxFlavor::Fat]);
        assert!(executor.factory().speculative().is_constructions_detected());
        assert_eq!(a.atomic_get(), Ok(1));
        assert_eq!(b.atomic_get(), Ok(2));
        assert_eq!(a.version(), 1);
    }

    #[test]
    fn permanent_listeners() {
        let recorder = Arc::new(Recorder::default());
        let stm = Stm::with_config(TxConfig::new().with_permanent_listener(recorder.clone()))
            .unwrap();
        let x = TRef::new(&stm, 1);
        stm.atomic(|tx| x.set(tx, 2)).unwrap();
        assert_eq!(recorder.take(), vec![TxEvent::PrePrepare, TxEvent::PostCommit]);

        let result: Result<(), _> = stm.atomic(|tx| {
            x.set(tx, 3)?;
            Err(TxError::Readonly)
        });
        assert_eq!(result, Err(TxError::Readonly));
        assert_eq!(recorder.take(), vec![TxEvent::PostAbort]);
    }

    #[test]
    fn pooled_upgrades() {
        let stm = Stm::new();
        let factory = stm
            .factory_with(TxConfig::new().with_max_fixed_length_transaction_size(2))
            .unwrap();
        let executor = TxExecutor::new(factory);
        let refs: Vec<_> = (0..3).map(|i| TRef::new(&stm, i)).collect();
        let mut pool = TxPool::new();
        for _ in 0..4 {
            executor
                .atomic_with(&mut pool, |tx| {
                    for r in &refs {
                        r.alter_and_get(tx, |x| x + 1)?;
                    }
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(refs[2].atomic_get(), Ok(6));
        assert_eq!(pool.len(TxShape::Mono), 1);
        assert_eq!(pool.len(TxShape::Fixed), 1);
        assert_eq!(pool.len(TxShape::Variable), 1);
    }
}
