//! Prepare and commit: idempotence, conflicting duplicates, backpressure,
//! persistence failures and recovery replay.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::config::StoreConfig;
    use crate::ledger::LedgerError;
    use crate::ledger::tests::helpers::*;
    use crate::meta_store::MetaStore;
    use crate::model::{LoadId, RowsetId, TransactionKey, Version};
    use crate::tablet::tests::helpers::*;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    // ================================================================
    // 1. Prepare
    // ================================================================

    #[test]
    fn prepare__twice_with_same_load_is_single_entry() {
        let ledger = small_ledger();
        let tablet = MockTablet::new(5, 0);
        let key = TransactionKey::new(1, 100);

        ledger.prepare(key, &tablet.identity, LoadId(1)).unwrap();
        ledger.prepare(key, &tablet.identity, LoadId(1)).unwrap();

        let tablets = ledger.related_tablets(key);
        assert_eq!(tablets.len(), 1);
        assert!(tablets[&tablet.identity].is_none());
        assert_eq!(ledger.partitions_of(100), vec![1]);
    }

    #[test]
    fn prepare__after_commit_with_same_load_keeps_rowset() {
        let ledger = small_ledger();
        let meta = FlakyMetaStore::default();
        let tablet = MockTablet::new(5, 0);
        let key = TransactionKey::new(1, 100);
        committed(&ledger, &meta, &tablet, key, 1);

        ledger.prepare(key, &tablet.identity, LoadId(100)).unwrap();

        let state = ledger.get(key, &tablet.identity).unwrap();
        assert_eq!(state.rowset.unwrap().rowset_id(), RowsetId(1));
    }

    #[test]
    fn prepare__after_commit_with_other_load_is_refused() {
        let ledger = small_ledger();
        let meta = FlakyMetaStore::default();
        let tablet = MockTablet::new(5, 0);
        let key = TransactionKey::new(1, 100);
        committed(&ledger, &meta, &tablet, key, 1);

        let err = ledger.prepare(key, &tablet.identity, LoadId(999)).unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyCommitted { .. }), "got {err:?}");
        assert!(ledger.get(key, &tablet.identity).unwrap().rowset.is_some());
    }

    /// # Scenario
    /// One shard with a ceiling of two running transactions.
    ///
    /// # Expected behavior
    /// A third distinct transaction is refused, while more tablets for an
    /// already running transaction are still admitted. Once a transaction
    /// ends, a new one fits again.
    #[test]
    fn prepare__too_many_transactions_in_shard() {
        let ledger = ledger_with(StoreConfig {
            txn_map_shard_size: 1,
            max_running_txns_per_shard: 2,
            ..small_config()
        });
        let a = MockTablet::new(5, 0);
        let b = MockTablet::new(6, 0);

        ledger.prepare(TransactionKey::new(1, 1), &a.identity, LoadId(1)).unwrap();
        ledger.prepare(TransactionKey::new(1, 2), &a.identity, LoadId(2)).unwrap();

        let err = ledger
            .prepare(TransactionKey::new(1, 3), &a.identity, LoadId(3))
            .unwrap_err();
        assert!(
            matches!(err, LedgerError::TooManyTransactions { running: 2, limit: 2 }),
            "got {err:?}"
        );

        ledger.prepare(TransactionKey::new(1, 1), &b.identity, LoadId(1)).unwrap();

        ledger.rollback(TransactionKey::new(1, 2), &a.identity).unwrap();
        ledger.prepare(TransactionKey::new(1, 3), &a.identity, LoadId(3)).unwrap();
    }

    // ================================================================
    // 2. Commit
    // ================================================================

    /// # Scenario
    /// Partition 1, transaction 100, tablet 5: commit R1, commit R1 again,
    /// then commit R2 under the same load id.
    ///
    /// # Expected behavior
    /// The repeat is a no-op that does not rewrite metadata; R2 fails with
    /// `AlreadyExists` and R1 stays installed.
    #[test]
    fn commit__duplicate_is_noop_and_conflict_is_rejected() {
        let ledger = small_ledger();
        let meta = FlakyMetaStore::default();
        let tablet = MockTablet::new(5, 0);
        let key = TransactionKey::new(1, 100);
        let load = LoadId(0x4C);

        ledger.prepare(key, &tablet.identity, load).unwrap();
        let r1 = pending_rowset(1, &tablet.identity, key, load);
        ledger.commit(&meta, key, &tablet.identity, load, Arc::clone(&r1)).unwrap();
        ledger.commit(&meta, key, &tablet.identity, load, Arc::clone(&r1)).unwrap();
        assert_eq!(meta.saves.load(Ordering::SeqCst), 1);

        let r2 = pending_rowset(2, &tablet.identity, key, load);
        let err = ledger
            .commit(&meta, key, &tablet.identity, load, r2)
            .unwrap_err();
        match err {
            LedgerError::AlreadyExists {
                existing, incoming, ..
            } => {
                assert_eq!(existing, RowsetId(1));
                assert_eq!(incoming, RowsetId(2));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let state = ledger.get(key, &tablet.identity).unwrap();
        assert_eq!(state.rowset.unwrap().rowset_id(), RowsetId(1));
        assert!(meta.load(tablet.identity.tablet_uid, RowsetId(2)).unwrap().is_none());
    }

    #[test]
    fn commit__persists_pending_meta() {
        let ledger = small_ledger();
        let meta = FlakyMetaStore::default();
        let tablet = MockTablet::new(5, 0);
        committed(&ledger, &meta, &tablet, TransactionKey::new(1, 100), 1);

        let stored = meta
            .load(tablet.identity.tablet_uid, RowsetId(1))
            .unwrap()
            .expect("committed record");
        assert_eq!(stored.meta.version, Version::PENDING);
        assert!(!stored.binlog);
    }

    #[test]
    fn commit__without_prepare_installs_entry() {
        let ledger = small_ledger();
        let meta = FlakyMetaStore::default();
        let tablet = MockTablet::new(5, 0);
        let key = TransactionKey::new(1, 100);
        let rowset = pending_rowset(1, &tablet.identity, key, LoadId(3));

        ledger.commit(&meta, key, &tablet.identity, LoadId(3), rowset).unwrap();
        assert!(ledger.has_transaction(key, &tablet.identity));
        assert_eq!(ledger.partitions_of(100), vec![1]);
    }

    #[test]
    fn commit__persistence_failure_leaves_entry_prepared() {
        let ledger = small_ledger();
        let meta = FlakyMetaStore::default();
        let tablet = MockTablet::new(5, 0);
        let key = TransactionKey::new(1, 100);
        ledger.prepare(key, &tablet.identity, LoadId(3)).unwrap();

        meta.fail_save.store(true, Ordering::SeqCst);
        let rowset = pending_rowset(1, &tablet.identity, key, LoadId(3));
        let err = ledger
            .commit(&meta, key, &tablet.identity, LoadId(3), rowset)
            .unwrap_err();
        assert!(matches!(err, LedgerError::PersistenceFailed(_)), "got {err:?}");

        let state = ledger.get(key, &tablet.identity).unwrap();
        assert!(state.rowset.is_none());
        ledger.rollback(key, &tablet.identity).unwrap();
    }

    #[test]
    fn commit__non_positive_ids_are_invalid() {
        let ledger = small_ledger();
        let meta = FlakyMetaStore::default();
        let tablet = MockTablet::new(5, 0);

        for key in [TransactionKey::new(0, 100), TransactionKey::new(1, -4)] {
            let rowset = pending_rowset(1, &tablet.identity, key, LoadId(1));
            let err = ledger
                .commit(&meta, key, &tablet.identity, LoadId(1), rowset)
                .unwrap_err();
            assert!(matches!(err, LedgerError::InvalidArgument(_)), "got {err:?}");
        }
        assert_eq!(meta.saves.load(Ordering::SeqCst), 0);
        assert!(ledger.all_related_tablets().is_empty());
    }

    // ================================================================
    // 3. Recovery
    // ================================================================

    #[test]
    fn commit_recovered__skips_persistence_and_attaches_bitmap() {
        let ledger = small_ledger();
        let meta = FlakyMetaStore::default();
        let tablet = MockTablet::new(5, 0);
        let key = TransactionKey::new(1, 100);
        let rowset = pending_rowset(1, &tablet.identity, key, LoadId(3));

        ledger
            .commit_recovered(key, &tablet.identity, LoadId(3), rowset, true)
            .unwrap();

        assert_eq!(meta.saves.load(Ordering::SeqCst), 0);
        let state = ledger.get(key, &tablet.identity).unwrap();
        assert!(state.merge_on_write);
        let bitmap = state.delete_bitmap.expect("empty bitmap attached");
        assert_eq!(bitmap.tablet_id(), 5);
        assert_eq!(bitmap.cardinality(), 0);
    }

    #[test]
    fn commit_recovered__plain_tablet_has_no_bitmap() {
        let ledger = small_ledger();
        let tablet = MockTablet::new(5, 0);
        let key = TransactionKey::new(1, 100);
        let rowset = pending_rowset(1, &tablet.identity, key, LoadId(3));

        ledger
            .commit_recovered(key, &tablet.identity, LoadId(3), rowset, false)
            .unwrap();

        let state = ledger.get(key, &tablet.identity).unwrap();
        assert!(!state.merge_on_write);
        assert!(state.delete_bitmap.is_none());
    }
}
