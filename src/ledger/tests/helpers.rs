use std::sync::Arc;

use crate::config::{SharedConfig, StoreConfig};
use crate::ledger::Ledger;
use crate::model::{LoadId, Rowset, TransactionKey};
use crate::tablet::tests::helpers::*;

pub use crate::tablet::tests::helpers::init_tracing;

/// Eight shards and eight transaction locks; everything else default.
pub fn small_config() -> StoreConfig {
    init_tracing();
    StoreConfig {
        txn_map_shard_size: 8,
        txn_lock_shard_size: 8,
        ..StoreConfig::default()
    }
}

pub fn ledger_with(config: StoreConfig) -> Ledger {
    Ledger::new(SharedConfig::new(config).unwrap())
}

pub fn small_ledger() -> Ledger {
    ledger_with(small_config())
}

/// Prepares and commits `rowset_id` for `tablet` under `key`.
pub fn committed(
    ledger: &Ledger,
    meta: &FlakyMetaStore,
    tablet: &MockTablet,
    key: TransactionKey,
    rowset_id: u64,
) -> Arc<Rowset> {
    let load = LoadId(key.transaction_id as u128);
    ledger.prepare(key, &tablet.identity, load).unwrap();
    let rowset = pending_rowset(rowset_id, &tablet.identity, key, load);
    ledger
        .commit(meta, key, &tablet.identity, load, Arc::clone(&rowset))
        .unwrap();
    rowset
}
