//! Per-entry transaction state and the contents of one ledger shard.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::model::{
    DeleteBitmap, LoadId, PartitionId, Rowset, RowsetIdSet, TabletIdentity, TransactionId,
    TransactionKey, unix_seconds,
};

/// State of one tablet's share of a load transaction.
///
/// `rowset` is `None` from `prepare` until `commit`. Merge-on-write loads
/// additionally carry the delete bitmap and the rowset-id snapshot the
/// bitmap was computed against.
#[derive(Debug, Clone)]
pub struct TabletTxnState {
    pub load_id: LoadId,
    pub rowset: Option<Arc<Rowset>>,
    /// Unix seconds.
    pub creation_time: i64,
    pub merge_on_write: bool,
    pub delete_bitmap: Option<Arc<DeleteBitmap>>,
    pub rowset_ids: RowsetIdSet,
}

impl TabletTxnState {
    pub(crate) fn prepared(load_id: LoadId) -> Self {
        Self {
            load_id,
            rowset: None,
            creation_time: unix_seconds(),
            merge_on_write: false,
            delete_bitmap: None,
            rowset_ids: RowsetIdSet::new(),
        }
    }

    pub(crate) fn committed(load_id: LoadId, rowset: Arc<Rowset>) -> Self {
        Self {
            rowset: Some(rowset),
            ..Self::prepared(load_id)
        }
    }

    pub fn is_committed(&self) -> bool {
        self.rowset.is_some()
    }
}

pub(crate) type TabletTxnMap = HashMap<TabletIdentity, TabletTxnState>;

/// Everything one shard lock protects.
#[derive(Debug, Default)]
pub(crate) struct ShardMaps {
    pub txns: HashMap<TransactionKey, TabletTxnMap>,
    /// Transaction id to the partitions it currently touches in this shard.
    pub partitions: HashMap<TransactionId, HashSet<PartitionId>>,
}

impl ShardMaps {
    pub fn get(&self, key: &TransactionKey, tablet: &TabletIdentity) -> Option<&TabletTxnState> {
        self.txns.get(key).and_then(|tablets| tablets.get(tablet))
    }

    pub fn get_mut(
        &mut self,
        key: &TransactionKey,
        tablet: &TabletIdentity,
    ) -> Option<&mut TabletTxnState> {
        self.txns
            .get_mut(key)
            .and_then(|tablets| tablets.get_mut(tablet))
    }

    /// Installs `state`, replacing any previous entry for the pair.
    pub fn install(&mut self, key: TransactionKey, tablet: TabletIdentity, state: TabletTxnState) {
        self.txns.entry(key).or_default().insert(tablet, state);
        self.partitions
            .entry(key.transaction_id)
            .or_default()
            .insert(key.partition_id);
    }

    /// Removes one entry. Drops the key and its partition-index membership
    /// once no tablet is left under it.
    pub fn remove(
        &mut self,
        key: &TransactionKey,
        tablet: &TabletIdentity,
    ) -> Option<TabletTxnState> {
        let tablets = self.txns.get_mut(key)?;
        let removed = tablets.remove(tablet);
        if tablets.is_empty() {
            self.txns.remove(key);
            self.clear_partition(key);
        }
        removed
    }

    /// Drops every entry belonging to `tablet`, returning them.
    pub fn remove_tablet(&mut self, tablet: &TabletIdentity) -> Vec<(TransactionKey, TabletTxnState)> {
        let mut removed = Vec::new();
        let mut emptied = Vec::new();
        for (key, tablets) in self.txns.iter_mut() {
            if let Some(state) = tablets.remove(tablet) {
                removed.push((*key, state));
            }
            if tablets.is_empty() {
                emptied.push(*key);
            }
        }
        for key in emptied {
            self.txns.remove(&key);
            self.clear_partition(&key);
        }
        removed
    }

    pub fn running_transactions(&self) -> usize {
        self.partitions.len()
    }

    fn clear_partition(&mut self, key: &TransactionKey) {
        if let Some(partitions) = self.partitions.get_mut(&key.transaction_id) {
            partitions.remove(&key.partition_id);
            if partitions.is_empty() {
                self.partitions.remove(&key.transaction_id);
            }
        }
    }
}
