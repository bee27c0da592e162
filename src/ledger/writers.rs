//! Registry of the delta writers feeding each (transaction, tablet).
//!
//! The registry only holds [`Weak`] handles: writers are owned by the load
//! channel that created them and may be dropped at any time. A lookup that
//! finds a dead handle behaves like a missing one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use tracing::{debug, warn};

use crate::model::{TabletId, TransactionId};
use crate::tablet::DeltaWriter;

type WriterMap = HashMap<TransactionId, HashMap<TabletId, Weak<dyn DeltaWriter>>>;

pub(crate) struct DeltaWriterRegistry {
    shards: Box<[RwLock<WriterMap>]>,
}

impl DeltaWriterRegistry {
    pub fn new(shard_count: usize) -> Self {
        Self {
            shards: (0..shard_count).map(|_| RwLock::new(WriterMap::new())).collect(),
        }
    }

    fn shard(&self, txn_id: TransactionId) -> &RwLock<WriterMap> {
        &self.shards[(txn_id as u64 as usize) & (self.shards.len() - 1)]
    }

    pub fn add(&self, txn_id: TransactionId, tablet_id: TabletId, writer: &Arc<dyn DeltaWriter>) {
        self.shard(txn_id)
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(txn_id)
            .or_default()
            .insert(tablet_id, Arc::downgrade(writer));
    }

    /// Upgrades the registered handle, if the writer is still alive.
    pub fn get(&self, txn_id: TransactionId, tablet_id: TabletId) -> Option<Arc<dyn DeltaWriter>> {
        let shard = self
            .shard(txn_id)
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(tablets) = shard.get(&txn_id) else {
            warn!(txn_id, tablet_id, "no delta writers registered for transaction");
            return None;
        };
        let Some(handle) = tablets.get(&tablet_id) else {
            warn!(txn_id, tablet_id, "delta writer not registered");
            return None;
        };
        let writer = handle.upgrade();
        if writer.is_none() {
            warn!(txn_id, tablet_id, "delta writer already dropped");
        }
        writer
    }

    pub fn clear(&self, txn_id: TransactionId) {
        self.shard(txn_id)
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&txn_id);
        debug!(txn_id, "delta writers cleared");
    }
}
