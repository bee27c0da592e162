//! Queue of rowsets dropped by the ledger whose files still need removal.
//!
//! A rowset is only reclaimed once the queue holds the last strong
//! reference to it, so a reader that still has the rowset open keeps its
//! files alive until the next monitor pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::model::{Rowset, RowsetId};
use crate::tablet::TabletManager;

#[derive(Debug, Default)]
pub struct UnusedRowsets {
    queue: Mutex<HashMap<RowsetId, Arc<Rowset>>>,
}

impl UnusedRowsets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, rowset: Arc<Rowset>) {
        let rowset_id = rowset.rowset_id();
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(rowset_id, rowset);
        debug!(%rowset_id, "rowset queued for reclamation");
    }

    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hands every unreferenced rowset to `manager` for deletion.
    ///
    /// Returns the number reclaimed. Rowsets whose deletion fails stay
    /// queued for the next pass.
    pub fn reclaim(&self, manager: &dyn TabletManager) -> usize {
        let ready: Vec<Arc<Rowset>> = {
            let mut queue = self
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let ids: Vec<RowsetId> = queue
                .iter()
                .filter(|(_, rowset)| Arc::strong_count(rowset) == 1)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| queue.remove(id)).collect()
        };

        let mut reclaimed = 0;
        for rowset in ready {
            match manager.reclaim_rowset(&rowset) {
                Ok(()) => reclaimed += 1,
                Err(e) => {
                    warn!(rowset_id = %rowset.rowset_id(), error = %e, "failed to reclaim unused rowset");
                    self.add(rowset);
                }
            }
        }
        if reclaimed > 0 {
            debug!(reclaimed, "unused rowsets reclaimed");
        }
        reclaimed
    }
}
