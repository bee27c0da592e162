//! # Collaborator seams
//!
//! Traits for everything the ledger and the scheduler consume but do not
//! implement: the tablet itself (version state, merge execution, cold-tier
//! upload), the data directories it lives on, the tablet manager that ranks
//! merge debt, and a few narrow helpers used at publish time.
//!
//! The row-group format, the merge algorithm and the file layout stay behind
//! these traits. Defaults cover the behaviour of a plain duplicate-key tablet
//! with no cold tier, so implementors only override what they support.

#[cfg(test)]
pub(crate) mod tests;

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;

use crate::ledger::TabletTxnState;
use crate::model::{
    CompactionClass, Rowset, RowsetId, RowsetMeta, TabletId, TabletIdentity, TabletUid, Version,
};

/// Failure reported by a collaborator.
#[derive(Debug, Error)]
pub enum TabletError {
    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The rowset could not be appended to the tablet binlog.
    #[error("binlog append failed: {0}")]
    Binlog(String),

    /// The collaborator does not support the requested operation.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Any other collaborator failure.
    #[error("{0}")]
    Failed(String),
}

/// Identifier of one local data directory (disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataDirId(pub u32);

impl fmt::Display for DataDirId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "disk-{}", self.0)
    }
}

/// Writer for the extra segment a partial-update publish produces.
pub trait TransientRowsetWriter: Send {
    fn flush(&mut self) -> Result<(), TabletError>;

    /// Finishes the transient rowset and returns its metadata.
    fn build(&mut self) -> Result<RowsetMeta, TabletError>;
}

/// One independently versioned tablet.
pub trait Tablet: Send + Sync {
    fn identity(&self) -> TabletIdentity;

    fn tablet_id(&self) -> TabletId {
        self.identity().tablet_id
    }

    /// Data directory hosting this tablet.
    fn data_dir(&self) -> DataDirId;

    /// `false` once the tablet is being dropped or altered.
    fn is_running(&self) -> bool {
        true
    }

    /// Schema-level opt-out from background compaction.
    fn auto_compaction_disabled(&self) -> bool {
        false
    }

    /// Whether loads resolve updates into a delete bitmap at publish time.
    fn merge_on_write(&self) -> bool {
        false
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// Picks the input rowsets for `class` and returns the estimated cost
    /// in permits. Zero means there is nothing worth merging.
    fn prepare_and_estimate_cost(&self, class: CompactionClass) -> Result<u64, TabletError>;

    fn execute_merge(&self, class: CompactionClass) -> Result<(), TabletError>;

    /// Drops the transient merge bookkeeping created by
    /// [`prepare_and_estimate_cost`](Tablet::prepare_and_estimate_cost).
    /// Must be called on every path, including failures.
    fn reset_merge_state(&self, class: CompactionClass);

    // --------------------------------------------------------------------------------------------
    // Publish
    // --------------------------------------------------------------------------------------------

    fn make_rowset_visible(&self, rowset: &Rowset, version: Version) -> Result<(), TabletError> {
        rowset.make_visible(version);
        Ok(())
    }

    fn create_transient_rowset_writer(
        &self,
        _rowset: &Rowset,
    ) -> Result<Box<dyn TransientRowsetWriter>, TabletError> {
        Err(TabletError::Unsupported("transient rowset writer"))
    }

    /// Resolves the rows `rowset` supersedes into the delete bitmap carried
    /// by `txn`, writing any filler segment through `writer`.
    fn update_delete_bitmap(
        &self,
        _rowset: &Rowset,
        _txn: &TabletTxnState,
        _writer: &mut dyn TransientRowsetWriter,
    ) -> Result<(), TabletError> {
        Err(TabletError::Unsupported("delete bitmap"))
    }

    /// Persists the tablet header.
    fn save_meta(&self) -> Result<(), TabletError> {
        Ok(())
    }

    fn binlog_enabled(&self) -> bool {
        false
    }

    fn add_to_binlog(&self, _rowset: &Rowset) -> Result<(), TabletError> {
        Err(TabletError::Unsupported("binlog"))
    }

    // --------------------------------------------------------------------------------------------
    // Cold tier
    // --------------------------------------------------------------------------------------------

    /// Uploads cold rowsets, or follows the cooldown metadata of the
    /// replica that owns the upload.
    fn cooldown(&self) -> Result<(), TabletError> {
        Ok(())
    }

    fn calc_cold_tier_debt_score(&self) -> u32 {
        0
    }

    /// A cooldown policy is configured for this tablet.
    fn has_cooldown_config(&self) -> bool {
        false
    }

    /// This replica uploads; other replicas follow its metadata.
    fn is_cooldown_replica(&self) -> bool {
        false
    }

    fn needs_cooldown(&self) -> bool {
        false
    }

    fn last_failed_follow_cooldown(&self) -> Option<SystemTime> {
        None
    }
}

/// A local data directory.
pub trait DataDir: Send + Sync {
    fn id(&self) -> DataDirId;

    fn path(&self) -> &Path;

    fn is_ssd(&self) -> bool;

    /// Whether writing `incoming_bytes` more would cross the capacity limit.
    fn reach_capacity_limit(&self, _incoming_bytes: u64) -> bool {
        false
    }

    /// Empties expired trash and snapshots; returns the disk usage ratio
    /// in `[0.0, 1.0]` observed afterwards.
    fn sweep_trash(&self) -> Result<f64, TabletError>;

    fn perform_path_scan(&self) -> Result<(), TabletError> {
        Ok(())
    }

    fn perform_path_gc(&self) -> Result<(), TabletError> {
        Ok(())
    }
}

/// Highest-debt tablet of one directory, plus the directory's top score.
pub struct BestCandidate {
    pub tablet: Option<Arc<dyn Tablet>>,
    pub max_score: u32,
}

/// Process-wide caches pruned by the cache cleaner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    FileDescriptor,
    RowLookup,
    FileCache,
}

/// Registry of all tablets on this node.
pub trait TabletManager: Send + Sync {
    /// Highest merge-debt tablet for `class` on `dir`, skipping `excluded`.
    fn find_best_candidate(
        &self,
        class: CompactionClass,
        dir: &dyn DataDir,
        excluded: &HashSet<TabletId>,
    ) -> BestCandidate;

    fn tablets_matching(&self, predicate: &dyn Fn(&dyn Tablet) -> bool) -> Vec<Arc<dyn Tablet>>;

    /// The live incarnation of a tablet, if `tablet_uid` still matches.
    fn get_tablet(&self, tablet_id: TabletId, tablet_uid: TabletUid) -> Option<Arc<dyn Tablet>> {
        self.tablets_matching(&|t| {
            let identity = t.identity();
            identity.tablet_id == tablet_id && identity.tablet_uid == tablet_uid
        })
        .into_iter()
        .next()
    }

    /// Tablets with rowsets due for upload, highest priority first.
    fn cooldown_candidates(&self, skip: &dyn Fn(&dyn Tablet) -> bool) -> Vec<Arc<dyn Tablet>> {
        self.tablets_matching(&|t| t.needs_cooldown() && !skip(t))
    }

    fn checkpoint_metadata(&self, dir: &dyn DataDir) -> Result<(), TabletError>;

    /// Deletes the files of a rowset nobody references any more.
    fn reclaim_rowset(&self, rowset: &Rowset) -> Result<(), TabletError>;

    fn clean_cache(&self, _kind: CacheKind) -> Result<(), TabletError> {
        Ok(())
    }
}

/// Cache of opened row-group segments, keyed by rowset.
pub trait SegmentCache: Send + Sync {
    fn erase(&self, rowset_id: RowsetId);
}

/// Writer-side handle tracking replica pulls of a load's rowset.
pub trait DeltaWriter: Send + Sync {
    fn finish_slave_pull_rowset(&self, node_id: i64, succeeded: bool);
}
