//! # Transaction Ledger
//!
//! Tracks every in-flight load transaction per tablet until it is durably
//! published as a new tablet version, rolled back before commit, or deleted
//! after an aborted commit.
//!
//! ## Entry lifecycle
//!
//! ```text
//! ABSENT --prepare--> PREPARED (rowset = None) --commit--> COMMITTED (rowset = Some)
//!   ^                     |                                  |          |
//!   +------rollback-------+                     publish -----+          +----- delete
//!                                               (removed, version       (removed, meta
//!                                                advanced)               dropped)
//! ```
//!
//! ## Locking
//!
//! Two independent lock arrays:
//!
//! - **Shard locks**: `S` read/write locks, each owning the entry map and the
//!   partition index of the transactions that hash to it (`txn_id & (S-1)`).
//!   Only short in-memory mutations run under a shard lock; metadata I/O
//!   never does.
//! - **Transaction locks**: `M` plain mutexes selected by a different hash of
//!   the transaction id. `commit`, `publish`, `rollback`, `delete` and
//!   `set_txn_delete_bitmap` hold the transaction lock for their whole
//!   duration, so multi-step operations on one transaction are totally
//!   ordered even while their metadata writes run unlocked at shard level.
//!
//! Lock order is always transaction lock, then shard lock.
//!
//! ## Idempotence
//!
//! Repeating `prepare` or `commit` with the same load id (and, for commit,
//! the same rowset id) is a successful no-op. A commit carrying a different
//! rowset for an already committed entry fails with
//! [`LedgerError::AlreadyExists`]; the stored rowset is never overwritten.
//! `publish` is retryable: a rowset already visible at the requested version
//! skips straight to the remaining steps.

mod state;
mod unused;
mod writers;

#[cfg(test)]
mod tests;

pub use state::TabletTxnState;
pub use unused::UnusedRowsets;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::SharedConfig;
use crate::meta_store::{MetaStore, MetaStoreError};
use crate::model::{
    DeleteBitmap, LoadId, PartitionId, Rowset, RowsetId, RowsetIdSet, TabletId, TabletIdentity,
    TransactionId, TransactionKey, Version, unix_seconds,
};
use crate::tablet::{DeltaWriter, SegmentCache, Tablet, TabletError};
use state::ShardMaps;
use writers::DeltaWriterRegistry;

/// Errors returned by ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The requested object is not tracked.
    #[error("not found: {0}")]
    NotFound(String),

    /// No committed entry exists for the transaction and tablet.
    #[error("transaction {key} does not exist for tablet {tablet}")]
    TransactionNotExist {
        key: TransactionKey,
        tablet: TabletIdentity,
    },

    /// A different rowset is already committed for this entry.
    #[error(
        "transaction {key} on tablet {tablet} already committed rowset {existing}, refusing {incoming}"
    )]
    AlreadyExists {
        key: TransactionKey,
        tablet: TabletIdentity,
        existing: RowsetId,
        incoming: RowsetId,
    },

    /// The entry holds committed (or published) data and cannot be dropped
    /// this way.
    #[error("transaction {key} on tablet {tablet} is already committed")]
    AlreadyCommitted {
        key: TransactionKey,
        tablet: TabletIdentity,
    },

    /// The shard owning the transaction is at its concurrent-transaction
    /// ceiling.
    #[error("too many running transactions: {running} (limit {limit})")]
    TooManyTransactions { running: usize, limit: usize },

    /// The metadata store rejected a write or remove.
    #[error("metadata persistence failed: {0}")]
    PersistenceFailed(#[from] MetaStoreError),

    /// Malformed identity.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A tablet collaborator failed during publish.
    #[error("tablet error: {0}")]
    Tablet(#[from] TabletError),

    /// Poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Sharded registry of in-flight load transactions.
pub struct Ledger {
    config: SharedConfig,
    shards: Box<[RwLock<ShardMaps>]>,
    txn_locks: Box<[Mutex<()>]>,
    writers: DeltaWriterRegistry,
    segment_cache: Option<Arc<dyn SegmentCache>>,
    unused: Arc<UnusedRowsets>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("shards", &self.shards.len())
            .field("txn_locks", &self.txn_locks.len())
            .finish_non_exhaustive()
    }
}

/// Picks the transaction lock with a hash unrelated to the shard index, so
/// transactions sharing a shard rarely share a lock.
fn mix(txn_id: TransactionId) -> u64 {
    let mut z = (txn_id as u64).wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

impl Ledger {
    /// Builds an empty ledger. Shard counts are read once from `config`.
    pub fn new(config: SharedConfig) -> Self {
        let snapshot = config.snapshot();
        let shard_count = snapshot.txn_map_shard_size;
        let lock_count = snapshot.txn_lock_shard_size;
        Self {
            config,
            shards: (0..shard_count)
                .map(|_| RwLock::new(ShardMaps::default()))
                .collect(),
            txn_locks: (0..lock_count).map(|_| Mutex::new(())).collect(),
            writers: DeltaWriterRegistry::new(shard_count),
            segment_cache: None,
            unused: Arc::new(UnusedRowsets::new()),
        }
    }

    /// Segment cache invalidated when a partial-update publish adds segments.
    pub fn with_segment_cache(mut self, cache: Arc<dyn SegmentCache>) -> Self {
        self.segment_cache = Some(cache);
        self
    }

    /// Queue receiving rowsets of deleted or force-rolled-back entries.
    pub fn unused_rowsets(&self) -> &Arc<UnusedRowsets> {
        &self.unused
    }

    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    fn shard(&self, txn_id: TransactionId) -> &RwLock<ShardMaps> {
        &self.shards[(txn_id as u64 as usize) & (self.shards.len() - 1)]
    }

    fn read_shard(&self, txn_id: TransactionId) -> Result<RwLockReadGuard<'_, ShardMaps>, LedgerError> {
        self.shard(txn_id)
            .read()
            .map_err(|_| LedgerError::Internal("RwLock poisoned".into()))
    }

    fn write_shard(
        &self,
        txn_id: TransactionId,
    ) -> Result<RwLockWriteGuard<'_, ShardMaps>, LedgerError> {
        self.shard(txn_id)
            .write()
            .map_err(|_| LedgerError::Internal("RwLock poisoned".into()))
    }

    fn lock_txn(&self, txn_id: TransactionId) -> Result<MutexGuard<'_, ()>, LedgerError> {
        self.txn_locks[(mix(txn_id) as usize) & (self.txn_locks.len() - 1)]
            .lock()
            .map_err(|_| LedgerError::Internal("Mutex poisoned".into()))
    }

    /// Read-only sweeps tolerate a poisoned shard; the maps stay consistent
    /// because every mutation completes before its guard drops.
    fn each_shard_read(&self) -> impl Iterator<Item = RwLockReadGuard<'_, ShardMaps>> {
        self.shards
            .iter()
            .map(|shard| shard.read().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    fn check_identity(key: TransactionKey, tablet: &TabletIdentity) -> Result<(), LedgerError> {
        if key.partition_id < 1 || key.transaction_id < 1 || tablet.tablet_id < 1 {
            error!(
                partition_id = key.partition_id,
                txn_id = key.transaction_id,
                tablet_id = tablet.tablet_id,
                "invalid transaction identity"
            );
            return Err(LedgerError::InvalidArgument(format!(
                "partition {}, transaction {} and tablet {} must all be positive",
                key.partition_id, key.transaction_id, tablet.tablet_id
            )));
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Mutations
    // --------------------------------------------------------------------------------------------

    /// Registers an empty entry for `tablet` under `key`.
    ///
    /// A repeat for an entry already committed under the same `load_id`
    /// succeeds without change. A new transaction is refused with
    /// [`LedgerError::TooManyTransactions`] once its shard tracks
    /// `max_running_txns_per_shard` transactions.
    pub fn prepare(
        &self,
        key: TransactionKey,
        tablet: &TabletIdentity,
        load_id: LoadId,
    ) -> Result<(), LedgerError> {
        Self::check_identity(key, tablet)?;
        let limit = self.config.snapshot().max_running_txns_per_shard;
        let mut shard = self.write_shard(key.transaction_id)?;

        if let Some(existing) = shard.get(&key, tablet) {
            if existing.rowset.is_some() {
                if existing.load_id == load_id {
                    warn!(%key, %tablet, %load_id, "transaction already committed, prepare ignored");
                    return Ok(());
                }
                warn!(%key, %tablet, %load_id, existing = %existing.load_id, "prepare refused, entry holds a committed rowset");
                return Err(LedgerError::AlreadyCommitted { key, tablet: *tablet });
            }
        }

        let running = shard.running_transactions();
        if !shard.partitions.contains_key(&key.transaction_id) && running >= limit {
            warn!(running, limit, txn_id = key.transaction_id, "too many running transactions");
            return Err(LedgerError::TooManyTransactions { running, limit });
        }

        shard.install(key, *tablet, TabletTxnState::prepared(load_id));
        debug!(%key, %tablet, %load_id, "transaction prepared");
        Ok(())
    }

    /// Persists `rowset` as the output of `load_id` and installs it.
    ///
    /// The metadata write runs outside the shard lock but under the
    /// transaction lock. A failed write leaves the ledger untouched.
    pub fn commit(
        &self,
        meta: &dyn MetaStore,
        key: TransactionKey,
        tablet: &TabletIdentity,
        load_id: LoadId,
        rowset: Arc<Rowset>,
    ) -> Result<(), LedgerError> {
        self.commit_inner(Some(meta), key, tablet, load_id, rowset, false)
    }

    /// Re-installs a committed entry found in the metadata store at startup.
    ///
    /// Nothing is written back. Merge-on-write tablets get an empty delete
    /// bitmap so the publish path can fill it.
    pub fn commit_recovered(
        &self,
        key: TransactionKey,
        tablet: &TabletIdentity,
        load_id: LoadId,
        rowset: Arc<Rowset>,
        merge_on_write: bool,
    ) -> Result<(), LedgerError> {
        self.commit_inner(None, key, tablet, load_id, rowset, merge_on_write)
    }

    fn commit_inner(
        &self,
        meta: Option<&dyn MetaStore>,
        key: TransactionKey,
        tablet: &TabletIdentity,
        load_id: LoadId,
        rowset: Arc<Rowset>,
        merge_on_write: bool,
    ) -> Result<(), LedgerError> {
        Self::check_identity(key, tablet)?;
        let rowset_id = rowset.rowset_id();
        let _txn = self.lock_txn(key.transaction_id)?;

        {
            let shard = self.read_shard(key.transaction_id)?;
            if let Some(existing) = shard.get(&key, tablet).and_then(|s| {
                s.rowset.as_ref().map(|r| (s.load_id, r.rowset_id()))
            }) {
                let (existing_load, existing_rowset) = existing;
                if existing_load == load_id && existing_rowset == rowset_id {
                    info!(%key, %tablet, %rowset_id, "rowset already committed, duplicate commit");
                    return Ok(());
                }
                warn!(%key, %tablet, existing = %existing_rowset, incoming = %rowset_id, "conflicting commit");
                return Err(LedgerError::AlreadyExists {
                    key,
                    tablet: *tablet,
                    existing: existing_rowset,
                    incoming: rowset_id,
                });
            }
        }

        if let Some(meta) = meta {
            meta.save(tablet.tablet_uid, &rowset.meta(), false)
                .inspect_err(|e| {
                    warn!(%key, %tablet, %rowset_id, error = %e, "failed to save committed rowset");
                })?;
        }

        let mut state = TabletTxnState::committed(load_id, rowset);
        if meta.is_none() && merge_on_write {
            state.merge_on_write = true;
            state.delete_bitmap = Some(DeleteBitmap::new(tablet.tablet_id));
        }

        let mut shard = self.write_shard(key.transaction_id)?;
        shard.install(key, *tablet, state);
        debug!(%key, %tablet, %rowset_id, recovered = meta.is_none(), "transaction committed");
        Ok(())
    }

    /// Publishes the committed rowset of `tablet` at `version`.
    ///
    /// Steps, each aborting with the entry left intact on failure:
    ///
    /// 1. make the rowset visible (skipped if already visible at `version`),
    /// 2. for merge-on-write loads, resolve the delete bitmap through a
    ///    transient writer and stage the partial-update segments,
    /// 3. append to the binlog when enabled,
    /// 4. persist the final rowset metadata,
    /// 5. fold the staged segments into the shared rowset and drop the entry.
    ///
    /// The shared rowset only changes after step 4 succeeds, so a retry
    /// rebuilds the transient rowset against the original metadata.
    pub fn publish(
        &self,
        meta: &dyn MetaStore,
        tablet: &dyn Tablet,
        key: TransactionKey,
        version: Version,
    ) -> Result<(), LedgerError> {
        let identity = tablet.identity();
        if !version.is_published() {
            error!(%key, tablet = %identity, %version, "publish requested with an unpublished version");
            return Err(LedgerError::InvalidArgument(format!(
                "cannot publish transaction {key} on tablet {identity} at version {version}"
            )));
        }
        let _txn = self.lock_txn(key.transaction_id)?;

        let state = {
            let shard = self.read_shard(key.transaction_id)?;
            shard.get(&key, &identity).cloned()
        };
        let Some((state, rowset)) =
            state.and_then(|s| s.rowset.clone().map(|rowset| (s, rowset)))
        else {
            warn!(%key, tablet = %identity, "publish failed, no committed rowset");
            return Err(LedgerError::TransactionNotExist {
                key,
                tablet: identity,
            });
        };
        let rowset_id = rowset.rowset_id();

        let current = rowset.version();
        if current == version {
            debug!(%key, tablet = %identity, %rowset_id, %version, "rowset already visible, resuming publish");
        } else if current.is_published() {
            warn!(%key, tablet = %identity, %rowset_id, %current, requested = %version, "rowset already published at another version");
            return Err(LedgerError::AlreadyCommitted {
                key,
                tablet: identity,
            });
        } else {
            tablet.make_rowset_visible(&rowset, version)?;
        }

        let config = self.config.snapshot();
        let mut final_meta = rowset.meta();
        let mut transient = None;
        if state.merge_on_write && config.enable_merge_on_write {
            let mut writer = tablet.create_transient_rowset_writer(&rowset)?;
            tablet.update_delete_bitmap(&rowset, &state, writer.as_mut())?;
            if rowset.is_partial_update() && config.enable_partial_update {
                writer.flush()?;
                let built = writer.build()?;
                final_meta.merge_from(&built);
                transient = Some(built);
            }
            tablet.save_meta()?;
        }

        let binlog = tablet.binlog_enabled();
        if binlog {
            // The binlog sees the merged segments without touching the shared rowset.
            let staged = transient.as_ref().map(|_| Rowset::new(final_meta.clone()));
            let target: &Rowset = staged.as_deref().unwrap_or(&*rowset);
            tablet.add_to_binlog(target).inspect_err(|e| {
                warn!(%key, tablet = %identity, %rowset_id, error = %e, "failed to add rowset to binlog");
            })?;
        }

        meta.save(identity.tablet_uid, &final_meta, binlog)
            .inspect_err(|e| {
                warn!(%key, tablet = %identity, %rowset_id, error = %e, "failed to save published rowset");
            })?;

        if let Some(transient) = &transient {
            rowset.merge_rowset_meta(transient);
            if let Some(cache) = &self.segment_cache {
                cache.erase(rowset_id);
            }
        }

        let mut shard = self.write_shard(key.transaction_id)?;
        shard.remove(&key, &identity);
        info!(%key, tablet = %identity, %rowset_id, %version, "transaction published");
        Ok(())
    }

    /// Drops a prepared entry that never committed.
    ///
    /// Fails with [`LedgerError::AlreadyCommitted`] once a rowset is
    /// attached; an absent entry is a successful no-op.
    pub fn rollback(&self, key: TransactionKey, tablet: &TabletIdentity) -> Result<(), LedgerError> {
        let _txn = self.lock_txn(key.transaction_id)?;
        let mut shard = self.write_shard(key.transaction_id)?;

        if let Some(state) = shard.get(&key, tablet) {
            if state.rowset.is_some() {
                warn!(%key, %tablet, "rollback refused, rowset already committed");
                return Err(LedgerError::AlreadyCommitted { key, tablet: *tablet });
            }
            shard.remove(&key, tablet);
            info!(%key, %tablet, "transaction rolled back");
        }
        Ok(())
    }

    /// Drops an entry whose rowset never reached a real version, removing
    /// its persisted metadata and queueing the rowset for reclamation.
    pub fn delete(
        &self,
        meta: &dyn MetaStore,
        key: TransactionKey,
        tablet: &TabletIdentity,
    ) -> Result<(), LedgerError> {
        let _txn = self.lock_txn(key.transaction_id)?;

        let rowset = {
            let shard = self.read_shard(key.transaction_id)?;
            let Some(tablets) = shard.txns.get(&key) else {
                return Err(LedgerError::TransactionNotExist { key, tablet: *tablet });
            };
            match tablets.get(tablet) {
                None => return Ok(()),
                Some(state) => state.rowset.clone(),
            }
        };

        if let Some(rowset) = &rowset {
            let version = rowset.version();
            if version.is_published() {
                warn!(%key, %tablet, rowset_id = %rowset.rowset_id(), %version, "delete refused, rowset already published");
                return Err(LedgerError::AlreadyCommitted { key, tablet: *tablet });
            }
            meta.remove(tablet.tablet_uid, rowset.rowset_id())
                .inspect_err(|e| {
                    warn!(%key, %tablet, rowset_id = %rowset.rowset_id(), error = %e, "failed to remove rowset meta");
                })?;
        }

        self.write_shard(key.transaction_id)?.remove(&key, tablet);
        if let Some(rowset) = rowset {
            debug!(%key, %tablet, rowset_id = %rowset.rowset_id(), "transaction deleted");
            self.unused.add(rowset);
        } else {
            debug!(%key, %tablet, "transaction deleted");
        }
        Ok(())
    }

    /// Removes every entry of a tablet being dropped, across all shards.
    ///
    /// Does not take transaction locks: the tablet is going away, so no
    /// ordering with in-flight operations on its transactions is kept.
    /// Metadata removal failures are logged. Returns the number of entries
    /// removed.
    pub fn force_rollback_tablet(&self, meta: &dyn MetaStore, tablet: &TabletIdentity) -> usize {
        let mut removed = Vec::new();
        for shard in self.shards.iter() {
            let mut shard = shard.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            removed.extend(shard.remove_tablet(tablet));
        }

        let count = removed.len();
        for (key, state) in removed {
            let Some(rowset) = state.rowset else {
                info!(%key, %tablet, "removed tablet related transaction");
                continue;
            };
            let rowset_id = rowset.rowset_id();
            if let Err(e) = meta.remove(tablet.tablet_uid, rowset_id) {
                warn!(%key, %tablet, %rowset_id, error = %e, "failed to remove rowset meta during force rollback");
            }
            info!(%key, %tablet, %rowset_id, "removed tablet related transaction");
            self.unused.add(rowset);
        }
        count
    }

    /// Attaches merge-on-write bookkeeping to an existing entry.
    ///
    /// A missing entry means the transaction was already cleared; it is
    /// logged and ignored.
    pub fn set_txn_delete_bitmap(
        &self,
        key: TransactionKey,
        tablet: &TabletIdentity,
        merge_on_write: bool,
        delete_bitmap: Arc<DeleteBitmap>,
        rowset_ids: RowsetIdSet,
    ) -> Result<(), LedgerError> {
        let _txn = self.lock_txn(key.transaction_id)?;
        let mut shard = self.write_shard(key.transaction_id)?;
        match shard.get_mut(&key, tablet) {
            Some(state) => {
                state.merge_on_write = merge_on_write;
                state.delete_bitmap = Some(delete_bitmap);
                state.rowset_ids = rowset_ids;
                debug!(%key, %tablet, merge_on_write, "delete bitmap attached");
            }
            None => warn!(%key, %tablet, "transaction may be cleared, delete bitmap dropped"),
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Delta writers
    // --------------------------------------------------------------------------------------------

    /// Registers a non-owning handle to the writer producing `tablet_id`'s
    /// share of `txn_id`.
    pub fn add_delta_writer(
        &self,
        txn_id: TransactionId,
        tablet_id: TabletId,
        writer: &Arc<dyn DeltaWriter>,
    ) {
        self.writers.add(txn_id, tablet_id, writer);
    }

    /// Forwards a replica pull result to the registered writer.
    pub fn finish_slave_pull_rowset(
        &self,
        txn_id: TransactionId,
        tablet_id: TabletId,
        node_id: i64,
        succeeded: bool,
    ) -> Result<(), LedgerError> {
        let writer = self.writers.get(txn_id, tablet_id).ok_or_else(|| {
            LedgerError::NotFound(format!(
                "delta writer for transaction {txn_id}, tablet {tablet_id}"
            ))
        })?;
        writer.finish_slave_pull_rowset(node_id, succeeded);
        Ok(())
    }

    pub fn clear_delta_writers(&self, txn_id: TransactionId) {
        self.writers.clear(txn_id);
    }

    // --------------------------------------------------------------------------------------------
    // Queries
    // --------------------------------------------------------------------------------------------

    /// Partition and transaction ids with an entry for `tablet`.
    pub fn related_transactions(
        &self,
        tablet: &TabletIdentity,
    ) -> Option<(PartitionId, BTreeSet<TransactionId>)> {
        let mut partition = None;
        let mut txns = BTreeSet::new();
        for shard in self.each_shard_read() {
            for (key, tablets) in &shard.txns {
                if tablets.contains_key(tablet) {
                    partition = Some(key.partition_id);
                    txns.insert(key.transaction_id);
                }
            }
        }
        partition.map(|p| (p, txns))
    }

    /// Every tablet taking part in `key`, with its committed rowset if any.
    pub fn related_tablets(&self, key: TransactionKey) -> BTreeMap<TabletIdentity, Option<Arc<Rowset>>> {
        let shard = self
            .shard(key.transaction_id)
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        shard
            .txns
            .get(&key)
            .map(|tablets| {
                tablets
                    .iter()
                    .map(|(tablet, state)| (*tablet, state.rowset.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every tablet with at least one entry.
    pub fn all_related_tablets(&self) -> BTreeSet<TabletIdentity> {
        let mut tablets = BTreeSet::new();
        for shard in self.each_shard_read() {
            for entries in shard.txns.values() {
                tablets.extend(entries.keys().copied());
            }
        }
        tablets
    }

    pub fn has_transaction(&self, key: TransactionKey, tablet: &TabletIdentity) -> bool {
        self.shard(key.transaction_id)
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key, tablet)
            .is_some()
    }

    /// Entries older than `ttl`, grouped by tablet.
    pub fn expired_transactions(&self, ttl: Duration) -> BTreeMap<TabletIdentity, Vec<TransactionId>> {
        let now = unix_seconds();
        let ttl = ttl.as_secs() as i64;
        let mut expired: BTreeMap<TabletIdentity, Vec<TransactionId>> = BTreeMap::new();
        for shard in self.each_shard_read() {
            for (key, tablets) in &shard.txns {
                for (tablet, state) in tablets {
                    let age = now - state.creation_time;
                    if age >= ttl {
                        debug!(%tablet, txn_id = key.transaction_id, age, "found expired transaction");
                        expired.entry(*tablet).or_default().push(key.transaction_id);
                    }
                }
            }
        }
        for txns in expired.values_mut() {
            txns.sort_unstable();
        }
        expired
    }

    /// Partitions `txn_id` currently has entries in, ascending.
    pub fn partitions_of(&self, txn_id: TransactionId) -> Vec<PartitionId> {
        let shard = self
            .shard(txn_id)
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut partitions: Vec<_> = shard
            .partitions
            .get(&txn_id)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default();
        partitions.sort_unstable();
        partitions
    }

    /// Snapshot of one entry.
    pub fn get(&self, key: TransactionKey, tablet: &TabletIdentity) -> Option<TabletTxnState> {
        self.shard(key.transaction_id)
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key, tablet)
            .cloned()
    }
}
