//! # tabletstore
//!
//! The transactional write path and background compaction scheduler of a
//! storage engine that manages many independently versioned tablets spread
//! across several local disks.
//!
//! - The **transaction ledger** tracks every in-flight load per tablet,
//!   from prepare through commit to publish (or rollback / delete), with
//!   idempotent retries and crash recovery from persisted rowset metadata.
//! - The **compaction scheduler** keeps ranking tablets by merge debt and
//!   admits merges under per-disk slot limits and a global permit budget.
//! - **Sweepers** take care of trash, unused rowsets, metadata checkpoints,
//!   cache pruning and path garbage collection.
//!
//! The row-group format and the merge algorithm are supplied by the caller
//! through the traits in [`tablet`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tabletstore::{Collaborators, Store, StoreConfig, LoadId, TransactionKey, Version};
//!
//! let store = Store::open(StoreConfig::default(), Collaborators {
//!     manager,                       // Arc<dyn TabletManager>
//!     data_dirs,                     // Vec<Arc<dyn DataDir>>
//!     meta_store,                    // Arc<dyn MetaStore>
//!     segment_cache: None,
//! })?;
//! store.start()?;
//!
//! let key = TransactionKey::new(1, 100);
//! store.prepare(key, &tablet.identity(), LoadId(7))?;
//! store.commit(key, &tablet.identity(), LoadId(7), rowset)?;
//! store.publish(tablet.as_ref(), key, Version::new(2, 2))?;
//!
//! store.close()?;
//! ```

pub mod compaction;
pub mod config;
pub mod encoding;
pub mod ledger;
pub mod meta_store;
pub mod model;
pub mod permits;
pub mod sweeper;
pub mod tablet;
pub mod worker;

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{info, warn};

pub use compaction::{CompactionScheduler, CompactionScores, SchedulerError};
pub use config::{SharedConfig, StoreConfig};
pub use ledger::{Ledger, LedgerError, TabletTxnState};
pub use meta_store::{
    FileMetaStore, MemoryMetaStore, MetaStore, MetaStoreError, StoredRowsetMeta,
};
pub use model::{
    CompactionClass, DeleteBitmap, LoadId, PartitionId, Rowset, RowsetId, RowsetMeta, TabletId,
    TabletIdentity, TabletUid, TransactionId, TransactionKey, Version,
};
pub use permits::PermitLimiter;
pub use sweeper::Sweeper;
pub use tablet::{
    BestCandidate, CacheKind, DataDir, DataDirId, SegmentCache, Tablet, TabletError, TabletManager,
};

use worker::StopLatch;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Store`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Ledger(#[from] LedgerError),

    #[error("{0}")]
    Scheduler(#[from] SchedulerError),

    #[error("{0}")]
    MetaStore(#[from] MetaStoreError),

    /// Background thread spawn failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Store handle
// ------------------------------------------------------------------------------------------------

/// External services a [`Store`] is built on.
pub struct Collaborators {
    pub manager: Arc<dyn TabletManager>,
    pub data_dirs: Vec<Arc<dyn DataDir>>,
    pub meta_store: Arc<dyn MetaStore>,
    /// Invalidated when a partial-update publish adds segments.
    pub segment_cache: Option<Arc<dyn SegmentCache>>,
}

/// The store context.
///
/// Constructed once at startup; owns the ledger, the permit limiter, the
/// compaction scheduler and the sweepers, and hands them to each other.
///
/// # Thread safety
///
/// `Store` is `Send + Sync` and can be shared across threads via
/// `Arc<Store>`. Ledger calls run on the caller's thread; background work
/// runs on the store's own threads once [`start`](Store::start) is called.
///
/// # Shutdown
///
/// Call [`Store::close`] for a graceful shutdown. If the handle is dropped
/// without calling `close`, the destructor performs the same cleanup
/// silently.
pub struct Store {
    config: SharedConfig,
    meta: Arc<dyn MetaStore>,
    manager: Arc<dyn TabletManager>,
    ledger: Arc<Ledger>,
    permits: Arc<PermitLimiter>,
    scheduler: Arc<CompactionScheduler>,
    sweeper: Sweeper,
    stop: StopLatch,
    closed: AtomicBool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Builds the store and replays committed, unpublished rowsets found
    /// in the metadata store into the ledger.
    ///
    /// Background threads are not started; see [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] if any configuration parameter
    /// is out of range, [`StoreError::MetaStore`] if the persisted metadata
    /// cannot be listed.
    pub fn open(config: StoreConfig, collaborators: Collaborators) -> Result<Self, StoreError> {
        let Collaborators {
            manager,
            data_dirs,
            meta_store,
            segment_cache,
        } = collaborators;
        let config = SharedConfig::new(config)?;
        let snapshot = config.snapshot();

        let mut ledger = Ledger::new(config.clone());
        if let Some(cache) = segment_cache {
            ledger = ledger.with_segment_cache(cache);
        }
        let ledger = Arc::new(ledger);
        let recovered = Self::recover(&ledger, manager.as_ref(), meta_store.as_ref())?;

        let stop = StopLatch::new();
        let permits = Arc::new(PermitLimiter::new(snapshot.total_permits_for_compaction_score));
        let scheduler = Arc::new(CompactionScheduler::new(
            config.clone(),
            Arc::clone(&manager),
            data_dirs.clone(),
            Arc::clone(&permits),
            stop.clone(),
        )?);
        let sweeper = Sweeper::new(
            config.clone(),
            Arc::clone(&manager),
            data_dirs.clone(),
            Arc::clone(ledger.unused_rowsets()),
            Arc::clone(&scheduler),
            stop.clone(),
        );

        info!(
            data_dirs = data_dirs.len(),
            recovered,
            shards = snapshot.txn_map_shard_size,
            "store opened"
        );

        Ok(Self {
            config,
            meta: meta_store,
            manager,
            ledger,
            permits,
            scheduler,
            sweeper,
            stop,
            closed: AtomicBool::new(false),
        })
    }

    /// Re-installs every pending rowset record whose tablet still exists.
    fn recover(
        ledger: &Ledger,
        manager: &dyn TabletManager,
        meta: &dyn MetaStore,
    ) -> Result<usize, StoreError> {
        let mut recovered = 0;
        for record in meta.list()? {
            let rowset_meta = record.meta;
            if rowset_meta.version.is_published() {
                continue;
            }
            let Some(tablet) = manager.get_tablet(rowset_meta.tablet_id, rowset_meta.tablet_uid)
            else {
                warn!(
                    tablet_id = rowset_meta.tablet_id,
                    rowset_id = %rowset_meta.rowset_id,
                    "pending rowset of unknown tablet, skipped"
                );
                continue;
            };
            let key = TransactionKey::new(rowset_meta.partition_id, rowset_meta.txn_id);
            let load_id = rowset_meta.load_id;
            match ledger.commit_recovered(
                key,
                &tablet.identity(),
                load_id,
                Rowset::new(rowset_meta),
                tablet.merge_on_write(),
            ) {
                Ok(()) => recovered += 1,
                Err(e) => warn!(%key, error = %e, "failed to recover pending rowset"),
            }
        }
        Ok(recovered)
    }

    /// Spawns the compaction producers and the sweepers.
    pub fn start(&self) -> Result<(), StoreError> {
        self.check_open()?;
        self.scheduler.start()?;
        self.sweeper.start()?;
        info!("background work started");
        Ok(())
    }

    /// Gracefully shuts down the store.
    ///
    /// Stops every producer loop, waits for queued background work to
    /// drain and joins all threads. Subsequent operations on this handle
    /// return [`StoreError::Closed`]. Calling `close` more than once is
    /// harmless.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(()); // Already closed.
        }
        self.shutdown_background();
        info!("store closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn scheduler(&self) -> &Arc<CompactionScheduler> {
        &self.scheduler
    }

    pub fn permits(&self) -> &Arc<PermitLimiter> {
        &self.permits
    }

    pub fn meta_store(&self) -> &Arc<dyn MetaStore> {
        &self.meta
    }

    pub fn manager(&self) -> &Arc<dyn TabletManager> {
        &self.manager
    }

    // --------------------------------------------------------------------------------------------
    // Transactions
    // --------------------------------------------------------------------------------------------

    pub fn prepare(
        &self,
        key: TransactionKey,
        tablet: &TabletIdentity,
        load_id: LoadId,
    ) -> Result<(), StoreError> {
        self.check_open()?;
        Ok(self.ledger.prepare(key, tablet, load_id)?)
    }

    pub fn commit(
        &self,
        key: TransactionKey,
        tablet: &TabletIdentity,
        load_id: LoadId,
        rowset: Arc<Rowset>,
    ) -> Result<(), StoreError> {
        self.check_open()?;
        Ok(self
            .ledger
            .commit(self.meta.as_ref(), key, tablet, load_id, rowset)?)
    }

    pub fn publish(
        &self,
        tablet: &dyn Tablet,
        key: TransactionKey,
        version: Version,
    ) -> Result<(), StoreError> {
        self.check_open()?;
        Ok(self
            .ledger
            .publish(self.meta.as_ref(), tablet, key, version)?)
    }

    pub fn rollback(&self, key: TransactionKey, tablet: &TabletIdentity) -> Result<(), StoreError> {
        self.check_open()?;
        Ok(self.ledger.rollback(key, tablet)?)
    }

    pub fn delete(&self, key: TransactionKey, tablet: &TabletIdentity) -> Result<(), StoreError> {
        self.check_open()?;
        Ok(self.ledger.delete(self.meta.as_ref(), key, tablet)?)
    }

    /// Drops every entry of a tablet being removed. Returns the count.
    pub fn force_rollback_tablet(&self, tablet: &TabletIdentity) -> Result<usize, StoreError> {
        self.check_open()?;
        Ok(self.ledger.force_rollback_tablet(self.meta.as_ref(), tablet))
    }

    pub fn has_transaction(&self, key: TransactionKey, tablet: &TabletIdentity) -> bool {
        self.ledger.has_transaction(key, tablet)
    }

    /// Unpublished transactions older than `pending_data_expire_time`.
    pub fn expired_transactions(&self) -> BTreeMap<TabletIdentity, Vec<TransactionId>> {
        let ttl = self.config.snapshot().pending_data_expire_time;
        self.ledger.expired_transactions(ttl)
    }

    pub fn related_transactions(
        &self,
        tablet: &TabletIdentity,
    ) -> Option<(PartitionId, BTreeSet<TransactionId>)> {
        self.ledger.related_transactions(tablet)
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// Admits one compaction outside the production loop. Returns
    /// `Ok(false)` when the tablet had nothing to merge.
    pub fn submit_compaction(
        &self,
        tablet: Arc<dyn Tablet>,
        class: CompactionClass,
        force: bool,
    ) -> Result<bool, StoreError> {
        self.check_open()?;
        Ok(self.scheduler.submit_compaction(tablet, class, force)?)
    }

    pub fn compaction_scores(&self) -> CompactionScores {
        self.scheduler.scores()
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(StoreError::Closed)` if the store has been closed.
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Latches the stop signal, joins the sweepers and producers, then
    /// drains the worker pools.
    fn shutdown_background(&self) {
        self.stop.stop();
        self.sweeper.shutdown();
        self.scheduler.shutdown();
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.shutdown_background();
        }
    }
}
