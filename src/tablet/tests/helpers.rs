//! Scripted collaborators shared by the ledger, compaction and sweeper
//! tests. Every knob is an atomic so a test can flip behaviour while the
//! object is shared with background threads.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crossbeam::channel::{Receiver, Sender, bounded};
use tracing_subscriber::EnvFilter;

use crate::ledger::TabletTxnState;
use crate::meta_store::{MemoryMetaStore, MetaStore, MetaStoreError, StoredRowsetMeta};
use crate::model::{
    CompactionClass, LoadId, Rowset, RowsetId, RowsetMeta, TabletId, TabletIdentity, TabletUid,
    TransactionKey, Version,
};
use crate::tablet::{
    BestCandidate, CacheKind, DataDir, DataDirId, DeltaWriter, SegmentCache, Tablet, TabletError,
    TabletManager, TransientRowsetWriter,
};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn identity(tablet_id: TabletId) -> TabletIdentity {
    TabletIdentity::new(tablet_id, 1, TabletUid(0xA000 + tablet_id as u128))
}

pub fn pending_rowset(
    rowset_id: u64,
    tablet: &TabletIdentity,
    key: TransactionKey,
    load_id: LoadId,
) -> Arc<Rowset> {
    let mut meta = RowsetMeta::pending(RowsetId(rowset_id), tablet, key, load_id);
    meta.num_segments = 2;
    meta.num_rows = 100;
    Rowset::new(meta)
}

/// Polls `cond` every few milliseconds until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// ------------------------------------------------------------------------------------------------
// Tablet
// ------------------------------------------------------------------------------------------------

pub struct MockTablet {
    pub identity: TabletIdentity,
    pub dir: DataDirId,

    pub cost: AtomicU64,
    pub debt: AtomicU32,
    pub fail_prepare: AtomicBool,
    pub fail_merge: AtomicBool,
    pub merges: Mutex<Vec<CompactionClass>>,
    pub resets: AtomicUsize,
    merge_gate: Mutex<Option<Receiver<()>>>,

    pub merge_on_write: AtomicBool,
    pub binlog: AtomicBool,
    pub fail_binlog: AtomicBool,
    pub fail_visible: AtomicBool,
    pub fail_save_meta: AtomicBool,
    pub visible_calls: AtomicUsize,
    pub bitmap_updates: AtomicUsize,
    pub meta_saves: AtomicUsize,
    pub binlog_appends: AtomicUsize,

    pub running: AtomicBool,
    pub auto_compaction_disabled: AtomicBool,
    pub cold_score: AtomicU32,
    pub cooldown_config: AtomicBool,
    pub cooldown_replica: AtomicBool,
    pub needs_cooldown: AtomicBool,
    pub last_failed_follow: Mutex<Option<SystemTime>>,
    pub cooldowns: AtomicUsize,
}

impl MockTablet {
    pub fn new(tablet_id: TabletId, dir: u32) -> Arc<Self> {
        Arc::new(Self {
            identity: identity(tablet_id),
            dir: DataDirId(dir),
            cost: AtomicU64::new(10),
            debt: AtomicU32::new(0),
            fail_prepare: AtomicBool::new(false),
            fail_merge: AtomicBool::new(false),
            merges: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
            merge_gate: Mutex::new(None),
            merge_on_write: AtomicBool::new(false),
            binlog: AtomicBool::new(false),
            fail_binlog: AtomicBool::new(false),
            fail_visible: AtomicBool::new(false),
            fail_save_meta: AtomicBool::new(false),
            visible_calls: AtomicUsize::new(0),
            bitmap_updates: AtomicUsize::new(0),
            meta_saves: AtomicUsize::new(0),
            binlog_appends: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            auto_compaction_disabled: AtomicBool::new(false),
            cold_score: AtomicU32::new(0),
            cooldown_config: AtomicBool::new(false),
            cooldown_replica: AtomicBool::new(false),
            needs_cooldown: AtomicBool::new(false),
            last_failed_follow: Mutex::new(None),
            cooldowns: AtomicUsize::new(0),
        })
    }

    /// Makes every subsequent merge block until the returned sender is
    /// dropped (or five seconds pass).
    pub fn hold_merges(&self) -> Sender<()> {
        let (tx, rx) = bounded(0);
        *self.merge_gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn merge_count(&self) -> usize {
        self.merges.lock().unwrap().len()
    }
}

impl Tablet for MockTablet {
    fn identity(&self) -> TabletIdentity {
        self.identity
    }

    fn data_dir(&self) -> DataDirId {
        self.dir
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn auto_compaction_disabled(&self) -> bool {
        self.auto_compaction_disabled.load(Ordering::SeqCst)
    }

    fn merge_on_write(&self) -> bool {
        self.merge_on_write.load(Ordering::SeqCst)
    }

    fn prepare_and_estimate_cost(&self, _class: CompactionClass) -> Result<u64, TabletError> {
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(TabletError::Failed("no suitable rowsets".into()));
        }
        Ok(self.cost.load(Ordering::SeqCst))
    }

    fn execute_merge(&self, class: CompactionClass) -> Result<(), TabletError> {
        let gate = self.merge_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _ = gate.recv_timeout(Duration::from_secs(5));
        }
        self.merges.lock().unwrap().push(class);
        if self.fail_merge.load(Ordering::SeqCst) {
            return Err(TabletError::Failed("merge failed".into()));
        }
        Ok(())
    }

    fn reset_merge_state(&self, _class: CompactionClass) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn make_rowset_visible(&self, rowset: &Rowset, version: Version) -> Result<(), TabletError> {
        self.visible_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_visible.load(Ordering::SeqCst) {
            return Err(TabletError::Failed("version conflict".into()));
        }
        rowset.make_visible(version);
        Ok(())
    }

    fn create_transient_rowset_writer(
        &self,
        rowset: &Rowset,
    ) -> Result<Box<dyn TransientRowsetWriter>, TabletError> {
        Ok(Box::new(MockTransientWriter {
            target: rowset.meta(),
            flushed: false,
        }))
    }

    fn update_delete_bitmap(
        &self,
        rowset: &Rowset,
        txn: &TabletTxnState,
        _writer: &mut dyn TransientRowsetWriter,
    ) -> Result<(), TabletError> {
        if let Some(bitmap) = &txn.delete_bitmap {
            bitmap.mark((rowset.rowset_id(), 0, rowset.version().first), 0);
        }
        self.bitmap_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn save_meta(&self) -> Result<(), TabletError> {
        if self.fail_save_meta.load(Ordering::SeqCst) {
            return Err(TabletError::Failed("header write failed".into()));
        }
        self.meta_saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn binlog_enabled(&self) -> bool {
        self.binlog.load(Ordering::SeqCst)
    }

    fn add_to_binlog(&self, _rowset: &Rowset) -> Result<(), TabletError> {
        if self.fail_binlog.load(Ordering::SeqCst) {
            return Err(TabletError::Binlog("binlog disk full".into()));
        }
        self.binlog_appends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cooldown(&self) -> Result<(), TabletError> {
        self.cooldowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn calc_cold_tier_debt_score(&self) -> u32 {
        self.cold_score.load(Ordering::SeqCst)
    }

    fn has_cooldown_config(&self) -> bool {
        self.cooldown_config.load(Ordering::SeqCst)
    }

    fn is_cooldown_replica(&self) -> bool {
        self.cooldown_replica.load(Ordering::SeqCst)
    }

    fn needs_cooldown(&self) -> bool {
        self.needs_cooldown.load(Ordering::SeqCst)
    }

    fn last_failed_follow_cooldown(&self) -> Option<SystemTime> {
        *self.last_failed_follow.lock().unwrap()
    }
}

/// Produces one extra segment of ten rows.
pub struct MockTransientWriter {
    target: RowsetMeta,
    flushed: bool,
}

impl TransientRowsetWriter for MockTransientWriter {
    fn flush(&mut self) -> Result<(), TabletError> {
        self.flushed = true;
        Ok(())
    }

    fn build(&mut self) -> Result<RowsetMeta, TabletError> {
        if !self.flushed {
            return Err(TabletError::Failed("build before flush".into()));
        }
        let mut meta = self.target.clone();
        meta.num_segments = 1;
        meta.num_rows = 10;
        meta.data_disk_size = 64;
        Ok(meta)
    }
}

// ------------------------------------------------------------------------------------------------
// Data directory and manager
// ------------------------------------------------------------------------------------------------

pub struct MockDataDir {
    pub id: DataDirId,
    pub path: PathBuf,
    pub ssd: bool,
    pub at_capacity: AtomicBool,
    pub usage: Mutex<f64>,
    pub sweeps: AtomicUsize,
    pub scans: AtomicUsize,
    pub gcs: AtomicUsize,
}

impl MockDataDir {
    pub fn new(id: u32, ssd: bool) -> Arc<Self> {
        Arc::new(Self {
            id: DataDirId(id),
            path: PathBuf::from(format!("/data/{id}")),
            ssd,
            at_capacity: AtomicBool::new(false),
            usage: Mutex::new(0.5),
            sweeps: AtomicUsize::new(0),
            scans: AtomicUsize::new(0),
            gcs: AtomicUsize::new(0),
        })
    }
}

impl DataDir for MockDataDir {
    fn id(&self) -> DataDirId {
        self.id
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn is_ssd(&self) -> bool {
        self.ssd
    }

    fn reach_capacity_limit(&self, _incoming_bytes: u64) -> bool {
        self.at_capacity.load(Ordering::SeqCst)
    }

    fn sweep_trash(&self) -> Result<f64, TabletError> {
        self.sweeps.fetch_add(1, Ordering::SeqCst);
        Ok(*self.usage.lock().unwrap())
    }

    fn perform_path_scan(&self) -> Result<(), TabletError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn perform_path_gc(&self) -> Result<(), TabletError> {
        self.gcs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Ranks tablets by their `debt` knob; a debt of zero is never picked.
#[derive(Default)]
pub struct MockManager {
    pub tablets: Mutex<Vec<Arc<MockTablet>>>,
    pub reclaimed: Mutex<Vec<RowsetId>>,
    pub fail_reclaim: AtomicBool,
    pub checkpoints: AtomicUsize,
    pub cache_cleans: Mutex<Vec<CacheKind>>,
}

impl MockManager {
    pub fn with_tablets(tablets: &[Arc<MockTablet>]) -> Arc<Self> {
        Arc::new(Self {
            tablets: Mutex::new(tablets.to_vec()),
            ..Self::default()
        })
    }
}

impl TabletManager for MockManager {
    fn find_best_candidate(
        &self,
        _class: CompactionClass,
        dir: &dyn DataDir,
        excluded: &HashSet<TabletId>,
    ) -> BestCandidate {
        let tablets = self.tablets.lock().unwrap();
        let best = tablets
            .iter()
            .filter(|t| t.dir == dir.id() && !excluded.contains(&t.identity.tablet_id))
            .filter(|t| t.debt.load(Ordering::SeqCst) > 0)
            .max_by_key(|t| t.debt.load(Ordering::SeqCst));
        BestCandidate {
            max_score: best.map(|t| t.debt.load(Ordering::SeqCst)).unwrap_or(0),
            tablet: best.map(|t| Arc::clone(t) as Arc<dyn Tablet>),
        }
    }

    fn tablets_matching(&self, predicate: &dyn Fn(&dyn Tablet) -> bool) -> Vec<Arc<dyn Tablet>> {
        self.tablets
            .lock()
            .unwrap()
            .iter()
            .filter(|t| predicate(&***t))
            .map(|t| Arc::clone(t) as Arc<dyn Tablet>)
            .collect()
    }

    fn checkpoint_metadata(&self, _dir: &dyn DataDir) -> Result<(), TabletError> {
        self.checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reclaim_rowset(&self, rowset: &Rowset) -> Result<(), TabletError> {
        if self.fail_reclaim.load(Ordering::SeqCst) {
            return Err(TabletError::Failed("files busy".into()));
        }
        self.reclaimed.lock().unwrap().push(rowset.rowset_id());
        Ok(())
    }

    fn clean_cache(&self, kind: CacheKind) -> Result<(), TabletError> {
        self.cache_cleans.lock().unwrap().push(kind);
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Narrow helpers
// ------------------------------------------------------------------------------------------------

#[derive(Default)]
pub struct MockDeltaWriter {
    pub pulls: Mutex<Vec<(i64, bool)>>,
}

impl DeltaWriter for MockDeltaWriter {
    fn finish_slave_pull_rowset(&self, node_id: i64, succeeded: bool) {
        self.pulls.lock().unwrap().push((node_id, succeeded));
    }
}

#[derive(Default)]
pub struct MockSegmentCache {
    pub erased: Mutex<Vec<RowsetId>>,
}

impl SegmentCache for MockSegmentCache {
    fn erase(&self, rowset_id: RowsetId) {
        self.erased.lock().unwrap().push(rowset_id);
    }
}

/// Memory store whose writes and removes can be made to fail on demand.
#[derive(Default)]
pub struct FlakyMetaStore {
    pub inner: MemoryMetaStore,
    pub fail_save: AtomicBool,
    pub fail_remove: AtomicBool,
    pub saves: AtomicUsize,
}

impl MetaStore for FlakyMetaStore {
    fn save(&self, tablet_uid: TabletUid, meta: &RowsetMeta, binlog: bool) -> Result<(), MetaStoreError> {
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(MetaStoreError::Internal("injected save failure".into()));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(tablet_uid, meta, binlog)
    }

    fn remove(&self, tablet_uid: TabletUid, rowset_id: RowsetId) -> Result<(), MetaStoreError> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(MetaStoreError::Internal("injected remove failure".into()));
        }
        self.inner.remove(tablet_uid, rowset_id)
    }

    fn load(
        &self,
        tablet_uid: TabletUid,
        rowset_id: RowsetId,
    ) -> Result<Option<StoredRowsetMeta>, MetaStoreError> {
        self.inner.load(tablet_uid, rowset_id)
    }

    fn list(&self) -> Result<Vec<StoredRowsetMeta>, MetaStoreError> {
        self.inner.list()
    }
}
