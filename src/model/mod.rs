//! # Core identities and the rowset handle
//!
//! Plain value types shared by the ledger, the metadata store and the
//! compaction scheduler:
//!
//! - [`TransactionKey`]: `(partition_id, transaction_id)` of an open load.
//! - [`TabletIdentity`]: `(tablet_id, schema_hash, tablet_uid)`; a tablet
//!   re-created under the same id gets a fresh uid, so stale ledger entries
//!   never match the new incarnation.
//! - [`Rowset`]: shared handle to an immutable batch of rows produced by one
//!   load. Only its metadata lives here; the segment files belong to the
//!   external row-group format.
//! - [`DeleteBitmap`]: merge-on-write bookkeeping resolved at publish time.

mod encoding_impls;


use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub type PartitionId = i64;
pub type TransactionId = i64;
pub type TabletId = i64;
pub type SchemaHash = i32;

// ------------------------------------------------------------------------------------------------
// Identities
// ------------------------------------------------------------------------------------------------

/// Key of one open load transaction within a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionKey {
    pub partition_id: PartitionId,
    pub transaction_id: TransactionId,
}

impl TransactionKey {
    pub fn new(partition_id: PartitionId, transaction_id: TransactionId) -> Self {
        Self {
            partition_id,
            transaction_id,
        }
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition_id, self.transaction_id)
    }
}

/// 128-bit unique id of one tablet incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TabletUid(pub u128);

impl fmt::Display for TabletUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Caller-supplied 128-bit idempotency token of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LoadId(pub u128);

impl LoadId {
    pub fn from_parts(hi: u64, lo: u64) -> Self {
        Self(((hi as u128) << 64) | lo as u128)
    }
}

impl fmt::Display for LoadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:016x}", (self.0 >> 64) as u64, self.0 as u64)
    }
}

/// Identity of a tablet generation: id, schema hash and incarnation uid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabletIdentity {
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
    pub tablet_uid: TabletUid,
}

impl TabletIdentity {
    pub fn new(tablet_id: TabletId, schema_hash: SchemaHash, tablet_uid: TabletUid) -> Self {
        Self {
            tablet_id,
            schema_hash,
            tablet_uid,
        }
    }
}

impl fmt::Display for TabletIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.tablet_id, self.schema_hash, self.tablet_uid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowsetId(pub u64);

impl fmt::Display for RowsetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

pub type RowsetIdSet = HashSet<RowsetId>;

/// Inclusive version range `[first, second]` a rowset covers once published.
///
/// Rowsets produced by a load stay at [`Version::PENDING`] until publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    pub first: i64,
    pub second: i64,
}

impl Version {
    pub const PENDING: Version = Version {
        first: -1,
        second: -1,
    };

    pub fn new(first: i64, second: i64) -> Self {
        Self { first, second }
    }

    /// A rowset has reached a real version once `first > 0`.
    pub fn is_published(&self) -> bool {
        self.first > 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{}]", self.first, self.second)
    }
}

/// Compaction classes competing for per-disk slots and worker pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompactionClass {
    /// Frequent merge of recent small rowsets.
    Cumulative,
    /// Periodic fold of cumulative output into the oldest large rowset.
    Base,
    /// Merge of rowsets already moved to remote storage.
    ColdTier,
}

impl fmt::Display for CompactionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cumulative => f.write_str("cumulative"),
            Self::Base => f.write_str("base"),
            Self::ColdTier => f.write_str("cold_tier"),
        }
    }
}

/// Seconds since the Unix epoch, saturating to zero on clock skew.
pub(crate) fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ------------------------------------------------------------------------------------------------
// Rowset
// ------------------------------------------------------------------------------------------------

/// Durable description of a rowset, persisted through the metadata store.
#[derive(Debug, Clone, PartialEq)]
pub struct RowsetMeta {
    pub rowset_id: RowsetId,
    pub tablet_id: TabletId,
    pub tablet_uid: TabletUid,
    pub partition_id: PartitionId,
    pub txn_id: TransactionId,
    pub load_id: LoadId,
    pub version: Version,
    pub num_segments: u64,
    pub num_rows: u64,
    pub data_disk_size: u64,
    /// Unix seconds.
    pub creation_time: i64,
    /// Set when the load only carried a subset of columns.
    pub partial_update: bool,
}

impl RowsetMeta {
    /// Metadata for a freshly written, not yet published load rowset.
    pub fn pending(
        rowset_id: RowsetId,
        tablet: &TabletIdentity,
        key: TransactionKey,
        load_id: LoadId,
    ) -> Self {
        Self {
            rowset_id,
            tablet_id: tablet.tablet_id,
            tablet_uid: tablet.tablet_uid,
            partition_id: key.partition_id,
            txn_id: key.transaction_id,
            load_id,
            version: Version::PENDING,
            num_segments: 0,
            num_rows: 0,
            data_disk_size: 0,
            creation_time: unix_seconds(),
            partial_update: false,
        }
    }

    /// Adds the segments, rows and disk size of `other` to this record.
    pub fn merge_from(&mut self, other: &RowsetMeta) {
        self.num_segments += other.num_segments;
        self.num_rows += other.num_rows;
        self.data_disk_size += other.data_disk_size;
    }
}

/// Shared handle to a rowset produced by a load or a merge.
///
/// The id never changes; the version moves from pending to its published
/// range exactly once per successful publish, and partial-update publishes
/// may fold transient segments into the metadata.
#[derive(Debug)]
pub struct Rowset {
    id: RowsetId,
    meta: RwLock<RowsetMeta>,
}

impl Rowset {
    pub fn new(meta: RowsetMeta) -> Arc<Self> {
        Arc::new(Self {
            id: meta.rowset_id,
            meta: RwLock::new(meta),
        })
    }

    pub fn rowset_id(&self) -> RowsetId {
        self.id
    }

    pub fn version(&self) -> Version {
        self.meta().version
    }

    pub fn is_partial_update(&self) -> bool {
        self.meta().partial_update
    }

    pub fn num_segments(&self) -> u64 {
        self.meta().num_segments
    }

    /// Snapshot of the current metadata.
    pub fn meta(&self) -> RowsetMeta {
        self.meta
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Publishes the rowset at `version`, making it readable.
    pub fn make_visible(&self, version: Version) {
        let mut meta = self
            .meta
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        meta.version = version;
    }

    /// Folds the segments of a transient rowset (built while resolving a
    /// partial update) into this rowset's metadata.
    pub fn merge_rowset_meta(&self, other: &RowsetMeta) {
        let mut meta = self
            .meta
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        meta.merge_from(other);
    }
}

// ------------------------------------------------------------------------------------------------
// Delete bitmap
// ------------------------------------------------------------------------------------------------

/// Location of a deleted row: `(rowset, segment, version)`.
pub type BitmapKey = (RowsetId, u32, i64);

/// Rows superseded by newer loads on a merge-on-write tablet.
#[derive(Debug, Default)]
pub struct DeleteBitmap {
    tablet_id: TabletId,
    rows: RwLock<BTreeMap<BitmapKey, BTreeSet<u32>>>,
}

impl DeleteBitmap {
    pub fn new(tablet_id: TabletId) -> Arc<Self> {
        Arc::new(Self {
            tablet_id,
            rows: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    pub fn mark(&self, key: BitmapKey, row_id: u32) {
        self.rows
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(key)
            .or_default()
            .insert(row_id);
    }

    pub fn contains(&self, key: &BitmapKey, row_id: u32) -> bool {
        self.rows
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .is_some_and(|rows| rows.contains(&row_id))
    }

    /// Total number of deleted rows across all keys.
    pub fn cardinality(&self) -> usize {
        self.rows
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(BTreeSet::len)
            .sum()
    }
}
