//! # Rowset Metadata Store
//!
//! Durable key-value persistence of [`RowsetMeta`] keyed by
//! `(tablet_uid, rowset_id)`. The ledger writes through this seam when a
//! load commits (pending rowset) and again when it publishes (visible
//! version), and removes the record when an unpublished load is dropped.
//!
//! Two implementations ship with the crate:
//!
//! - [`FileMetaStore`]: one file per rowset under
//!   `<root>/<tablet_uid>/<rowset_id>.meta`. Each record is written to a
//!   temporary file, fsynced, atomically renamed into place, and the parent
//!   directory is fsynced so the rename itself is durable.
//! - [`MemoryMetaStore`]: a process-local map for embedding and tests.
//!
//! ## Record layout
//!
//! ```text
//! [magic u32][format u8][binlog bool][RowsetMeta ...][crc32 u32]
//! ```
//!
//! The trailing CRC32 covers every preceding byte; a mismatch on read is
//! reported as [`MetaStoreError::ChecksumMismatch`].


use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::model::{RowsetId, RowsetMeta, TabletUid};

const RECORD_MAGIC: u32 = 0x5253_4D54; // "RSMT"
const RECORD_FORMAT: u8 = 1;
const RECORD_SUFFIX: &str = "meta";
const TMP_SUFFIX: &str = "tmp";

/// Errors returned by metadata store operations.
#[derive(Debug, Error)]
pub enum MetaStoreError {
    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record bytes could not be encoded or decoded.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A record's trailing checksum does not match its content.
    #[error("checksum mismatch in {0}")]
    ChecksumMismatch(PathBuf),

    /// A record is structurally invalid.
    #[error("corrupted record: {0}")]
    Corrupted(String),

    /// Poisoned lock or injected failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A persisted rowset record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRowsetMeta {
    pub meta: RowsetMeta,
    /// The rowset was appended to the tablet binlog before this save.
    pub binlog: bool,
}

/// Durable rowset metadata persistence.
///
/// `save` overwrites any previous record for the same key; `remove` of an
/// absent record succeeds.
pub trait MetaStore: Send + Sync {
    fn save(&self, tablet_uid: TabletUid, meta: &RowsetMeta, binlog: bool)
    -> Result<(), MetaStoreError>;

    fn remove(&self, tablet_uid: TabletUid, rowset_id: RowsetId) -> Result<(), MetaStoreError>;

    fn load(
        &self,
        tablet_uid: TabletUid,
        rowset_id: RowsetId,
    ) -> Result<Option<StoredRowsetMeta>, MetaStoreError>;

    /// Every persisted record, used to replay committed loads at startup.
    fn list(&self) -> Result<Vec<StoredRowsetMeta>, MetaStoreError>;
}

// ------------------------------------------------------------------------------------------------
// Record encoding
// ------------------------------------------------------------------------------------------------

fn encode_record(meta: &RowsetMeta, binlog: bool) -> Result<Vec<u8>, MetaStoreError> {
    let mut buf = Vec::with_capacity(128);
    RECORD_MAGIC.encode_to(&mut buf)?;
    RECORD_FORMAT.encode_to(&mut buf)?;
    binlog.encode_to(&mut buf)?;
    meta.encode_to(&mut buf)?;

    let mut hasher = Crc32::new();
    hasher.update(&buf);
    hasher.finalize().encode_to(&mut buf)?;
    Ok(buf)
}

fn decode_record(bytes: &[u8], path: &Path) -> Result<StoredRowsetMeta, MetaStoreError> {
    if bytes.len() < 4 {
        return Err(MetaStoreError::Corrupted(format!(
            "{} is {} bytes long",
            path.display(),
            bytes.len()
        )));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let (stored_crc, _) = u32::decode_from(trailer)?;
    let mut hasher = Crc32::new();
    hasher.update(body);
    if hasher.finalize() != stored_crc {
        return Err(MetaStoreError::ChecksumMismatch(path.to_path_buf()));
    }

    let mut offset = 0;
    let (magic, n) = u32::decode_from(body)?;
    offset += n;
    if magic != RECORD_MAGIC {
        return Err(MetaStoreError::Corrupted(format!(
            "bad magic {magic:#x} in {}",
            path.display()
        )));
    }
    let (format, n) = u8::decode_from(&body[offset..])?;
    offset += n;
    if format != RECORD_FORMAT {
        return Err(EncodingError::InvalidTag {
            tag: format as u32,
            type_name: "StoredRowsetMeta",
        }
        .into());
    }
    let (binlog, n) = bool::decode_from(&body[offset..])?;
    offset += n;
    let (meta, _) = encoding::decode_from_slice::<RowsetMeta>(&body[offset..])?;
    Ok(StoredRowsetMeta { meta, binlog })
}

// ------------------------------------------------------------------------------------------------
// FileMetaStore
// ------------------------------------------------------------------------------------------------

/// File-per-rowset metadata store rooted at one data directory.
#[derive(Debug)]
pub struct FileMetaStore {
    root: PathBuf,
}

impl FileMetaStore {
    /// Opens (or creates) a store rooted at `root`.
    ///
    /// Leftover temporary files from an interrupted save are removed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, MetaStoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        for tablet_dir in fs::read_dir(&root)? {
            let tablet_dir = tablet_dir?.path();
            if !tablet_dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&tablet_dir)? {
                let path = entry?.path();
                if path.extension().and_then(|s| s.to_str()) == Some(TMP_SUFFIX) {
                    warn!(path = %path.display(), "removing orphaned rowset meta temp file");
                    fs::remove_file(&path)?;
                }
            }
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tablet_dir(&self, tablet_uid: TabletUid) -> PathBuf {
        self.root.join(tablet_uid.to_string())
    }

    fn record_path(&self, tablet_uid: TabletUid, rowset_id: RowsetId) -> PathBuf {
        self.tablet_dir(tablet_uid)
            .join(format!("{rowset_id}.{RECORD_SUFFIX}"))
    }

    fn read_record(path: &Path) -> Result<StoredRowsetMeta, MetaStoreError> {
        let mut buf = Vec::new();
        File::open(path)?.read_to_end(&mut buf)?;
        decode_record(&buf, path)
    }

    fn fsync_dir(dir: &Path) -> Result<(), MetaStoreError> {
        File::open(dir)?.sync_all()?;
        Ok(())
    }
}

impl MetaStore for FileMetaStore {
    fn save(
        &self,
        tablet_uid: TabletUid,
        meta: &RowsetMeta,
        binlog: bool,
    ) -> Result<(), MetaStoreError> {
        let bytes = encode_record(meta, binlog)?;
        let dir = self.tablet_dir(tablet_uid);
        fs::create_dir_all(&dir)?;

        let final_path = self.record_path(tablet_uid, meta.rowset_id);
        let tmp_path = final_path.with_extension(TMP_SUFFIX);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;
        Self::fsync_dir(&dir)?;

        debug!(%tablet_uid, rowset_id = %meta.rowset_id, version = %meta.version, binlog, "rowset meta saved");
        Ok(())
    }

    fn remove(&self, tablet_uid: TabletUid, rowset_id: RowsetId) -> Result<(), MetaStoreError> {
        let path = self.record_path(tablet_uid, rowset_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                Self::fsync_dir(&self.tablet_dir(tablet_uid))?;
                debug!(%tablet_uid, %rowset_id, "rowset meta removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load(
        &self,
        tablet_uid: TabletUid,
        rowset_id: RowsetId,
    ) -> Result<Option<StoredRowsetMeta>, MetaStoreError> {
        let path = self.record_path(tablet_uid, rowset_id);
        match Self::read_record(&path) {
            Ok(record) => Ok(Some(record)),
            Err(MetaStoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn list(&self) -> Result<Vec<StoredRowsetMeta>, MetaStoreError> {
        let mut records = Vec::new();
        for tablet_dir in fs::read_dir(&self.root)? {
            let tablet_dir = tablet_dir?.path();
            if !tablet_dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&tablet_dir)? {
                let path = entry?.path();
                if path.extension().and_then(|s| s.to_str()) == Some(RECORD_SUFFIX) {
                    records.push(Self::read_record(&path)?);
                }
            }
        }
        records.sort_by_key(|r| (r.meta.tablet_id, r.meta.rowset_id));
        Ok(records)
    }
}

// ------------------------------------------------------------------------------------------------
// MemoryMetaStore
// ------------------------------------------------------------------------------------------------

/// In-memory metadata store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    records: Mutex<HashMap<(TabletUid, RowsetId), StoredRowsetMeta>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(TabletUid, RowsetId), StoredRowsetMeta>>, MetaStoreError>
    {
        self.records
            .lock()
            .map_err(|_| MetaStoreError::Internal("Mutex poisoned".into()))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetaStore for MemoryMetaStore {
    fn save(
        &self,
        tablet_uid: TabletUid,
        meta: &RowsetMeta,
        binlog: bool,
    ) -> Result<(), MetaStoreError> {
        self.lock()?.insert(
            (tablet_uid, meta.rowset_id),
            StoredRowsetMeta {
                meta: meta.clone(),
                binlog,
            },
        );
        Ok(())
    }

    fn remove(&self, tablet_uid: TabletUid, rowset_id: RowsetId) -> Result<(), MetaStoreError> {
        self.lock()?.remove(&(tablet_uid, rowset_id));
        Ok(())
    }

    fn load(
        &self,
        tablet_uid: TabletUid,
        rowset_id: RowsetId,
    ) -> Result<Option<StoredRowsetMeta>, MetaStoreError> {
        Ok(self.lock()?.get(&(tablet_uid, rowset_id)).cloned())
    }

    fn list(&self) -> Result<Vec<StoredRowsetMeta>, MetaStoreError> {
        let mut records: Vec<_> = self.lock()?.values().cloned().collect();
        records.sort_by_key(|r| (r.meta.tablet_id, r.meta.rowset_id));
        Ok(records)
    }
}
