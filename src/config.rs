//! Runtime configuration.
//!
//! [`StoreConfig`] is a plain struct with documented defaults and a
//! `validate()` pass. [`SharedConfig`] makes it live: every background loop
//! takes a fresh [`snapshot`](SharedConfig::snapshot) on each wake, so an
//! operator can retune pool sizes, slots, intervals and flags without a
//! restart. Shard counts are the exception; they are fixed once the ledger
//! is built.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{info, warn};

use crate::StoreError;

/// Configuration for a [`Store`](crate::Store).
///
/// Intervals of the auxiliary sweepers are signed seconds: a value `<= 0`
/// is illegal but not fatal, the sweeper logs a warning and falls back to
/// its built-in interval.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Number of ledger shards. Power of two.
    ///
    /// Default: 1024.
    pub txn_map_shard_size: usize,

    /// Number of per-transaction mutexes. Power of two.
    ///
    /// Default: 1024.
    pub txn_lock_shard_size: usize,

    /// Distinct open transactions one ledger shard accepts before `prepare`
    /// fails with `TooManyTransactions`.
    ///
    /// Default: 2000.
    pub max_running_txns_per_shard: usize,

    /// Age after which an unpublished entry is reported as expired.
    ///
    /// Default: 30 minutes.
    pub pending_data_expire_time: Duration,

    /// Resolve merge-on-write delete bitmaps at publish time.
    ///
    /// Default: true.
    pub enable_merge_on_write: bool,

    /// Fold the transient rowset of a partial-update load into its target.
    ///
    /// Default: true.
    pub enable_partial_update: bool,

    /// Cumulative compaction workers. Default: 10. Must be >= 1.
    pub max_cumu_compaction_threads: usize,

    /// Base compaction workers. Default: 4. Must be >= 1.
    pub max_base_compaction_threads: usize,

    /// Writer-side segment merge workers. Default: 5. Must be >= 1.
    pub seg_compaction_threads: usize,

    /// Cold-tier compaction workers, also the cap on queued cold-tier tasks.
    /// Default: 2. Must be >= 1.
    pub cold_data_compaction_threads: usize,

    /// Cooldown upload workers. Default: 5. Must be >= 1.
    pub cooldown_threads: usize,

    /// Metadata checkpoint workers. Default: 2. Must be >= 1.
    pub meta_checkpoint_threads: usize,

    /// Concurrent compaction slots on a rotational disk. Default: 4.
    pub compaction_task_num_per_disk: usize,

    /// Concurrent compaction slots on an SSD. Default: 8.
    pub compaction_task_num_per_fast_disk: usize,

    /// Pause between two compaction production rounds.
    ///
    /// Default: 10 ms.
    pub generate_compaction_tasks_interval: Duration,

    /// Cumulative rounds run before one base round. Default: 9. Must be >= 1.
    pub cumulative_rounds_per_base_round: u32,

    /// Permit ceiling shared by every compaction in flight.
    ///
    /// Default: 1 000 000. Must be >= 1.
    pub total_permits_for_compaction_score: u64,

    /// Upper bound on how long a submission waits for permits.
    ///
    /// Default: 60 s.
    pub permit_wait_timeout: Duration,

    /// Stop producing background compaction work.
    ///
    /// Default: false.
    pub disable_auto_compaction: bool,

    /// Garbage sweep interval at full disks. Default: 180.
    pub min_garbage_sweep_interval_secs: i64,

    /// Garbage sweep interval at empty disks. Default: 3600.
    pub max_garbage_sweep_interval_secs: i64,

    /// Default: 1800.
    pub cold_data_compaction_interval_secs: i64,

    /// Default: 20.
    pub generate_cooldown_task_interval_secs: i64,

    /// File-descriptor and file cache pruning. Default: 1800.
    pub cache_clean_interval_secs: i64,

    /// Row-lookup cache pruning. Default: 30.
    pub lookup_cache_clean_interval_secs: i64,

    /// Run the per-directory path scan and path GC loops.
    ///
    /// Default: true.
    pub path_gc_check: bool,

    /// Default: 86400.
    pub path_gc_check_interval_secs: i64,

    /// Default: 86400.
    pub path_scan_interval_secs: i64,

    /// Default: 30.
    pub unused_rowset_monitor_interval_secs: i64,

    /// Default: 600.
    pub meta_checkpoint_interval_secs: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            txn_map_shard_size: 1024,
            txn_lock_shard_size: 1024,
            max_running_txns_per_shard: 2000,
            pending_data_expire_time: Duration::from_secs(1800),
            enable_merge_on_write: true,
            enable_partial_update: true,
            max_cumu_compaction_threads: 10,
            max_base_compaction_threads: 4,
            seg_compaction_threads: 5,
            cold_data_compaction_threads: 2,
            cooldown_threads: 5,
            meta_checkpoint_threads: 2,
            compaction_task_num_per_disk: 4,
            compaction_task_num_per_fast_disk: 8,
            generate_compaction_tasks_interval: Duration::from_millis(10),
            cumulative_rounds_per_base_round: 9,
            total_permits_for_compaction_score: 1_000_000,
            permit_wait_timeout: Duration::from_secs(60),
            disable_auto_compaction: false,
            min_garbage_sweep_interval_secs: 180,
            max_garbage_sweep_interval_secs: 3600,
            cold_data_compaction_interval_secs: 1800,
            generate_cooldown_task_interval_secs: 20,
            cache_clean_interval_secs: 1800,
            lookup_cache_clean_interval_secs: 30,
            path_gc_check: true,
            path_gc_check_interval_secs: 86400,
            path_scan_interval_secs: 86400,
            unused_rowset_monitor_interval_secs: 30,
            meta_checkpoint_interval_secs: 600,
        }
    }
}

impl StoreConfig {
    /// Validates all configuration parameters.
    pub(crate) fn validate(&self) -> Result<(), StoreError> {
        fn power_of_two(name: &str, value: usize) -> Result<(), StoreError> {
            if value == 0 || !value.is_power_of_two() {
                return Err(StoreError::InvalidConfig(format!(
                    "{name} must be a power of two, got {value}"
                )));
            }
            Ok(())
        }
        fn at_least_one(name: &str, value: usize) -> Result<(), StoreError> {
            if value < 1 {
                return Err(StoreError::InvalidConfig(format!("{name} must be >= 1")));
            }
            Ok(())
        }

        power_of_two("txn_map_shard_size", self.txn_map_shard_size)?;
        power_of_two("txn_lock_shard_size", self.txn_lock_shard_size)?;
        at_least_one("max_running_txns_per_shard", self.max_running_txns_per_shard)?;
        at_least_one("max_cumu_compaction_threads", self.max_cumu_compaction_threads)?;
        at_least_one("max_base_compaction_threads", self.max_base_compaction_threads)?;
        at_least_one("seg_compaction_threads", self.seg_compaction_threads)?;
        at_least_one("cold_data_compaction_threads", self.cold_data_compaction_threads)?;
        at_least_one("cooldown_threads", self.cooldown_threads)?;
        at_least_one("meta_checkpoint_threads", self.meta_checkpoint_threads)?;
        at_least_one("compaction_task_num_per_disk", self.compaction_task_num_per_disk)?;
        at_least_one(
            "compaction_task_num_per_fast_disk",
            self.compaction_task_num_per_fast_disk,
        )?;
        if self.cumulative_rounds_per_base_round < 1 {
            return Err(StoreError::InvalidConfig(
                "cumulative_rounds_per_base_round must be >= 1".into(),
            ));
        }
        if self.total_permits_for_compaction_score < 1 {
            return Err(StoreError::InvalidConfig(
                "total_permits_for_compaction_score must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Slot count for one data directory.
    pub fn slots_for(&self, is_ssd: bool) -> usize {
        if is_ssd {
            self.compaction_task_num_per_fast_disk
        } else {
            self.compaction_task_num_per_disk
        }
    }
}

/// Converts a sweeper interval in seconds, replacing an illegal value
/// (`<= 0`) with `fallback_secs`.
pub(crate) fn interval_or_fallback(name: &str, secs: i64, fallback_secs: u64) -> Duration {
    if secs <= 0 {
        warn!(name, secs, fallback_secs, "illegal interval, using fallback");
        return Duration::from_secs(fallback_secs);
    }
    Duration::from_secs(secs as u64)
}

/// Live, validated configuration shared by every component of a store.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<StoreConfig>>,
}

impl SharedConfig {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(config)),
        })
    }

    /// Copy of the current configuration.
    pub fn snapshot(&self) -> StoreConfig {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Applies `f` to a copy, validates it, and installs it.
    ///
    /// Shard counts cannot change after construction.
    pub fn update(&self, f: impl FnOnce(&mut StoreConfig)) -> Result<(), StoreError> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| StoreError::Internal("RwLock poisoned".into()))?;
        let mut next = guard.clone();
        f(&mut next);
        next.validate()?;
        if next.txn_map_shard_size != guard.txn_map_shard_size
            || next.txn_lock_shard_size != guard.txn_lock_shard_size
        {
            return Err(StoreError::InvalidConfig(
                "ledger shard sizes cannot change at runtime".into(),
            ));
        }
        *guard = next;
        info!("configuration updated");
        Ok(())
    }
}
