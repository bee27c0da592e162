use std::sync::Arc;

use crate::compaction::CompactionScheduler;
use crate::config::{SharedConfig, StoreConfig};
use crate::permits::PermitLimiter;
use crate::tablet::tests::helpers::{MockDataDir, MockManager, init_tracing};
use crate::tablet::{DataDir, TabletManager};
use crate::worker::StopLatch;

/// Small pools and one-slot-per-class disks unless overridden.
pub fn small_config() -> StoreConfig {
    init_tracing();
    StoreConfig {
        txn_map_shard_size: 8,
        txn_lock_shard_size: 8,
        max_cumu_compaction_threads: 2,
        max_base_compaction_threads: 2,
        seg_compaction_threads: 1,
        cold_data_compaction_threads: 2,
        cooldown_threads: 2,
        meta_checkpoint_threads: 1,
        compaction_task_num_per_disk: 2,
        compaction_task_num_per_fast_disk: 4,
        total_permits_for_compaction_score: 100,
        permit_wait_timeout: std::time::Duration::from_millis(50),
        ..StoreConfig::default()
    }
}

pub fn scheduler_with(
    config: StoreConfig,
    manager: &Arc<MockManager>,
    dirs: &[Arc<MockDataDir>],
) -> CompactionScheduler {
    let permits = Arc::new(PermitLimiter::new(config.total_permits_for_compaction_score));
    let config = SharedConfig::new(config).unwrap();
    CompactionScheduler::new(
        config,
        Arc::clone(manager) as Arc<dyn TabletManager>,
        dirs.iter().map(|d| Arc::clone(d) as Arc<dyn DataDir>).collect(),
        permits,
        StopLatch::new(),
    )
    .unwrap()
}
