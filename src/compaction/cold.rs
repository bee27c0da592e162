//! Cold-tier compaction and cooldown upload producers.
//!
//! Tablets with a cooldown policy move rowsets to remote storage. Exactly
//! one replica of each tablet uploads and compacts the remote rowsets; the
//! other replicas follow its cooldown metadata. Both kinds of work run
//! outside the per-disk slot accounting.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::compaction::SchedulerError;
use crate::compaction::SubmittedTasks;
use crate::compaction::scheduler::SchedulerInner;
use crate::config::{StoreConfig, interval_or_fallback};
use crate::model::CompactionClass;
use crate::tablet::Tablet;
use crate::worker::WorkerPool;

/// Cold-tier debt below which a cooldown replica is left alone.
pub const COLD_TIER_MIN_SCORE: u32 = 4;

/// Tablets that failed to follow cooldown are skipped for this many
/// producer intervals, giving the uploading replica time to publish its
/// metadata.
const FAILED_FOLLOW_BACKOFF: u32 = 10;

const COLD_TIER_FALLBACK_SECS: u64 = 1800;
const COOLDOWN_FALLBACK_SECS: u64 = 20;

/// A running cooldown; dropping it clears the running-set entry.
struct CooldownRun {
    tablet: Arc<dyn Tablet>,
    submitted: Arc<SubmittedTasks>,
}

impl CooldownRun {
    fn run(self) {
        let tablet_id = self.tablet.tablet_id();
        match self.tablet.cooldown() {
            Ok(()) => debug!(tablet_id, "cooldown finished"),
            Err(e) => warn!(tablet_id, error = %e, "cooldown failed"),
        }
    }
}

impl Drop for CooldownRun {
    fn drop(&mut self) {
        self.submitted.finish_cooldown(self.tablet.tablet_id());
    }
}

/// Keeps the `n` highest-scored entries, highest first.
fn top_n(entries: &mut Vec<(u32, Arc<dyn Tablet>)>, n: usize) {
    entries.sort_by(|a, b| b.0.cmp(&a.0));
    entries.truncate(n);
}

impl SchedulerInner {
    /// Queues `tablet.cooldown()` on `pool` unless one is already running.
    fn submit_cooldown(
        &self,
        tablet: Arc<dyn Tablet>,
        pool: &WorkerPool,
    ) -> Result<bool, SchedulerError> {
        let tablet_id = tablet.tablet_id();
        if !self.submitted.start_cooldown(tablet_id)? {
            return Ok(false);
        }
        let run = CooldownRun {
            tablet,
            submitted: Arc::clone(&self.submitted),
        };
        pool.submit(Box::new(move || run.run()))
            .map_err(|source| SchedulerError::SubmitFailed {
                tablet_id,
                class: CompactionClass::ColdTier,
                source,
            })?;
        Ok(true)
    }

    /// Picks up to `cold_data_compaction_threads` minus the tasks already
    /// in flight: uploading replicas with enough cold debt are compacted,
    /// the others follow cooldown metadata. Returns the number of tasks
    /// queued.
    pub(super) fn run_cold_tier_round(&self, config: &StoreConfig) -> usize {
        let capacity = config
            .cold_data_compaction_threads
            .saturating_sub(self.submitted.cold_tier_len());
        if capacity == 0 {
            return 0;
        }

        let tablets = self.manager.tablets_matching(&|t| {
            t.has_cooldown_config() && t.is_running() && !t.auto_compaction_disabled()
        });

        let mut to_compact = Vec::new();
        let mut to_follow = Vec::new();
        for tablet in tablets {
            let tablet_id = tablet.tablet_id();
            let score = tablet.calc_cold_tier_debt_score();
            if tablet.is_cooldown_replica() {
                if score < COLD_TIER_MIN_SCORE
                    || self
                        .submitted
                        .contains(tablet.data_dir(), CompactionClass::ColdTier, tablet_id)
                {
                    continue;
                }
                to_compact.push((score, tablet));
            } else if !self.submitted.cooldown_running(tablet_id) {
                to_follow.push((score, tablet));
            }
        }
        top_n(&mut to_compact, capacity);
        top_n(&mut to_follow, capacity);

        let mut queued = 0;
        for (score, tablet) in to_compact {
            let tablet_id = tablet.tablet_id();
            match self.submit_compaction(tablet, CompactionClass::ColdTier, true) {
                Ok(true) => queued += 1,
                Ok(false) => {}
                Err(e) => warn!(tablet_id, score, error = %e, "cold-tier compaction not submitted"),
            }
        }
        for (_, tablet) in to_follow {
            let tablet_id = tablet.tablet_id();
            match self.submit_cooldown(tablet, &self.pools.cold_tier) {
                Ok(true) => queued += 1,
                Ok(false) => {}
                Err(e) => warn!(tablet_id, error = %e, "cooldown follow not submitted"),
            }
        }
        queued
    }

    /// Queues an upload for every cooldown candidate, in the manager's
    /// priority order. Returns the number of tasks queued.
    pub(super) fn run_cooldown_round(&self, config: &StoreConfig) -> usize {
        let interval = interval_or_fallback(
            "generate_cooldown_task_interval_secs",
            config.generate_cooldown_task_interval_secs,
            COOLDOWN_FALLBACK_SECS,
        );
        let backoff = interval * FAILED_FOLLOW_BACKOFF;
        let now = SystemTime::now();
        let submitted = &self.submitted;

        let candidates = self.manager.cooldown_candidates(&|t| {
            let recently_failed = t
                .last_failed_follow_cooldown()
                .is_some_and(|at| now.duration_since(at).map_or(true, |age| age < backoff));
            recently_failed || !t.is_running() || submitted.cooldown_running(t.tablet_id())
        });
        debug!(count = candidates.len(), "cooldown candidates");

        let mut queued = 0;
        for tablet in candidates {
            let tablet_id = tablet.tablet_id();
            match self.submit_cooldown(tablet, &self.pools.cooldown) {
                Ok(true) => queued += 1,
                Ok(false) => {}
                Err(e) => warn!(tablet_id, error = %e, "cooldown not submitted"),
            }
        }
        queued
    }

    pub(super) fn run_cold_tier_producer(self: Arc<Self>) {
        info!("cold-tier compaction producer started");
        loop {
            let config = self.config.snapshot();
            let interval: Duration = interval_or_fallback(
                "cold_data_compaction_interval_secs",
                config.cold_data_compaction_interval_secs,
                COLD_TIER_FALLBACK_SECS,
            );
            if !config.disable_auto_compaction {
                self.run_cold_tier_round(&config);
            }
            if self.stop.wait_for(interval) {
                break;
            }
        }
        info!("cold-tier compaction producer stopped");
    }

    pub(super) fn run_cooldown_producer(self: Arc<Self>) {
        info!("cooldown producer started");
        loop {
            let config = self.config.snapshot();
            self.run_cooldown_round(&config);
            let interval = interval_or_fallback(
                "generate_cooldown_task_interval_secs",
                config.generate_cooldown_task_interval_secs,
                COOLDOWN_FALLBACK_SECS,
            );
            if self.stop.wait_for(interval) {
                break;
            }
        }
        info!("cooldown producer stopped");
    }
}
