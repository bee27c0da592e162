//! Worker pools, compaction admission and the production loop.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::compaction::{Ranker, SchedulerError, SubmittedTasks};
use crate::config::{SharedConfig, StoreConfig};
use crate::model::CompactionClass;
use crate::permits::PermitLimiter;
use crate::tablet::{DataDir, DataDirId, Tablet, TabletManager};
use crate::worker::{self, Job, StopLatch, Wake, WakeSignal, WorkerError, WorkerPool};

/// Longest sleep after a round that found nothing to do. A freed slot
/// ends the sleep early.
const EMPTY_ROUND_WAIT: Duration = Duration::from_millis(2000);

/// Recheck period while `disable_auto_compaction` is set.
const DISABLED_RECHECK: Duration = Duration::from_secs(5);

/// Highest merge debt seen by the last scans, per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactionScores {
    pub cumulative: u32,
    pub base: u32,
}

// ------------------------------------------------------------------------------------------------
// Worker pools
// ------------------------------------------------------------------------------------------------

pub(super) struct Pools {
    pub(super) cumulative: WorkerPool,
    pub(super) base: WorkerPool,
    pub(super) segment: WorkerPool,
    pub(super) cold_tier: WorkerPool,
    pub(super) cooldown: WorkerPool,
    pub(super) checkpoint: WorkerPool,
}

impl Pools {
    fn new(config: &StoreConfig) -> Result<Self, WorkerError> {
        Ok(Self {
            cumulative: WorkerPool::new("cumu-compaction", config.max_cumu_compaction_threads)?,
            base: WorkerPool::new("base-compaction", config.max_base_compaction_threads)?,
            segment: WorkerPool::new("seg-compaction", config.seg_compaction_threads)?,
            cold_tier: WorkerPool::new(
                "cold-data-compaction",
                config.cold_data_compaction_threads,
            )?,
            cooldown: WorkerPool::new("cooldown", config.cooldown_threads)?,
            checkpoint: WorkerPool::new("meta-checkpoint", config.meta_checkpoint_threads)?,
        })
    }

    fn for_class(&self, class: CompactionClass) -> &WorkerPool {
        match class {
            CompactionClass::Cumulative => &self.cumulative,
            CompactionClass::Base => &self.base,
            CompactionClass::ColdTier => &self.cold_tier,
        }
    }

    /// Applies the configured sizes. Safe between rounds: shrinking lets
    /// queued jobs finish first.
    fn reconcile(&self, config: &StoreConfig) -> Result<(), WorkerError> {
        self.cumulative.resize(config.max_cumu_compaction_threads)?;
        self.base.resize(config.max_base_compaction_threads)?;
        self.segment.resize(config.seg_compaction_threads)?;
        self.cold_tier.resize(config.cold_data_compaction_threads)?;
        self.cooldown.resize(config.cooldown_threads)?;
        self.checkpoint.resize(config.meta_checkpoint_threads)?;
        Ok(())
    }

    fn shutdown(&self) {
        self.cumulative.shutdown();
        self.base.shutdown();
        self.segment.shutdown();
        self.cold_tier.shutdown();
        self.cooldown.shutdown();
        self.checkpoint.shutdown();
    }
}

// ------------------------------------------------------------------------------------------------
// Admitted task
// ------------------------------------------------------------------------------------------------

/// A compaction holding its dedupe entry and its permits.
///
/// Dropping it, whether after the merge ran, on an admission error, or
/// because the pool refused the job, returns the permits, clears the
/// tablet's merge bookkeeping and frees the slot.
struct AdmittedTask {
    tablet: Arc<dyn Tablet>,
    class: CompactionClass,
    dir: DataDirId,
    permits: u64,
    limiter: Arc<PermitLimiter>,
    submitted: Arc<SubmittedTasks>,
}

impl AdmittedTask {
    fn run(self) {
        let tablet_id = self.tablet.tablet_id();
        match self.tablet.execute_merge(self.class) {
            Ok(()) => debug!(tablet_id, class = %self.class, permits = self.permits, "compaction finished"),
            Err(e) => warn!(tablet_id, class = %self.class, error = %e, "compaction failed"),
        }
    }
}

impl Drop for AdmittedTask {
    fn drop(&mut self) {
        self.limiter.release(self.permits);
        self.tablet.reset_merge_state(self.class);
        self.submitted
            .pop(self.dir, self.class, self.tablet.tablet_id());
    }
}

// ------------------------------------------------------------------------------------------------
// Scheduler state
// ------------------------------------------------------------------------------------------------

pub(super) struct SchedulerInner {
    pub(super) config: SharedConfig,
    pub(super) manager: Arc<dyn TabletManager>,
    pub(super) dirs: Vec<Arc<dyn DataDir>>,
    pub(super) permits: Arc<PermitLimiter>,
    pub(super) submitted: Arc<SubmittedTasks>,
    pub(super) wake: Arc<WakeSignal>,
    pub(super) stop: StopLatch,
    pub(super) pools: Pools,
    max_cumulative_score: AtomicU32,
    max_base_score: AtomicU32,
}

impl SchedulerInner {
    pub(super) fn submit_compaction(
        &self,
        tablet: Arc<dyn Tablet>,
        class: CompactionClass,
        force: bool,
    ) -> Result<bool, SchedulerError> {
        let tablet_id = tablet.tablet_id();
        let dir = tablet.data_dir();
        if !self.submitted.push(dir, class, tablet_id)? {
            return Err(SchedulerError::AlreadySubmitted { tablet_id, class });
        }

        let mut task = AdmittedTask {
            tablet,
            class,
            dir,
            permits: 0,
            limiter: Arc::clone(&self.permits),
            submitted: Arc::clone(&self.submitted),
        };

        let cost = task
            .tablet
            .prepare_and_estimate_cost(class)
            .map_err(|source| SchedulerError::PrepareFailed {
                tablet_id,
                class,
                source,
            })?;
        if cost == 0 {
            debug!(tablet_id, %class, "nothing to merge");
            return Ok(false);
        }
        if !force {
            let timeout = self.config.snapshot().permit_wait_timeout;
            task.permits = self.permits.request(cost, timeout)?;
        }

        let permits = task.permits;
        self.pools
            .for_class(class)
            .submit(Box::new(move || task.run()))
            .map_err(|source| SchedulerError::SubmitFailed {
                tablet_id,
                class,
                source,
            })?;
        debug!(tablet_id, %class, cost, permits, force, "compaction submitted");
        Ok(true)
    }

    /// One production round for `class`. Returns the number of candidates.
    pub(super) fn run_round(
        &self,
        ranker: &mut Ranker,
        class: CompactionClass,
        config: &StoreConfig,
    ) -> usize {
        let submitted = self.submitted.snapshot();
        let pick = ranker.pick(class, &self.dirs, self.manager.as_ref(), &submitted, config);
        if let Some(score) = pick.max_score {
            self.record_score(class, score);
        }

        let picked = pick.candidates.len();
        for tablet in pick.candidates {
            let tablet_id = tablet.tablet_id();
            match self.submit_compaction(tablet, class, false) {
                Ok(_) => {}
                Err(SchedulerError::AlreadySubmitted { .. }) => {
                    debug!(tablet_id, %class, "already submitted by an earlier round");
                }
                Err(e) => warn!(tablet_id, %class, error = %e, "compaction admission failed"),
            }
        }
        picked
    }

    fn record_score(&self, class: CompactionClass, score: u32) {
        match class {
            CompactionClass::Cumulative => self.max_cumulative_score.store(score, Ordering::Release),
            CompactionClass::Base => self.max_base_score.store(score, Ordering::Release),
            CompactionClass::ColdTier => {}
        }
    }

    fn reconcile(&self, config: &StoreConfig) {
        self.permits
            .set_ceiling(config.total_permits_for_compaction_score);
        if let Err(e) = self.pools.reconcile(config) {
            warn!(error = %e, "worker pool resize failed");
        }
    }

    fn run_compaction_producer(self: Arc<Self>) {
        info!("compaction producer started");
        let mut ranker = Ranker::new();
        let mut round = 0u32;
        while !self.stop.is_stopped() {
            let config = self.config.snapshot();
            self.reconcile(&config);

            if config.disable_auto_compaction {
                if self.stop.wait_for(DISABLED_RECHECK) {
                    break;
                }
                continue;
            }

            let class = if round < config.cumulative_rounds_per_base_round {
                round += 1;
                CompactionClass::Cumulative
            } else {
                round = 0;
                CompactionClass::Base
            };

            if self.run_round(&mut ranker, class, &config) == 0
                && self.wake.wait(EMPTY_ROUND_WAIT, &self.stop) == Wake::Stopped
            {
                break;
            }
            if self.stop.wait_for(config.generate_compaction_tasks_interval) {
                break;
            }
        }
        info!("compaction producer stopped");
    }
}

// ------------------------------------------------------------------------------------------------
// Public handle
// ------------------------------------------------------------------------------------------------

/// Owns the compaction worker pools and the producer threads.
///
/// Built once per store. [`start`](Self::start) spawns the producers;
/// [`shutdown`](Self::shutdown) latches the shared stop signal, joins them
/// and drains every pool.
pub struct CompactionScheduler {
    inner: Arc<SchedulerInner>,
    producers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for CompactionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionScheduler")
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("scores", &self.scores())
            .finish_non_exhaustive()
    }
}

impl CompactionScheduler {
    pub fn new(
        config: SharedConfig,
        manager: Arc<dyn TabletManager>,
        dirs: Vec<Arc<dyn DataDir>>,
        permits: Arc<PermitLimiter>,
        stop: StopLatch,
    ) -> Result<Self, SchedulerError> {
        let snapshot = config.snapshot();
        let wake = Arc::new(WakeSignal::new());
        let inner = SchedulerInner {
            pools: Pools::new(&snapshot)?,
            config,
            manager,
            dirs,
            permits,
            submitted: Arc::new(SubmittedTasks::new(Arc::clone(&wake))),
            wake,
            stop,
            max_cumulative_score: AtomicU32::new(0),
            max_base_score: AtomicU32::new(0),
        };
        Ok(Self {
            inner: Arc::new(inner),
            producers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Spawns the compaction, cold-tier and cooldown producers. A second
    /// call does nothing.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut producers = self
            .producers
            .lock()
            .map_err(|_| SchedulerError::Internal("Mutex poisoned".into()))?;

        let inner = Arc::clone(&self.inner);
        producers.push(worker::spawn_named("compaction-producer", move || {
            inner.run_compaction_producer()
        })?);
        let inner = Arc::clone(&self.inner);
        producers.push(worker::spawn_named("cold-data-compaction-producer", move || {
            inner.run_cold_tier_producer()
        })?);
        let inner = Arc::clone(&self.inner);
        producers.push(worker::spawn_named("cooldown-producer", move || {
            inner.run_cooldown_producer()
        })?);
        Ok(())
    }

    /// Admits one compaction of `tablet`.
    ///
    /// Returns `Ok(false)` when the tablet had nothing to merge. `force`
    /// bypasses the permit limiter. Every failure leaves the tablet
    /// eligible for the next round.
    pub fn submit_compaction(
        &self,
        tablet: Arc<dyn Tablet>,
        class: CompactionClass,
        force: bool,
    ) -> Result<bool, SchedulerError> {
        self.inner.submit_compaction(tablet, class, force)
    }

    /// Runs a writer-side segment merge on the segment pool.
    pub fn submit_segment_merge(&self, job: Job) -> Result<(), SchedulerError> {
        Ok(self.inner.pools.segment.submit(job)?)
    }

    pub(crate) fn submit_checkpoint(&self, job: Job) -> Result<(), SchedulerError> {
        Ok(self.inner.pools.checkpoint.submit(job)?)
    }

    pub fn scores(&self) -> CompactionScores {
        CompactionScores {
            cumulative: self.inner.max_cumulative_score.load(Ordering::Acquire),
            base: self.inner.max_base_score.load(Ordering::Acquire),
        }
    }

    pub fn submitted(&self) -> &SubmittedTasks {
        &self.inner.submitted
    }

    pub fn permits(&self) -> &PermitLimiter {
        &self.inner.permits
    }

    /// Runs one production round for `class` on the calling thread.
    pub(crate) fn run_round(&self, ranker: &mut Ranker, class: CompactionClass) -> usize {
        let config = self.inner.config.snapshot();
        self.inner.run_round(ranker, class, &config)
    }

    pub(crate) fn run_cold_tier_round(&self) -> usize {
        let config = self.inner.config.snapshot();
        self.inner.run_cold_tier_round(&config)
    }

    pub(crate) fn run_cooldown_round(&self) -> usize {
        let config = self.inner.config.snapshot();
        self.inner.run_cooldown_round(&config)
    }

    /// Stops the producers and drains every pool. Calling it more than
    /// once is harmless.
    pub fn shutdown(&self) {
        self.inner.stop.stop();
        let producers = std::mem::take(
            &mut *self
                .producers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for producer in producers {
            if producer.join().is_err() {
                error!("compaction producer panicked");
            }
        }
        self.inner.pools.shutdown();
    }
}

impl Drop for CompactionScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
