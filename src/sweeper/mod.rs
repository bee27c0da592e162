//! # Auxiliary Sweepers
//!
//! Periodic housekeeping loops, one OS thread each:
//!
//! | Loop                   | Interval                              | Work                                   |
//! |------------------------|---------------------------------------|----------------------------------------|
//! | garbage sweeper        | adaptive, see [`garbage_sweep_interval`] | empty trash on every data directory |
//! | unused-rowset monitor  | `unused_rowset_monitor_interval_secs` | reclaim rowsets nobody references      |
//! | checkpoint producer    | `meta_checkpoint_interval_secs`       | one metadata checkpoint job per disk   |
//! | cache cleaner          | `cache_clean_interval_secs`           | prune file-descriptor and file caches  |
//! | lookup cache cleaner   | `lookup_cache_clean_interval_secs`    | prune the row-lookup cache             |
//! | path scan / path GC    | `path_scan_interval_secs`, `path_gc_check_interval_secs` | per disk, when `path_gc_check` |
//!
//! Every loop re-reads the configuration on each wake and exits as soon as
//! the shared stop latch is released. An interval `<= 0` is replaced by the
//! loop's fallback with a warning.


use std::f64::consts::PI;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::compaction::CompactionScheduler;
use crate::config::{SharedConfig, StoreConfig, interval_or_fallback};
use crate::ledger::UnusedRowsets;
use crate::tablet::{CacheKind, DataDir, TabletManager};
use crate::worker::{self, StopLatch};

const UNUSED_ROWSET_FALLBACK_SECS: u64 = 1;
const CHECKPOINT_FALLBACK_SECS: u64 = 600;
const CACHE_CLEAN_FALLBACK_SECS: u64 = 3600;
const LOOKUP_CACHE_CLEAN_FALLBACK_SECS: u64 = 30;
const PATH_SCAN_FALLBACK_SECS: u64 = 24 * 3600;
const PATH_GC_FALLBACK_SECS: u64 = 1800;

// ------------------------------------------------------------------------------------------------
// Garbage sweep interval
// ------------------------------------------------------------------------------------------------

/// Sweep interval for a disk usage ratio in `[0.0, 1.0]`.
///
/// A smooth decreasing curve: close to `max_secs` on empty disks, falling
/// steeply past 50% usage, and pinned to `min_secs` from roughly 85%.
pub fn garbage_sweep_interval(usage: f64, min_secs: u64, max_secs: u64) -> Duration {
    let ratio = (1.1 * (PI / 2.0 - (usage * 100.0 / 5.0 - 14.0).atan()) - 0.28) / PI;
    let ratio = ratio.max(0.0);
    let secs = (max_secs as f64 * ratio) as u64;
    Duration::from_secs(secs.clamp(min_secs, max_secs.max(min_secs)))
}

/// `(min, max)` garbage sweep bounds. Illegal bounds force `min` to one
/// second and lift `max` to at least `min`.
pub fn sweep_bounds(config: &StoreConfig) -> (u64, u64) {
    let min = config.min_garbage_sweep_interval_secs;
    let max = config.max_garbage_sweep_interval_secs;
    if max >= min && min > 0 {
        return (min as u64, max as u64);
    }
    warn!(min, max, "garbage sweep interval config is illegal");
    let max = if max >= 1 { max as u64 } else { 1 };
    (1, max)
}

// ------------------------------------------------------------------------------------------------
// Sweeper
// ------------------------------------------------------------------------------------------------

struct SweeperContext {
    config: SharedConfig,
    manager: Arc<dyn TabletManager>,
    dirs: Vec<Arc<dyn DataDir>>,
    unused: Arc<UnusedRowsets>,
    scheduler: Arc<CompactionScheduler>,
    stop: StopLatch,
}

impl SweeperContext {
    /// Empties trash everywhere; returns the highest usage reported.
    fn sweep_garbage(&self) -> f64 {
        let mut usage: f64 = 0.0;
        for dir in &self.dirs {
            match dir.sweep_trash() {
                Ok(u) => usage = usage.max(u),
                Err(e) => warn!(dir = %dir.id(), error = %e, "trash sweep failed"),
            }
        }
        usage
    }

    fn submit_checkpoints(&self) -> usize {
        let mut submitted = 0;
        for dir in &self.dirs {
            let manager = Arc::clone(&self.manager);
            let target = Arc::clone(dir);
            let job = Box::new(move || {
                if let Err(e) = manager.checkpoint_metadata(target.as_ref()) {
                    warn!(dir = %target.id(), error = %e, "metadata checkpoint failed");
                }
            });
            match self.scheduler.submit_checkpoint(job) {
                Ok(()) => submitted += 1,
                Err(e) => warn!(dir = %dir.id(), error = %e, "metadata checkpoint not submitted"),
            }
        }
        submitted
    }

    fn clean_caches(&self, kinds: &[CacheKind]) {
        for &kind in kinds {
            if let Err(e) = self.manager.clean_cache(kind) {
                warn!(?kind, error = %e, "cache prune failed");
            }
        }
    }

    fn run_garbage_sweeper(&self) {
        let mut usage = 1.0;
        loop {
            let (min, max) = sweep_bounds(&self.config.snapshot());
            let interval = garbage_sweep_interval(usage, min, max);
            if self.stop.wait_for(interval) {
                break;
            }
            usage = self.sweep_garbage();
            debug!(usage, "garbage sweep finished");
        }
    }
}

/// Handle to the auxiliary loops of one store.
pub struct Sweeper {
    ctx: Arc<SweeperContext>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Sweeper {
    pub fn new(
        config: SharedConfig,
        manager: Arc<dyn TabletManager>,
        dirs: Vec<Arc<dyn DataDir>>,
        unused: Arc<UnusedRowsets>,
        scheduler: Arc<CompactionScheduler>,
        stop: StopLatch,
    ) -> Self {
        Self {
            ctx: Arc::new(SweeperContext {
                config,
                manager,
                dirs,
                unused,
                scheduler,
                stop,
            }),
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns every loop. A second call does nothing.
    pub fn start(&self) -> io::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut threads = self
            .threads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let ctx = Arc::clone(&self.ctx);
        threads.push(worker::spawn_named("garbage-sweeper", move || {
            info!("garbage sweeper started");
            ctx.run_garbage_sweeper();
            info!("garbage sweeper stopped");
        })?);

        threads.push(self.spawn_loop(
            "unused-rowset-monitor",
            true,
            |c| {
                interval_or_fallback(
                    "unused_rowset_monitor_interval_secs",
                    c.unused_rowset_monitor_interval_secs,
                    UNUSED_ROWSET_FALLBACK_SECS,
                )
            },
            |ctx| {
                ctx.unused.reclaim(ctx.manager.as_ref());
            },
        )?);

        threads.push(self.spawn_loop(
            "meta-checkpoint-producer",
            true,
            |c| {
                interval_or_fallback(
                    "meta_checkpoint_interval_secs",
                    c.meta_checkpoint_interval_secs,
                    CHECKPOINT_FALLBACK_SECS,
                )
            },
            |ctx| {
                ctx.submit_checkpoints();
            },
        )?);

        threads.push(self.spawn_loop(
            "cache-cleaner",
            false,
            |c| {
                interval_or_fallback(
                    "cache_clean_interval_secs",
                    c.cache_clean_interval_secs,
                    CACHE_CLEAN_FALLBACK_SECS,
                )
            },
            |ctx| ctx.clean_caches(&[CacheKind::FileDescriptor, CacheKind::FileCache]),
        )?);

        threads.push(self.spawn_loop(
            "lookup-cache-cleaner",
            false,
            |c| {
                interval_or_fallback(
                    "lookup_cache_clean_interval_secs",
                    c.lookup_cache_clean_interval_secs,
                    LOOKUP_CACHE_CLEAN_FALLBACK_SECS,
                )
            },
            |ctx| ctx.clean_caches(&[CacheKind::RowLookup]),
        )?);

        if self.ctx.config.snapshot().path_gc_check {
            for dir in &self.ctx.dirs {
                let scanned = Arc::clone(dir);
                let collected = Arc::clone(dir);
                threads.push(self.spawn_loop(
                    &format!("path-scan-{}", dir.id().0),
                    true,
                    |c| {
                        interval_or_fallback(
                            "path_scan_interval_secs",
                            c.path_scan_interval_secs,
                            PATH_SCAN_FALLBACK_SECS,
                        )
                    },
                    move |_| {
                        if let Err(e) = scanned.perform_path_scan() {
                            warn!(dir = %scanned.id(), error = %e, "path scan failed");
                        }
                    },
                )?);
                threads.push(self.spawn_loop(
                    &format!("path-gc-{}", dir.id().0),
                    true,
                    |c| {
                        interval_or_fallback(
                            "path_gc_check_interval_secs",
                            c.path_gc_check_interval_secs,
                            PATH_GC_FALLBACK_SECS,
                        )
                    },
                    move |_| {
                        if let Err(e) = collected.perform_path_gc() {
                            warn!(dir = %collected.id(), error = %e, "path gc failed");
                        }
                    },
                )?);
            }
        }
        info!(threads = threads.len(), "sweepers started");
        Ok(())
    }

    /// Spawns a loop that runs `work` (immediately when `run_first`, else
    /// after the first interval) and then sleeps `interval(config)`.
    fn spawn_loop<I, W>(
        &self,
        name: &str,
        run_first: bool,
        interval: I,
        work: W,
    ) -> io::Result<JoinHandle<()>>
    where
        I: Fn(&StoreConfig) -> Duration + Send + 'static,
        W: Fn(&SweeperContext) + Send + 'static,
    {
        let ctx = Arc::clone(&self.ctx);
        let name = name.to_owned();
        worker::spawn_named(name.clone(), move || {
            debug!(sweeper = %name, "sweeper started");
            if !run_first && ctx.stop.wait_for(interval(&ctx.config.snapshot())) {
                return;
            }
            loop {
                work(&ctx);
                if ctx.stop.wait_for(interval(&ctx.config.snapshot())) {
                    break;
                }
            }
            debug!(sweeper = %name, "sweeper stopped");
        })
    }

    pub(crate) fn sweep_garbage(&self) -> f64 {
        self.ctx.sweep_garbage()
    }

    pub(crate) fn submit_checkpoints(&self) -> usize {
        self.ctx.submit_checkpoints()
    }

    /// Releases the stop latch and joins every loop. Calling it more than
    /// once is harmless.
    pub fn shutdown(&self) {
        self.ctx.stop.stop();
        let threads = std::mem::take(
            &mut *self
                .threads
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for thread in threads {
            if thread.join().is_err() {
                error!("sweeper thread panicked");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
