//! Merge-debt ranking: which tablets get a compaction this round.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::compaction::DirSlots;
use crate::config::StoreConfig;
use crate::model::CompactionClass;
use crate::tablet::{DataDir, DataDirId, Tablet, TabletManager};

/// Minimum spacing of score refreshes on directories with no free slot.
pub const SCORE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of the slot check for one directory and one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDecision {
    /// A new task of this class may start.
    Pick,
    /// Every slot is taken.
    Saturated,
    /// The last free slot is held back for cumulative work.
    ReservedForCumulative,
}

/// Decides whether `class` may take a slot on a directory with `slots`
/// slots and the given tasks already running.
pub fn slot_decision(class: CompactionClass, slots: usize, running: &DirSlots) -> SlotDecision {
    let occupied = running.occupied();
    if occupied >= slots {
        return SlotDecision::Saturated;
    }
    if occupied + 1 == slots && class == CompactionClass::Base && !running.cumulative.is_empty() {
        return SlotDecision::ReservedForCumulative;
    }
    SlotDecision::Pick
}

/// Candidates of one production round.
pub struct RoundPick {
    /// At most one tablet per directory.
    pub candidates: Vec<Arc<dyn Tablet>>,
    /// Highest debt seen on the scanned directories, `None` if no
    /// directory was scanned.
    pub max_score: Option<u32>,
}

/// Per-round candidate selection.
///
/// Remembers, per class, when scores of saturated directories were last
/// refreshed.
#[derive(Debug)]
pub struct Ranker {
    score_interval: Duration,
    last_cumulative_check: Option<Instant>,
    last_base_check: Option<Instant>,
}

impl Default for Ranker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ranker {
    pub fn new() -> Self {
        Self::with_score_interval(SCORE_CHECK_INTERVAL)
    }

    pub fn with_score_interval(score_interval: Duration) -> Self {
        Self {
            score_interval,
            last_cumulative_check: None,
            last_base_check: None,
        }
    }

    fn should_check_score(&mut self, class: CompactionClass) -> bool {
        let last = match class {
            CompactionClass::Base => &mut self.last_base_check,
            CompactionClass::Cumulative | CompactionClass::ColdTier => {
                &mut self.last_cumulative_check
            }
        };
        let now = Instant::now();
        if last.is_none_or(|at| now.duration_since(at) >= self.score_interval) {
            *last = Some(now);
            return true;
        }
        false
    }

    /// Picks at most one tablet per directory for `class`.
    ///
    /// Directories are visited in random order. A directory with no slot
    /// for `class` is still scanned when a score refresh is due, so the
    /// reported maximum stays current; its best tablet is not picked.
    /// Directories over their capacity limit are skipped entirely.
    pub fn pick(
        &mut self,
        class: CompactionClass,
        dirs: &[Arc<dyn DataDir>],
        manager: &dyn TabletManager,
        submitted: &HashMap<DataDirId, DirSlots>,
        config: &StoreConfig,
    ) -> RoundPick {
        let check_score = self.should_check_score(class);
        let mut order: Vec<&Arc<dyn DataDir>> = dirs.iter().collect();
        order.shuffle(&mut rand::rng());

        let idle = DirSlots::default();
        let mut candidates = Vec::new();
        let mut max_score = None;

        for dir in order {
            let running = submitted.get(&dir.id()).unwrap_or(&idle);
            let decision = slot_decision(class, config.slots_for(dir.is_ssd()), running);
            let need_pick = decision == SlotDecision::Pick;
            if !need_pick && !check_score {
                trace!(dir = %dir.id(), %class, ?decision, "no slot for compaction");
                continue;
            }
            if dir.reach_capacity_limit(0) {
                debug!(dir = %dir.id(), "data directory at capacity, skipped");
                continue;
            }

            let best = manager.find_best_candidate(class, dir.as_ref(), running.excluded(class));
            max_score = Some(max_score.map_or(best.max_score, |m: u32| m.max(best.max_score)));

            let Some(tablet) = best.tablet else {
                continue;
            };
            if !need_pick {
                continue;
            }
            if tablet.auto_compaction_disabled() {
                debug!(tablet_id = tablet.tablet_id(), %class, "auto compaction disabled, skipped");
                continue;
            }
            candidates.push(tablet);
        }

        RoundPick {
            candidates,
            max_score,
        }
    }
}
