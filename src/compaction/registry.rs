//! Bookkeeping of compaction work in flight.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::compaction::SchedulerError;
use crate::model::{CompactionClass, TabletId};
use crate::tablet::DataDirId;
use crate::worker::WakeSignal;

/// Tablets holding a slot on one data directory, by class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirSlots {
    pub cumulative: HashSet<TabletId>,
    pub base: HashSet<TabletId>,
}

impl DirSlots {
    /// Slots in use on the directory.
    pub fn occupied(&self) -> usize {
        self.cumulative.len() + self.base.len()
    }

    /// Tablets the manager must skip when picking for `class`.
    pub fn excluded(&self, class: CompactionClass) -> &HashSet<TabletId> {
        match class {
            CompactionClass::Base => &self.base,
            CompactionClass::Cumulative | CompactionClass::ColdTier => &self.cumulative,
        }
    }

    fn set_mut(&mut self, class: CompactionClass) -> &mut HashSet<TabletId> {
        match class {
            CompactionClass::Base => &mut self.base,
            CompactionClass::Cumulative | CompactionClass::ColdTier => &mut self.cumulative,
        }
    }
}

/// Dedupe sets for submitted compactions and running cooldowns.
///
/// Cumulative and base entries are kept per data directory, since they
/// also count against that directory's slots. Cold-tier compactions and
/// cooldown uploads have no slots and use flat sets. Each mutex is held
/// only for the insert or erase itself.
#[derive(Debug)]
pub struct SubmittedTasks {
    dirs: Mutex<HashMap<DataDirId, DirSlots>>,
    cold_tier: Mutex<HashSet<TabletId>>,
    cooldown: Mutex<HashSet<TabletId>>,
    wake: Arc<WakeSignal>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, SchedulerError> {
    mutex
        .lock()
        .map_err(|_| SchedulerError::Internal("Mutex poisoned".into()))
}

fn lock_read<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SubmittedTasks {
    /// `wake` is notified every time a cumulative or base slot frees up.
    pub fn new(wake: Arc<WakeSignal>) -> Self {
        Self {
            dirs: Mutex::new(HashMap::new()),
            cold_tier: Mutex::new(HashSet::new()),
            cooldown: Mutex::new(HashSet::new()),
            wake,
        }
    }

    /// Registers `tablet_id` for `class`. Returns `false` if it was already
    /// registered.
    pub fn push(
        &self,
        dir: DataDirId,
        class: CompactionClass,
        tablet_id: TabletId,
    ) -> Result<bool, SchedulerError> {
        let inserted = match class {
            CompactionClass::ColdTier => lock(&self.cold_tier)?.insert(tablet_id),
            _ => lock(&self.dirs)?
                .entry(dir)
                .or_default()
                .set_mut(class)
                .insert(tablet_id),
        };
        trace!(%dir, %class, tablet_id, inserted, "submitted-task push");
        Ok(inserted)
    }

    /// Releases the registration. Never fails: completion paths must not
    /// leak slots.
    pub fn pop(&self, dir: DataDirId, class: CompactionClass, tablet_id: TabletId) {
        let removed = match class {
            CompactionClass::ColdTier => lock_read(&self.cold_tier).remove(&tablet_id),
            _ => {
                let mut dirs = lock_read(&self.dirs);
                let removed = dirs
                    .get_mut(&dir)
                    .is_some_and(|slots| slots.set_mut(class).remove(&tablet_id));
                if dirs.get(&dir).is_some_and(|slots| slots.occupied() == 0) {
                    dirs.remove(&dir);
                }
                removed
            }
        };
        trace!(%dir, %class, tablet_id, removed, "submitted-task pop");
        if removed && class != CompactionClass::ColdTier {
            self.wake.notify();
        }
    }

    pub fn contains(&self, dir: DataDirId, class: CompactionClass, tablet_id: TabletId) -> bool {
        match class {
            CompactionClass::ColdTier => lock_read(&self.cold_tier).contains(&tablet_id),
            _ => lock_read(&self.dirs)
                .get(&dir)
                .is_some_and(|slots| slots.excluded(class).contains(&tablet_id)),
        }
    }

    /// Copy of the per-directory slot map, taken once per production round.
    pub fn snapshot(&self) -> HashMap<DataDirId, DirSlots> {
        lock_read(&self.dirs).clone()
    }

    /// Cold-tier compactions queued or running.
    pub fn cold_tier_len(&self) -> usize {
        lock_read(&self.cold_tier).len()
    }

    /// Marks a cooldown upload (or follow) as running. Returns `false` if
    /// one already is.
    pub fn start_cooldown(&self, tablet_id: TabletId) -> Result<bool, SchedulerError> {
        Ok(lock(&self.cooldown)?.insert(tablet_id))
    }

    pub fn finish_cooldown(&self, tablet_id: TabletId) {
        lock_read(&self.cooldown).remove(&tablet_id);
    }

    pub fn cooldown_running(&self, tablet_id: TabletId) -> bool {
        lock_read(&self.cooldown).contains(&tablet_id)
    }
}
