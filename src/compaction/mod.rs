//! # Compaction Scheduling
//!
//! Selects and admits background merge work across every tablet on every
//! local data directory. The merge itself is the tablet's business
//! ([`Tablet::execute_merge`](crate::tablet::Tablet::execute_merge)); this
//! module decides *which* tablet merges *when*, and bounds how much merge
//! work runs at once.
//!
//! ## Admission layers
//!
//! 1. **Per-directory slots**: each data directory runs at most
//!    `compaction_task_num_per_disk` (or `..._per_fast_disk` on SSD)
//!    cumulative + base tasks. When one slot is left, base work may only
//!    take it if no cumulative task is running there.
//! 2. **Dedupe**: a tablet holds at most one queued or running task per
//!    class ([`SubmittedTasks`]).
//! 3. **Permits**: the estimated cost of all tasks in flight stays under
//!    the global [`PermitLimiter`](crate::permits::PermitLimiter) ceiling.
//!
//! ## Code organization
//!
//! - `registry`: submitted-task sets and the running-cooldown set.
//! - `ranking`: slot decisions and the per-round candidate pick.
//! - `scheduler`: worker pools, admission and the production loop.
//! - `cold`: cold-tier compaction and cooldown upload producers.

mod cold;
mod ranking;
mod registry;
mod scheduler;

#[cfg(test)]
pub(crate) mod tests;

pub use ranking::{Ranker, RoundPick, SlotDecision, slot_decision};
pub use registry::{DirSlots, SubmittedTasks};
pub use scheduler::{CompactionScheduler, CompactionScores};

use std::io;

use thiserror::Error;

use crate::model::{CompactionClass, TabletId};
use crate::permits::PermitError;
use crate::tablet::TabletError;
use crate::worker::WorkerError;

/// Errors returned by compaction admission.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The tablet already holds a queued or running task of this class.
    #[error("tablet {tablet_id} already has a {class} compaction in flight")]
    AlreadySubmitted {
        tablet_id: TabletId,
        class: CompactionClass,
    },

    /// The tablet could not pick its input rowsets.
    #[error("tablet {tablet_id} failed to prepare {class} compaction: {source}")]
    PrepareFailed {
        tablet_id: TabletId,
        class: CompactionClass,
        #[source]
        source: TabletError,
    },

    /// The worker pool refused the task.
    #[error("failed to submit {class} compaction of tablet {tablet_id}: {source}")]
    SubmitFailed {
        tablet_id: TabletId,
        class: CompactionClass,
        #[source]
        source: WorkerError,
    },

    /// Permits did not become available in time.
    #[error("Permit error: {0}")]
    Permit(#[from] PermitError),

    /// Worker pool construction or resize failure.
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Producer thread spawn failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}
