//! # Compaction Permit Limiter
//!
//! A single counting gate bounding the total estimated cost of compaction
//! work in flight across every disk and every class.
//!
//! ## Semantics
//!
//! - `request(n)` reserves `n` units. A request larger than the whole ceiling
//!   is clamped to the ceiling, so one huge tablet can still run alone
//!   instead of waiting forever. The amount actually reserved is returned and
//!   is what the caller must hand back to `release`.
//! - The outstanding total never exceeds the ceiling and never goes
//!   negative: `release` saturates at zero.
//! - Waiting is bounded. A blocked request gives up after its timeout with
//!   [`PermitError::Timeout`].
//! - The ceiling can be changed at runtime. Lowering it below the current
//!   usage only delays new grants; nothing already granted is revoked.
//!
//! The counter itself is a lock-free CAS loop. The mutex/condvar pair only
//! parks waiters and is never held while a grant is computed by a
//! non-waiting caller.


use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::trace;

/// Errors returned by [`PermitLimiter::request`].
#[derive(Debug, Error)]
pub enum PermitError {
    /// The permits did not become available within the wait bound.
    #[error("timed out waiting for {requested} permits ({outstanding}/{ceiling} in use)")]
    Timeout {
        requested: u64,
        outstanding: u64,
        ceiling: u64,
    },

    /// Poisoned wait lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Counting admission gate for compaction cost.
#[derive(Debug)]
pub struct PermitLimiter {
    ceiling: AtomicU64,
    outstanding: AtomicU64,
    waiters: Mutex<()>,
    released: Condvar,
}

impl PermitLimiter {
    pub fn new(ceiling: u64) -> Self {
        Self {
            ceiling: AtomicU64::new(ceiling.max(1)),
            outstanding: AtomicU64::new(0),
            waiters: Mutex::new(()),
            released: Condvar::new(),
        }
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling.load(Ordering::Acquire)
    }

    /// Installs a new ceiling and wakes waiters that may now fit.
    pub fn set_ceiling(&self, ceiling: u64) {
        let ceiling = ceiling.max(1);
        if self.ceiling.swap(ceiling, Ordering::AcqRel) != ceiling {
            self.notify_waiters();
        }
    }

    /// Point-in-time outstanding total.
    pub fn usage(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Reserves up to `n` permits without waiting.
    ///
    /// Returns the amount reserved, or `None` if it does not fit right now.
    pub fn try_request(&self, n: u64) -> Option<u64> {
        let ceiling = self.ceiling();
        let granted = n.min(ceiling);
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(granted)?;
                (next <= ceiling).then_some(next)
            })
            .ok()
            .map(|_| granted)
    }

    /// Reserves up to `n` permits, waiting at most `timeout` for capacity.
    pub fn request(&self, n: u64, timeout: Duration) -> Result<u64, PermitError> {
        if let Some(granted) = self.try_request(n) {
            trace!(requested = n, granted, usage = self.usage(), "permits granted");
            return Ok(granted);
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self
            .waiters
            .lock()
            .map_err(|_| PermitError::Internal("Mutex poisoned".into()))?;
        loop {
            // Checked under the wait lock: a release between this check and
            // the wait below cannot notify before we are parked.
            if let Some(granted) = self.try_request(n) {
                trace!(requested = n, granted, usage = self.usage(), "permits granted after wait");
                return Ok(granted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PermitError::Timeout {
                    requested: n,
                    outstanding: self.usage(),
                    ceiling: self.ceiling(),
                });
            }
            guard = self
                .released
                .wait_timeout(guard, deadline - now)
                .map_err(|_| PermitError::Internal("Condvar poisoned".into()))?
                .0;
        }
    }

    /// Returns `n` permits. Always succeeds; the counter saturates at zero.
    pub fn release(&self, n: u64) {
        if n == 0 {
            return;
        }
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(n))
            });
        trace!(released = n, usage = self.usage(), "permits released");
        self.notify_waiters();
    }

    fn notify_waiters(&self) {
        // Taking the lock orders this notify after any waiter's final check.
        let _guard = self
            .waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.released.notify_all();
    }
}
