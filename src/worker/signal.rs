//! Stop latch and sticky wake signal for producer loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use crossbeam::select;

/// One-shot shutdown latch shared by every background loop.
///
/// Stopping drops the only sender, which disconnects every receiver at
/// once; a wait in progress returns immediately.
#[derive(Debug, Clone)]
pub struct StopLatch {
    sender: Arc<Mutex<Option<Sender<()>>>>,
    receiver: Receiver<()>,
    stopped: Arc<AtomicBool>,
}

impl Default for StopLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl StopLatch {
    pub fn new() -> Self {
        let (sender, receiver) = channel::bounded(0);
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Sleeps up to `timeout`. Returns `true` if the latch was released.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        matches!(
            self.receiver.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}

/// Why [`WakeSignal::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Notified,
    TimedOut,
    Stopped,
}

/// Single-slot wake-up channel.
///
/// `notify` never blocks and never gets lost: with nobody waiting the
/// token stays in the slot and the next `wait` consumes it at once. Any
/// number of notifications before a wait collapse into one wake-up.
#[derive(Debug)]
pub struct WakeSignal {
    sender: Sender<()>,
    receiver: Receiver<()>,
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeSignal {
    pub fn new() -> Self {
        let (sender, receiver) = channel::bounded(1);
        Self { sender, receiver }
    }

    pub fn notify(&self) {
        // Full means a wake-up is already pending.
        let _ = self.sender.try_send(());
    }

    /// A token is waiting to be consumed.
    pub fn is_pending(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Waits for a notification, the stop latch, or `timeout`.
    pub fn wait(&self, timeout: Duration, stop: &StopLatch) -> Wake {
        if stop.is_stopped() {
            return Wake::Stopped;
        }
        match self.receiver.try_recv() {
            Ok(()) => return Wake::Notified,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
        }
        select! {
            recv(self.receiver) -> _ => Wake::Notified,
            recv(stop.receiver()) -> _ => Wake::Stopped,
            default(timeout) => Wake::TimedOut,
        }
    }
}
