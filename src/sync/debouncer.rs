//! Coalesces bursts of update requests into one delayed application.

use std::time::Duration;

use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::JoinHandle;

use crate::protocol::SyncMessage;
use crate::snapshot::PendingUpdate;
use crate::sync::timer::post_after;

/// Holds at most one pending update and one armed timer.
///
/// Each timer carries the generation it was armed with; only the timer
/// matching the current generation may release the pending update.
pub struct Debouncer {
    window: Duration,
    bus: WeakUnboundedSender<SyncMessage>,
    pending: Option<PendingUpdate>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

impl Debouncer {
    pub fn new(window: Duration, bus: WeakUnboundedSender<SyncMessage>) -> Self {
        Self {
            window,
            bus,
            pending: None,
            timer: None,
            generation: 0,
        }
    }

    pub fn pending(&self) -> Option<&PendingUpdate> {
        self.pending.as_ref()
    }

    #[cfg(test)]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replaces the pending update and restarts the quiescence window.
    pub fn schedule(&mut self, update: PendingUpdate) {
        self.pending = Some(update);
        self.arm();
    }

    /// Schedules a forced reapply unless an update is already waiting.
    ///
    /// A waiting update carries newer intent, so it is kept and only marked
    /// forced; its timer is left alone. Returns whether a new window was armed.
    pub fn schedule_reapply(&mut self, update: PendingUpdate) -> bool {
        match self.pending.as_mut() {
            Some(pending) => {
                pending.force_update = true;
                pending.verification_attempt =
                    pending.verification_attempt.max(update.verification_attempt);
                false
            }
            None => {
                self.schedule(update);
                true
            }
        }
    }

    /// Takes the pending update if `generation` belongs to the live timer.
    pub fn take_elapsed(&mut self, generation: u64) -> Option<PendingUpdate> {
        if generation != self.generation {
            return None;
        }
        self.timer = None;
        self.pending.take()
    }

    /// Drops the pending update without applying it.
    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.pending = None;
        self.generation = self.generation.wrapping_add(1);
    }

    fn arm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation = self.generation.wrapping_add(1);
        self.timer = Some(post_after(
            &self.bus,
            self.window,
            SyncMessage::DebounceElapsed {
                generation: self.generation,
            },
        ));
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
