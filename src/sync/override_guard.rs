//! Short exclusive window that protects freshly written artwork.

use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::errors::SyncError;
use crate::protocol::SyncMessage;
use crate::snapshot::NowPlayingPayload;
use crate::surface::NowPlayingSurface;
use crate::sync::timer::post_after;

/// Observable lock state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OverrideLockState {
    pub locked: bool,
    pub locked_until: Option<Instant>,
}

/// Gate for every surface write made by the controller.
///
/// While the lock is held, [`OverrideGuard::try_write`] refuses to touch the
/// surface. The lock is released by a `LockReleased` message carrying the
/// matching generation, and is treated as released once its deadline has
/// passed even if that message has not been handled yet.
pub struct OverrideGuard {
    state: OverrideLockState,
    generation: u64,
    bus: WeakUnboundedSender<SyncMessage>,
    release_timer: Option<JoinHandle<()>>,
}

impl OverrideGuard {
    pub fn new(bus: WeakUnboundedSender<SyncMessage>) -> Self {
        Self {
            state: OverrideLockState::default(),
            generation: 0,
            bus,
            release_timer: None,
        }
    }

    pub fn state(&self) -> OverrideLockState {
        self.state
    }

    pub fn is_locked(&self) -> bool {
        match self.state.locked_until {
            Some(until) => self.state.locked && Instant::now() < until,
            None => self.state.locked,
        }
    }

    /// Writes `payload` unless the artwork lock is held.
    pub fn try_write(
        &self,
        surface: &dyn NowPlayingSurface,
        payload: &NowPlayingPayload,
    ) -> Result<(), SyncError> {
        if self.is_locked() {
            debug!("OverrideGuard: rejected write of '{}' while locked", payload.title);
            return Err(SyncError::OverrideRejected);
        }
        surface.write(payload).map_err(SyncError::Surface)
    }

    /// Takes the lock, runs `write`, and keeps the lock for `hold`.
    ///
    /// The lock is engaged before `write` runs and is released on schedule
    /// whether or not `write` succeeded.
    pub fn with_artwork_lock<F>(&mut self, hold: Duration, write: F) -> Result<(), SyncError>
    where
        F: FnOnce() -> Result<(), String>,
    {
        if self.is_locked() {
            return Err(SyncError::OverrideRejected);
        }
        self.cancel_timer();
        self.generation = self.generation.wrapping_add(1);
        self.state = OverrideLockState {
            locked: true,
            locked_until: Some(Instant::now() + hold),
        };

        self.release_timer = Some(post_after(
            &self.bus,
            hold,
            SyncMessage::LockReleased {
                generation: self.generation,
            },
        ));
        debug!("OverrideGuard: artwork lock held for {:?}", hold);

        write().map_err(|err| {
            warn!("OverrideGuard: locked write failed: {}", err);
            SyncError::Surface(err)
        })
    }

    /// Releases the lock armed under `generation`. Returns whether it did.
    pub fn release(&mut self, generation: u64) -> bool {
        if generation != self.generation || !self.state.locked {
            return false;
        }
        self.release_timer = None;
        self.unlock();
        debug!("OverrideGuard: artwork lock released");
        true
    }

    /// Drops the lock unconditionally.
    pub fn reset(&mut self) {
        self.cancel_timer();
        self.generation = self.generation.wrapping_add(1);
        self.unlock();
    }

    fn unlock(&mut self) {
        self.state = OverrideLockState::default();
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.release_timer.take() {
            timer.abort();
        }
    }
}

impl Drop for OverrideGuard {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
