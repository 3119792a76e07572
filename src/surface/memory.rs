//! In-process now-playing slot.

use std::sync::Mutex;

use crate::snapshot::NowPlayingPayload;
use crate::surface::NowPlayingSurface;

#[derive(Debug, Default)]
struct SlotState {
    payload: Option<NowPlayingPayload>,
    revision: u64,
}

/// Surface that keeps the payload in memory.
///
/// Used as the headless backend and as the shared slot in tests, where the
/// test itself plays the competing writer.
#[derive(Debug, Default)]
pub struct InMemorySurface {
    state: Mutex<SlotState>,
}

impl InMemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    /// Number of writes and clears applied so far, by any writer.
    pub fn revision(&self) -> u64 {
        self.with_state(|state| state.revision)
    }

    fn with_state<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&mut SlotState) -> T,
    {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => {
                let mut state = poisoned.into_inner();
                f(&mut state)
            }
        }
    }
}

impl NowPlayingSurface for InMemorySurface {
    fn write(&self, payload: &NowPlayingPayload) -> Result<(), String> {
        self.with_state(|state| {
            state.payload = Some(payload.clone());
            state.revision = state.revision.saturating_add(1);
        });
        Ok(())
    }

    fn read(&self) -> Option<NowPlayingPayload> {
        self.with_state(|state| state.payload.clone())
    }

    fn clear(&self) -> Result<(), String> {
        self.with_state(|state| {
            state.payload = None;
            state.revision = state.revision.saturating_add(1);
        });
        Ok(())
    }
}
