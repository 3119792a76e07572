//! Now-playing surface abstractions and concrete implementations.

pub mod media_controls;
pub mod memory;

use crate::snapshot::NowPlayingPayload;

/// A single shared now-playing slot with last-write-wins semantics.
///
/// Other actors may write to the same slot, so `read` reports whatever is
/// currently displayed, not what this process last wrote.
pub trait NowPlayingSurface: Send + Sync {
    /// Replaces the whole displayed payload.
    fn write(&self, payload: &NowPlayingPayload) -> Result<(), String>;
    fn read(&self) -> Option<NowPlayingPayload>;
    fn clear(&self) -> Result<(), String>;
}
