//! Last-applied now-playing state and the single cached artwork entry.

use crate::snapshot::{ArtworkHandle, NowPlayingSnapshot};

/// What the surface was last successfully given.
#[derive(Debug, Default)]
pub struct MetadataCache {
    last_applied: Option<NowPlayingSnapshot>,
    artwork: Option<ArtworkHandle>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_applied(&self) -> Option<&NowPlayingSnapshot> {
        self.last_applied.as_ref()
    }

    /// Call only after the snapshot was actually written.
    pub fn record_applied(&mut self, snapshot: NowPlayingSnapshot) {
        self.last_applied = Some(snapshot);
    }

    /// True when title, artist and play state match the last applied snapshot.
    pub fn is_unchanged(&self, snapshot: &NowPlayingSnapshot) -> bool {
        self.last_applied
            .as_ref()
            .is_some_and(|last| last.same_display_state(snapshot))
    }

    /// Cached artwork, if it was fetched for exactly `url`.
    pub fn artwork_for(&self, url: &str) -> Option<ArtworkHandle> {
        self.artwork
            .as_ref()
            .filter(|artwork| artwork.source_url() == url)
            .cloned()
    }

    #[cfg(test)]
    pub fn cached_artwork_url(&self) -> Option<&str> {
        self.artwork.as_ref().map(ArtworkHandle::source_url)
    }

    /// Replaces the cached entry; the previous image is dropped.
    pub fn store_artwork(&mut self, artwork: ArtworkHandle) {
        self.artwork = Some(artwork);
    }

    pub fn clear_artwork(&mut self) {
        self.artwork = None;
    }

    pub fn clear(&mut self) {
        self.last_applied = None;
        self.artwork = None;
    }
}
