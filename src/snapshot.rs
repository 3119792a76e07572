//! Now-playing value types: inbound requests, snapshots, and surface payloads.

use std::fmt;
use std::sync::Arc;

use image::{DynamicImage, GenericImageView};

use crate::errors::SyncError;

/// Decoded artwork together with the URL it was fetched from.
///
/// Clones share the decoded image.
#[derive(Clone)]
pub struct ArtworkHandle {
    source_url: String,
    image: Arc<DynamicImage>,
}

impl ArtworkHandle {
    pub fn new(source_url: impl Into<String>, image: DynamicImage) -> Self {
        Self {
            source_url: source_url.into(),
            image: Arc::new(image),
        }
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

impl PartialEq for ArtworkHandle {
    fn eq(&self, other: &Self) -> bool {
        self.source_url == other.source_url && Arc::ptr_eq(&self.image, &other.image)
    }
}

impl fmt::Debug for ArtworkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (width, height) = self.dimensions();
        f.debug_struct("ArtworkHandle")
            .field("source_url", &self.source_url)
            .field("size", &format_args!("{width}x{height}"))
            .finish()
    }
}

/// Immutable bundle of now-playing fields at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NowPlayingSnapshot {
    pub title: String,
    pub artist: String,
    pub album: String,
    /// Never `Some("")`; empty URLs are normalized to `None`.
    pub artwork_url: Option<String>,
    pub is_playing: bool,
    pub duration_ms: Option<u64>,
    pub position_ms: Option<u64>,
}

impl NowPlayingSnapshot {
    /// True when title, artist and play state all match.
    pub fn same_display_state(&self, other: &NowPlayingSnapshot) -> bool {
        self.title == other.title
            && self.artist == other.artist
            && self.is_playing == other.is_playing
    }

    pub fn artwork_url(&self) -> Option<&str> {
        self.artwork_url.as_deref()
    }
}

/// Raw update request as delivered by the host.
///
/// Every field is optional at this boundary so that missing values can be
/// reported as [`SyncError::InvalidRequest`] instead of failing to parse.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub is_playing: Option<bool>,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub position_ms: Option<u64>,
    #[serde(default)]
    pub force_update: bool,
}

impl UpdateRequest {
    #[cfg(test)]
    pub fn new(title: impl Into<String>, artist: impl Into<String>, is_playing: bool) -> Self {
        Self {
            title: Some(title.into()),
            artist: Some(artist.into()),
            is_playing: Some(is_playing),
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn with_artwork_url(mut self, url: impl Into<String>) -> Self {
        self.artwork_url = Some(url.into());
        self
    }

    #[cfg(test)]
    pub fn with_timing(mut self, duration_ms: Option<u64>, position_ms: Option<u64>) -> Self {
        self.duration_ms = duration_ms;
        self.position_ms = position_ms;
        self
    }

    /// Validates the request and builds the snapshot it describes.
    pub fn into_pending(self, default_album: &str) -> Result<PendingUpdate, SyncError> {
        let title = self
            .title
            .ok_or_else(|| SyncError::InvalidRequest("missing title".to_string()))?;
        let artist = self
            .artist
            .ok_or_else(|| SyncError::InvalidRequest("missing artist".to_string()))?;
        let is_playing = self
            .is_playing
            .ok_or_else(|| SyncError::InvalidRequest("missing isPlaying".to_string()))?;

        let artwork_url = self
            .artwork_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        let album = self
            .album
            .map(|album| album.trim().to_string())
            .filter(|album| !album.is_empty())
            .unwrap_or_else(|| default_album.to_string());

        Ok(PendingUpdate {
            snapshot: NowPlayingSnapshot {
                title,
                artist,
                album,
                artwork_url,
                is_playing,
                duration_ms: self.duration_ms,
                position_ms: self.position_ms,
            },
            force_update: self.force_update,
            verification_attempt: 1,
        })
    }
}

/// The single not-yet-applied update held by the debouncer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub snapshot: NowPlayingSnapshot,
    pub force_update: bool,
    /// Verification attempt number the resulting write starts from.
    /// Fresh requests start at 1; recovery reapplies continue their chain.
    pub verification_attempt: u32,
}

impl PendingUpdate {
    pub fn forced(snapshot: NowPlayingSnapshot, verification_attempt: u32) -> Self {
        Self {
            snapshot,
            force_update: true,
            verification_attempt,
        }
    }
}

/// Complete payload written to a now-playing surface in one replace.
#[derive(Debug, Clone, PartialEq)]
pub struct NowPlayingPayload {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub is_playing: bool,
    pub duration_ms: Option<u64>,
    pub position_ms: Option<u64>,
    pub is_live_stream: bool,
    pub artwork: Option<ArtworkHandle>,
}

impl NowPlayingPayload {
    pub fn from_snapshot(snapshot: &NowPlayingSnapshot, artwork: Option<ArtworkHandle>) -> Self {
        Self {
            title: snapshot.title.clone(),
            artist: snapshot.artist.clone(),
            album: snapshot.album.clone(),
            is_playing: snapshot.is_playing,
            duration_ms: snapshot.duration_ms,
            position_ms: snapshot.position_ms,
            is_live_stream: snapshot.duration_ms.is_none(),
            artwork,
        }
    }

    pub fn playback_rate(&self) -> f32 {
        if self.is_playing {
            1.0
        } else {
            0.0
        }
    }

    #[cfg(test)]
    pub fn artwork_source(&self) -> Option<&str> {
        self.artwork.as_ref().map(ArtworkHandle::source_url)
    }
}
