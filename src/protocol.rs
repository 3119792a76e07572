//! Messages exchanged with the sync controller's event loop.
//!
//! Inbound requests and internal timer/fetch completions share one queue so
//! that all controller state is mutated from a single place.

use tokio::sync::oneshot;

use crate::errors::{FetchError, SyncError};
use crate::snapshot::{ArtworkHandle, UpdateRequest};

/// Acknowledgment returned to callers as soon as a request is ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateAck {
    /// Accepted and waiting for the debounce window to close.
    Queued,
    /// Written immediately.
    Applied,
    /// Placeholder text during playback; accepted without effect.
    PlaceholderSuppressed,
    /// Identical to what is already displayed; accepted without effect.
    Unchanged,
    /// Refresh requested before anything was ever applied.
    NothingToRefresh,
}

pub type ReplySender<T> = oneshot::Sender<Result<T, SyncError>>;

/// Event-loop input.
#[derive(Debug)]
pub enum SyncMessage {
    RequestUpdate {
        request: UpdateRequest,
        reply: ReplySender<UpdateAck>,
    },
    RequestRefresh {
        reply: ReplySender<UpdateAck>,
    },
    Clear {
        reply: ReplySender<()>,
    },
    Shutdown,
    DebounceElapsed {
        generation: u64,
    },
    ArtworkFetched {
        fetch_id: u64,
        url: String,
        result: Result<ArtworkHandle, FetchError>,
    },
    LockReleased {
        generation: u64,
    },
    VerifyDue {
        write_id: u64,
        attempt: u32,
    },
}

/// Notifications published by the controller for observers.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Applied {
        title: String,
        artist: String,
        is_playing: bool,
        with_artwork: bool,
    },
    ArtworkApplied {
        url: String,
    },
    ArtworkFailed {
        url: String,
        reason: String,
    },
    WriteRejected {
        title: String,
        reason: String,
    },
    OverrideDetected {
        expected_title: String,
        found_title: String,
    },
    VerificationAbandoned {
        title: String,
        attempts: u32,
    },
    Cleared,
}

/// Transport actions requested from the OS media controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportCommand {
    Play,
    Pause,
    Stop,
}
