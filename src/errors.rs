//! Error types shared by the sync controller and the artwork fetcher.

use std::time::Duration;

/// Failures reported to callers of the sync controller.
///
/// Placeholder suppression and no-op suppression are not errors; they are
/// reported through [`crate::protocol::UpdateAck`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// The request is missing a required field or carries an unusable value.
    #[error("invalid update request: {0}")]
    InvalidRequest(String),
    /// A surface write was attempted while the artwork lock was held.
    #[error("surface write rejected while artwork lock is held")]
    OverrideRejected,
    /// The surface backend refused the write or clear.
    #[error("surface error: {0}")]
    Surface(String),
    /// The controller has been shut down.
    #[error("sync controller is disposed")]
    Disposed,
}

/// Artwork retrieval failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("invalid artwork url: {0}")]
    InvalidUrl(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected http status {0}")]
    Status(u16),
    #[error("response carried no body")]
    EmptyBody,
    #[error("artwork exceeds the {0} byte download limit")]
    TooLarge(u64),
    #[error("artwork bytes could not be decoded ({0} bytes)")]
    Undecodable(usize),
    #[error("artwork fetch timed out after {0:?}")]
    TimedOut(Duration),
    #[error("artwork fetch failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<FetchError> },
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Status(_) | Self::EmptyBody | Self::Undecodable(_) => true,
            Self::InvalidUrl(_)
            | Self::TooLarge(_)
            | Self::TimedOut(_)
            | Self::Exhausted { .. } => false,
        }
    }
}
