//! Post-write read-back verification and external override detection.

use std::time::Duration;

use log::debug;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::JoinHandle;

use crate::protocol::SyncMessage;
use crate::snapshot::{NowPlayingPayload, NowPlayingSnapshot};
use crate::sync::timer::post_after;

#[derive(Debug, Clone, PartialEq)]
pub enum VerificationOutcome {
    Matched,
    Mismatch {
        found_title: Option<String>,
        found_artist: Option<String>,
        found_rate: Option<f32>,
    },
}

fn expected_rate(expected: &NowPlayingSnapshot) -> f32 {
    if expected.is_playing {
        1.0
    } else {
        0.0
    }
}

/// Compares what the surface reports with what was last written.
///
/// An empty surface counts as a mismatch.
pub fn verify_surface(
    current: Option<&NowPlayingPayload>,
    expected: &NowPlayingSnapshot,
) -> VerificationOutcome {
    match current {
        Some(payload)
            if payload.title == expected.title
                && payload.artist == expected.artist
                && payload.playback_rate() == expected_rate(expected) =>
        {
            VerificationOutcome::Matched
        }
        Some(payload) => VerificationOutcome::Mismatch {
            found_title: Some(payload.title.clone()),
            found_artist: Some(payload.artist.clone()),
            found_rate: Some(payload.playback_rate()),
        },
        None => VerificationOutcome::Mismatch {
            found_title: None,
            found_artist: None,
            found_rate: None,
        },
    }
}

/// Returns the foreign title when another writer replaced the displayed text.
///
/// An empty surface is not treated as an override.
pub fn detect_override(
    current: Option<&NowPlayingPayload>,
    expected: &NowPlayingSnapshot,
) -> Option<String> {
    let payload = current?;
    if payload.title != expected.title || payload.artist != expected.artist {
        Some(payload.title.clone())
    } else {
        None
    }
}

/// Schedules delayed read-backs for the most recent write.
///
/// Only the latest write is verified; scheduling a new check supersedes any
/// check still waiting.
pub struct RecoveryVerifier {
    delay: Duration,
    max_attempts: u32,
    bus: WeakUnboundedSender<SyncMessage>,
    timer: Option<JoinHandle<()>>,
    write_id: u64,
    awaiting: bool,
}

impl RecoveryVerifier {
    pub fn new(delay: Duration, max_attempts: u32, bus: WeakUnboundedSender<SyncMessage>) -> Self {
        Self {
            delay,
            max_attempts: max_attempts.max(1),
            bus,
            timer: None,
            write_id: 0,
            awaiting: false,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Records a write and schedules its verification as `attempt` (1-based).
    pub fn on_write(&mut self, attempt: u32) -> u64 {
        self.cancel_timer();
        self.write_id = self.write_id.wrapping_add(1);
        self.awaiting = attempt <= self.max_attempts;
        if self.awaiting {
            debug!(
                "RecoveryVerifier: read-back {}/{} due in {:?}",
                attempt, self.max_attempts, self.delay
            );
            self.timer = Some(post_after(
                &self.bus,
                self.delay,
                SyncMessage::VerifyDue {
                    write_id: self.write_id,
                    attempt,
                },
            ));
        }
        self.write_id
    }

    pub fn is_current(&self, write_id: u64) -> bool {
        write_id == self.write_id
    }

    /// Whether the latest write still has a read-back outstanding.
    pub fn is_awaiting(&self) -> bool {
        self.awaiting
    }

    /// Marks the outstanding read-back as handled.
    pub fn finish(&mut self) {
        self.awaiting = false;
        self.timer = None;
    }

    pub fn cancel(&mut self) {
        self.awaiting = false;
        self.cancel_timer();
        self.write_id = self.write_id.wrapping_add(1);
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for RecoveryVerifier {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::{detect_override, verify_surface, RecoveryVerifier, VerificationOutcome};
    use crate::protocol::SyncMessage;
    use crate::snapshot::{NowPlayingPayload, NowPlayingSnapshot, UpdateRequest};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn snapshot(title: &str, artist: &str, is_playing: bool) -> NowPlayingSnapshot {
        UpdateRequest::new(title, artist, is_playing)
            .into_pending("Station")
            .expect("request should be valid")
            .snapshot
    }

    fn payload(title: &str, artist: &str, is_playing: bool) -> NowPlayingPayload {
        NowPlayingPayload::from_snapshot(&snapshot(title, artist, is_playing), None)
    }

    #[test]
    fn test_verify_surface_checks_title_artist_and_rate() {
        let expected = snapshot("Show", "Host", true);
        assert_eq!(
            verify_surface(Some(&payload("Show", "Host", true)), &expected),
            VerificationOutcome::Matched
        );
        assert_eq!(
            verify_surface(Some(&payload("Show", "Host", false)), &expected),
            VerificationOutcome::Mismatch {
                found_title: Some("Show".to_string()),
                found_artist: Some("Host".to_string()),
                found_rate: Some(0.0),
            }
        );
        assert!(matches!(
            verify_surface(None, &expected),
            VerificationOutcome::Mismatch { found_title: None, .. }
        ));
    }

    #[test]
    fn test_detect_override_ignores_play_state_and_empty_surface() {
        let expected = snapshot("Show", "Host", true);
        assert_eq!(detect_override(None, &expected), None);
        assert_eq!(
            detect_override(Some(&payload("Show", "Host", false)), &expected),
            None
        );
        assert_eq!(
            detect_override(Some(&payload("Podcast", "Host", true)), &expected),
            Some("Podcast".to_string())
        );
        assert_eq!(
            detect_override(Some(&payload("Show", "Someone", true)), &expected),
            Some("Show".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_write_schedules_read_back_after_delay() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut verifier =
            RecoveryVerifier::new(Duration::from_millis(500), 3, sender.downgrade());
        let started = Instant::now();
        let write_id = verifier.on_write(1);

        match receiver.recv().await {
            Some(SyncMessage::VerifyDue { write_id: due, attempt }) => {
                assert_eq!(due, write_id);
                assert_eq!(attempt, 1);
            }
            other => panic!("expected VerifyDue, got {other:?}"),
        }
        assert_eq!(started.elapsed(), Duration::from_millis(500));
        assert!(verifier.is_current(write_id));
        assert!(verifier.is_awaiting());
        verifier.finish();
        assert!(!verifier.is_awaiting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_write_supersedes_pending_check() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut verifier =
            RecoveryVerifier::new(Duration::from_millis(500), 3, sender.downgrade());
        let first = verifier.on_write(1);
        let second = verifier.on_write(2);
        assert!(!verifier.is_current(first));

        match receiver.recv().await {
            Some(SyncMessage::VerifyDue { write_id, attempt }) => {
                assert_eq!(write_id, second);
                assert_eq!(attempt, 2);
            }
            other => panic!("expected VerifyDue, got {other:?}"),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_past_limit_is_not_scheduled() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut verifier =
            RecoveryVerifier::new(Duration::from_millis(500), 3, sender.downgrade());
        verifier.on_write(4);
        assert!(!verifier.is_awaiting());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_clears_outstanding_read_back() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut verifier =
            RecoveryVerifier::new(Duration::from_millis(500), 3, sender.downgrade());
        let write_id = verifier.on_write(1);
        verifier.cancel();
        assert!(!verifier.is_awaiting());
        assert!(!verifier.is_current(write_id));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(receiver.try_recv().is_err());
    }
}
