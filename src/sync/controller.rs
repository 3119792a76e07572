//! Now-playing sync controller.
//!
//! Owns every piece of sync state and mutates it from one event loop. Callers
//! talk to it through a [`SyncHandle`]; timers and artwork downloads report
//! back by posting [`SyncMessage`]s onto the same queue.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::artwork::fetcher::{ArtworkFetcher, ArtworkTransport};
use crate::config::Config;
use crate::errors::{FetchError, SyncError};
use crate::protocol::{SyncEvent, SyncMessage, UpdateAck};
use crate::snapshot::{
    ArtworkHandle, NowPlayingPayload, NowPlayingSnapshot, PendingUpdate, UpdateRequest,
};
use crate::surface::NowPlayingSurface;
use crate::sync::debouncer::Debouncer;
use crate::sync::metadata_cache::MetadataCache;
use crate::sync::override_guard::OverrideGuard;
use crate::sync::placeholder::PlaceholderFilter;
use crate::sync::recovery::{detect_override, verify_surface, RecoveryVerifier, VerificationOutcome};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Cloneable entry point to a running [`SyncController`].
///
/// Dropping every handle stops the controller.
#[derive(Clone)]
pub struct SyncHandle {
    bus: UnboundedSender<SyncMessage>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, SyncError>>) -> SyncMessage,
    ) -> Result<T, SyncError> {
        let (reply, response) = oneshot::channel();
        self.bus
            .send(build(reply))
            .map_err(|_| SyncError::Disposed)?;
        response.await.map_err(|_| SyncError::Disposed)?
    }

    /// Submits an update. Resolves as soon as the request is ingested; the
    /// surface write itself happens after the debounce window.
    pub async fn request_update(&self, request: UpdateRequest) -> Result<UpdateAck, SyncError> {
        self.call(|reply| SyncMessage::RequestUpdate { request, reply })
            .await
    }

    /// Immediately reapplies the last applied snapshot.
    pub async fn request_refresh(&self) -> Result<UpdateAck, SyncError> {
        self.call(|reply| SyncMessage::RequestRefresh { reply }).await
    }

    /// Drops all pending work and empties the surface.
    pub async fn clear(&self) -> Result<(), SyncError> {
        self.call(|reply| SyncMessage::Clear { reply }).await
    }

    pub fn shutdown(&self) {
        let _ = self.bus.send(SyncMessage::Shutdown);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }
}

struct InFlightFetch {
    id: u64,
    url: String,
    /// Verification attempt the artwork write continues from.
    attempt: u32,
    task: JoinHandle<()>,
}

/// Serializes all writes to one now-playing surface.
pub struct SyncController {
    bus_consumer: UnboundedReceiver<SyncMessage>,
    bus: WeakUnboundedSender<SyncMessage>,
    events: broadcast::Sender<SyncEvent>,
    surface: Arc<dyn NowPlayingSurface>,
    fetcher: ArtworkFetcher,
    placeholders: PlaceholderFilter,
    cache: MetadataCache,
    debouncer: Debouncer,
    guard: OverrideGuard,
    verifier: RecoveryVerifier,
    /// Update rejected by the artwork lock, written once the lock releases.
    deferred: Option<PendingUpdate>,
    /// Snapshot whose recovery ran out of attempts. The forensic poll leaves
    /// it alone until a new request, refresh or clear arrives.
    abandoned: Option<NowPlayingSnapshot>,
    fetch: Option<InFlightFetch>,
    next_fetch_id: u64,
    default_album: String,
    artwork_lock: Duration,
    forensic_interval: Option<Duration>,
    disposed: bool,
}

impl SyncController {
    pub fn new(
        config: &Config,
        surface: Arc<dyn NowPlayingSurface>,
        transport: Arc<dyn ArtworkTransport>,
    ) -> (Self, SyncHandle) {
        let (bus_producer, bus_consumer) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let bus = bus_producer.downgrade();
        let timing = &config.timing;

        let controller = Self {
            bus_consumer,
            bus: bus.clone(),
            events: events.clone(),
            surface,
            fetcher: ArtworkFetcher::new(transport, timing),
            placeholders: PlaceholderFilter::new(&config.station),
            cache: MetadataCache::new(),
            debouncer: Debouncer::new(timing.debounce(), bus.clone()),
            guard: OverrideGuard::new(bus.clone()),
            verifier: RecoveryVerifier::new(timing.verify_delay(), timing.verify_max_attempts, bus),
            deferred: None,
            abandoned: None,
            fetch: None,
            next_fetch_id: 0,
            default_album: config.station.default_album.clone(),
            artwork_lock: timing.artwork_lock(),
            forensic_interval: timing
                .forensic_enabled
                .then(|| timing.forensic_interval()),
            disposed: false,
        };
        let handle = SyncHandle {
            bus: bus_producer,
            events,
        };
        (controller, handle)
    }

    /// Builds a controller and runs it on the current runtime.
    pub fn spawn(
        config: &Config,
        surface: Arc<dyn NowPlayingSurface>,
        transport: Arc<dyn ArtworkTransport>,
    ) -> (SyncHandle, JoinHandle<()>) {
        let (controller, handle) = Self::new(config, surface, transport);
        (handle, tokio::spawn(controller.run()))
    }

    /// Runs until shutdown or until every [`SyncHandle`] is dropped.
    pub async fn run(mut self) {
        info!("SyncController: started");
        let mut forensic = self.forensic_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        loop {
            tokio::select! {
                message = self.bus_consumer.recv() => match message {
                    Some(SyncMessage::Shutdown) | None => {
                        self.dispose();
                        break;
                    }
                    Some(message) => self.handle_message(message),
                },
                _ = next_tick(&mut forensic) => self.check_for_override(),
            }
        }
        info!("SyncController: stopped");
    }

    fn handle_message(&mut self, message: SyncMessage) {
        match message {
            SyncMessage::RequestUpdate { request, reply } => {
                let _ = reply.send(self.ingest(request));
            }
            SyncMessage::RequestRefresh { reply } => {
                let _ = reply.send(self.refresh());
            }
            SyncMessage::Clear { reply } => {
                let _ = reply.send(self.clear());
            }
            SyncMessage::Shutdown => self.dispose(),
            _ if self.disposed => {}
            SyncMessage::DebounceElapsed { generation } => {
                if let Some(update) = self.debouncer.take_elapsed(generation) {
                    if let Err(err) = self.apply(update) {
                        debug!("SyncController: debounced update not written: {}", err);
                    }
                }
            }
            SyncMessage::ArtworkFetched {
                fetch_id,
                url,
                result,
            } => self.on_artwork_fetched(fetch_id, url, result),
            SyncMessage::LockReleased { generation } => self.on_lock_released(generation),
            SyncMessage::VerifyDue { write_id, attempt } => self.verify(write_id, attempt),
        }
    }

    fn ingest(&mut self, request: UpdateRequest) -> Result<UpdateAck, SyncError> {
        if self.disposed {
            return Err(SyncError::Disposed);
        }
        let update = request.into_pending(&self.default_album)?;
        let snapshot = &update.snapshot;

        if self.placeholders.should_suppress(snapshot) {
            debug!(
                "SyncController: suppressed placeholder '{}' / '{}'",
                snapshot.title, snapshot.artist
            );
            return Ok(UpdateAck::PlaceholderSuppressed);
        }

        // A waiting update may still change what is displayed, so an update
        // matching the cache can only be dropped when nothing else is queued.
        let idle = self.debouncer.pending().is_none() && self.deferred.is_none();
        if !update.force_update && idle && self.cache.is_unchanged(snapshot) {
            debug!("SyncController: '{}' already displayed", snapshot.title);
            return Ok(UpdateAck::Unchanged);
        }

        self.abandoned = None;
        self.debouncer.schedule(update);
        Ok(UpdateAck::Queued)
    }

    fn refresh(&mut self) -> Result<UpdateAck, SyncError> {
        if self.disposed {
            return Err(SyncError::Disposed);
        }
        let Some(last) = self.cache.last_applied().cloned() else {
            return Ok(UpdateAck::NothingToRefresh);
        };
        self.abandoned = None;
        self.apply(PendingUpdate::forced(last, 1))?;
        Ok(UpdateAck::Applied)
    }

    /// Writes the text payload now and, when the artwork is not cached,
    /// starts fetching it.
    fn apply(&mut self, update: PendingUpdate) -> Result<(), SyncError> {
        if !update.force_update && self.cache.is_unchanged(&update.snapshot) {
            debug!(
                "SyncController: '{}' unchanged at apply time",
                update.snapshot.title
            );
            return Ok(());
        }

        let cached_artwork = update
            .snapshot
            .artwork_url()
            .and_then(|url| self.cache.artwork_for(url));
        let payload = NowPlayingPayload::from_snapshot(&update.snapshot, cached_artwork.clone());

        match self.guard.try_write(self.surface.as_ref(), &payload) {
            Ok(()) => {}
            Err(SyncError::OverrideRejected) => {
                info!(
                    "SyncController: '{}' held back until the artwork lock releases ({:?})",
                    update.snapshot.title,
                    self.guard.state()
                );
                self.publish(SyncEvent::WriteRejected {
                    title: update.snapshot.title.clone(),
                    reason: SyncError::OverrideRejected.to_string(),
                });
                self.deferred = Some(update);
                return Err(SyncError::OverrideRejected);
            }
            Err(err) => {
                warn!(
                    "SyncController: failed to write '{}': {}",
                    update.snapshot.title, err
                );
                return Err(err);
            }
        }

        let snapshot = update.snapshot;
        debug!(
            "SyncController: wrote '{}' / '{}' (playing: {}, artwork: {})",
            snapshot.title,
            snapshot.artist,
            snapshot.is_playing,
            cached_artwork.is_some()
        );
        self.publish(SyncEvent::Applied {
            title: snapshot.title.clone(),
            artist: snapshot.artist.clone(),
            is_playing: snapshot.is_playing,
            with_artwork: cached_artwork.is_some(),
        });
        self.verifier.on_write(update.verification_attempt);

        let missing_artwork = match (snapshot.artwork_url(), cached_artwork) {
            (Some(url), None) => Some(url.to_string()),
            (Some(_), Some(_)) => None,
            (None, _) => {
                self.cache.clear_artwork();
                None
            }
        };
        self.cache.record_applied(snapshot);

        match missing_artwork {
            Some(url) => self.start_artwork_fetch(url, update.verification_attempt),
            None => self.abort_fetch(),
        }
        Ok(())
    }

    fn start_artwork_fetch(&mut self, url: String, attempt: u32) {
        if let Some(fetch) = self.fetch.as_mut() {
            if fetch.url == url {
                debug!("SyncController: artwork {} already downloading", url);
                fetch.attempt = attempt;
                return;
            }
        }
        self.abort_fetch();

        self.next_fetch_id = self.next_fetch_id.wrapping_add(1);
        let fetch_id = self.next_fetch_id;
        let fetcher = self.fetcher.clone();
        let bus = self.bus.clone();
        let task_url = url.clone();
        let task = tokio::spawn(async move {
            let result = fetcher.fetch_with_timeout(&task_url).await;
            if let Some(bus) = bus.upgrade() {
                let _ = bus.send(SyncMessage::ArtworkFetched {
                    fetch_id,
                    url: task_url,
                    result,
                });
            }
        });
        debug!("SyncController: fetching artwork {}", url);
        self.fetch = Some(InFlightFetch {
            id: fetch_id,
            url,
            attempt,
            task,
        });
    }

    fn abort_fetch(&mut self) {
        if let Some(fetch) = self.fetch.take() {
            debug!("SyncController: dropped artwork download {}", fetch.url);
            fetch.task.abort();
        }
    }

    fn on_artwork_fetched(
        &mut self,
        fetch_id: u64,
        url: String,
        result: Result<ArtworkHandle, FetchError>,
    ) {
        let attempt = match self.fetch.as_ref() {
            Some(fetch) if fetch.id == fetch_id => fetch.attempt,
            _ => {
                debug!("SyncController: ignoring stale artwork result for {}", url);
                return;
            }
        };
        self.fetch = None;

        let artwork = match result {
            Ok(artwork) => artwork,
            Err(err) => {
                warn!(
                    "SyncController: artwork {} unavailable, keeping text-only metadata: {}",
                    url, err
                );
                self.publish(SyncEvent::ArtworkFailed {
                    url,
                    reason: err.to_string(),
                });
                return;
            }
        };

        let Some(last) = self.cache.last_applied().cloned() else {
            return;
        };
        if last.artwork_url() != Some(url.as_str()) {
            debug!("SyncController: artwork {} superseded before it arrived", url);
            return;
        }

        let payload = NowPlayingPayload::from_snapshot(&last, Some(artwork.clone()));
        let surface = Arc::clone(&self.surface);
        match self
            .guard
            .with_artwork_lock(self.artwork_lock, || surface.write(&payload))
        {
            Ok(()) => {
                let (width, height) = artwork.dimensions();
                info!(
                    "SyncController: applied artwork {} ({}x{}) to '{}'",
                    url, width, height, last.title
                );
                self.cache.store_artwork(artwork);
                self.publish(SyncEvent::ArtworkApplied { url });
                self.verifier.on_write(attempt);
            }
            Err(SyncError::OverrideRejected) => {
                self.publish(SyncEvent::WriteRejected {
                    title: last.title.clone(),
                    reason: SyncError::OverrideRejected.to_string(),
                });
                self.deferred = Some(PendingUpdate::forced(last, attempt));
            }
            Err(err) => {
                warn!("SyncController: artwork write for {} failed: {}", url, err);
                self.publish(SyncEvent::ArtworkFailed {
                    url,
                    reason: err.to_string(),
                });
            }
        }
    }

    fn on_lock_released(&mut self, generation: u64) {
        if !self.guard.release(generation) {
            return;
        }
        if let Some(update) = self.deferred.take() {
            debug!(
                "SyncController: writing deferred update '{}'",
                update.snapshot.title
            );
            if let Err(err) = self.apply(update) {
                debug!("SyncController: deferred update not written: {}", err);
            }
        }
    }

    fn verify(&mut self, write_id: u64, attempt: u32) {
        if !self.verifier.is_current(write_id) {
            return;
        }
        self.verifier.finish();
        let Some(expected) = self.cache.last_applied().cloned() else {
            return;
        };
        let current = self.surface.read();
        match verify_surface(current.as_ref(), &expected) {
            VerificationOutcome::Matched => {
                debug!(
                    "SyncController: verified '{}' on attempt {}",
                    expected.title, attempt
                );
            }
            VerificationOutcome::Mismatch {
                found_title,
                found_artist,
                found_rate,
            } => {
                let max_attempts = self.verifier.max_attempts();
                if attempt < max_attempts {
                    warn!(
                        "SyncController: surface shows {:?} / {:?} (rate {:?}) instead of '{}', reapplying ({}/{})",
                        found_title, found_artist, found_rate, expected.title, attempt, max_attempts
                    );
                    self.schedule_reapply(PendingUpdate::forced(expected, attempt + 1));
                } else {
                    warn!(
                        "SyncController: giving up on '{}' after {} verification attempts",
                        expected.title, attempt
                    );
                    self.publish(SyncEvent::VerificationAbandoned {
                        title: expected.title.clone(),
                        attempts: attempt,
                    });
                    self.abandoned = Some(expected);
                }
            }
        }
    }

    fn check_for_override(&mut self) {
        // Skipped while a write or read-back is queued; the verifier owns
        // recovery for that write.
        if self.disposed
            || self.debouncer.pending().is_some()
            || self.deferred.is_some()
            || self.verifier.is_awaiting()
        {
            return;
        }
        let Some(expected) = self.cache.last_applied().cloned() else {
            return;
        };
        if self.abandoned.as_ref() == Some(&expected) {
            return;
        }
        let current = self.surface.read();
        if let Some(found_title) = detect_override(current.as_ref(), &expected) {
            warn!(
                "SyncController: surface overwritten with '{}', restoring '{}'",
                found_title, expected.title
            );
            self.publish(SyncEvent::OverrideDetected {
                expected_title: expected.title.clone(),
                found_title,
            });
            self.schedule_reapply(PendingUpdate::forced(expected, 1));
        }
    }

    /// Routes a recovery reapply through whichever queued update is newest.
    fn schedule_reapply(&mut self, update: PendingUpdate) {
        if let Some(deferred) = self.deferred.as_mut() {
            deferred.force_update = true;
            deferred.verification_attempt = deferred
                .verification_attempt
                .max(update.verification_attempt);
            return;
        }
        self.debouncer.schedule_reapply(update);
    }

    fn clear(&mut self) -> Result<(), SyncError> {
        if self.disposed {
            return Err(SyncError::Disposed);
        }
        self.cancel_all();
        self.cache.clear();
        self.surface.clear().map_err(SyncError::Surface)?;
        info!("SyncController: cleared now-playing surface");
        self.publish(SyncEvent::Cleared);
        Ok(())
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.cancel_all();
        debug!("SyncController: disposed");
    }

    fn cancel_all(&mut self) {
        self.debouncer.cancel();
        self.deferred = None;
        self.abandoned = None;
        self.abort_fetch();
        self.verifier.cancel();
        self.guard.reset();
    }

    fn publish(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::{SyncController, SyncHandle};
    use crate::artwork::test_support::{png_bytes, Behavior, ScriptedTransport};
    use crate::config::Config;
    use crate::errors::SyncError;
    use crate::protocol::{SyncEvent, UpdateAck};
    use crate::snapshot::{NowPlayingPayload, UpdateRequest};
    use crate::surface::memory::InMemorySurface;
    use crate::surface::NowPlayingSurface;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::task::JoinHandle;

    const ART_URL: &str = "http://x/1.png";

    struct Harness {
        handle: SyncHandle,
        surface: Arc<InMemorySurface>,
        transport: Arc<ScriptedTransport>,
        events: broadcast::Receiver<SyncEvent>,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn start(config: Config, transport: Arc<ScriptedTransport>) -> Self {
            let surface = Arc::new(InMemorySurface::new());
            let (handle, task) =
                SyncController::spawn(&config, surface.clone(), transport.clone());
            let events = handle.subscribe();
            Self {
                handle,
                surface,
                transport,
                events,
                task,
            }
        }

        fn with_artwork() -> Self {
            Self::start(
                Config::default(),
                ScriptedTransport::always(Behavior::Respond(Ok(png_bytes(4, 4)))),
            )
        }

        async fn update(&self, request: UpdateRequest) -> UpdateAck {
            self.handle
                .request_update(request)
                .await
                .expect("update should be accepted")
        }

        fn displayed_title(&self) -> Option<String> {
            self.surface.read().map(|payload| payload.title)
        }

        fn drain_events(&mut self) -> Vec<SyncEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn without_forensics() -> Config {
        let mut config = Config::default();
        config.timing.forensic_enabled = false;
        config
    }

    fn intruder() -> NowPlayingPayload {
        let pending = UpdateRequest::new("Intruder", "Other App", true)
            .into_pending("Elsewhere")
            .expect("request should be valid");
        NowPlayingPayload::from_snapshot(&pending.snapshot, None)
    }

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_requests_writes_once_with_latest_payload() {
        let harness = Harness::with_artwork();
        for index in 0..5 {
            let ack = harness
                .update(UpdateRequest::new(format!("Show {index}"), "Host", true))
                .await;
            assert_eq!(ack, UpdateAck::Queued);
            settle(50).await;
        }
        settle(400).await;

        assert_eq!(harness.surface.revision(), 1);
        assert_eq!(harness.displayed_title(), Some("Show 4".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_request_after_apply_is_suppressed() {
        let harness = Harness::with_artwork();
        harness.update(UpdateRequest::new("Show A", "Host A", true)).await;
        settle(300).await;

        let ack = harness.update(UpdateRequest::new("Show A", "Host A", true)).await;
        assert_eq!(ack, UpdateAck::Unchanged);
        settle(1_000).await;
        assert_eq!(harness.surface.revision(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revert_during_pending_window_is_not_dropped_early() {
        let harness = Harness::with_artwork();
        harness.update(UpdateRequest::new("Show A", "Host A", true)).await;
        settle(300).await;

        harness.update(UpdateRequest::new("Show B", "Host B", true)).await;
        let ack = harness.update(UpdateRequest::new("Show A", "Host A", true)).await;
        assert_eq!(ack, UpdateAck::Queued);
        settle(400).await;

        assert_eq!(harness.displayed_title(), Some("Show A".to_string()));
        assert_eq!(harness.surface.revision(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_artwork_round_trip_lands_on_surface() {
        let mut harness = Harness::with_artwork();
        harness
            .update(UpdateRequest::new("Show A", "Host A", true).with_artwork_url(ART_URL))
            .await;
        settle(400).await;

        let payload = harness.surface.read().expect("surface should be populated");
        assert_eq!(payload.title, "Show A");
        assert_eq!(payload.artist, "Host A");
        assert_eq!(payload.artwork_source(), Some(ART_URL));
        assert_eq!(harness.surface.revision(), 2);

        let events = harness.drain_events();
        assert_eq!(
            events,
            vec![
                SyncEvent::Applied {
                    title: "Show A".to_string(),
                    artist: "Host A".to_string(),
                    is_playing: true,
                    with_artwork: false,
                },
                SyncEvent::ArtworkApplied {
                    url: ART_URL.to_string()
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_artwork_url_is_fetched_once() {
        let harness = Harness::with_artwork();
        harness
            .update(UpdateRequest::new("Show A", "Host A", true).with_artwork_url(ART_URL))
            .await;
        settle(400).await;
        harness
            .update(UpdateRequest::new("Show A", "Host A", false).with_artwork_url(ART_URL))
            .await;
        settle(3_000).await;

        let payload = harness.surface.read().expect("surface should be populated");
        assert!(!payload.is_playing);
        assert_eq!(payload.artwork_source(), Some(ART_URL));
        assert_eq!(harness.transport.calls(), vec![ART_URL.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_joins_download_already_in_flight() {
        let harness = Harness::start(
            Config::default(),
            ScriptedTransport::always(Behavior::Delayed(
                Duration::from_millis(1_000),
                png_bytes(4, 4),
            )),
        );
        harness
            .update(UpdateRequest::new("Show A", "Host A", true).with_artwork_url(ART_URL))
            .await;
        settle(300).await;
        harness
            .update(UpdateRequest::new("Show A", "Host A", false).with_artwork_url(ART_URL))
            .await;
        settle(1_500).await;

        let payload = harness.surface.read().expect("surface should be populated");
        assert!(!payload.is_playing);
        assert_eq!(payload.artwork_source(), Some(ART_URL));
        assert_eq!(harness.transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_placeholder_is_dropped_only_while_playing() {
        let harness = Harness::with_artwork();
        let ack = harness
            .update(UpdateRequest::new("Loading stream...", "Connecting...", true))
            .await;
        assert_eq!(ack, UpdateAck::PlaceholderSuppressed);
        settle(400).await;
        assert_eq!(harness.surface.revision(), 0);

        let ack = harness
            .update(UpdateRequest::new("Loading stream...", "Connecting...", false))
            .await;
        assert_eq!(ack, UpdateAck::Queued);
        settle(400).await;
        assert_eq!(harness.surface.revision(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_during_artwork_lock_is_deferred_until_release() {
        let mut harness = Harness::with_artwork();
        harness
            .update(UpdateRequest::new("Show A", "Host A", true).with_artwork_url(ART_URL))
            .await;
        settle(300).await;
        assert_eq!(harness.surface.revision(), 2);
        harness.drain_events();

        harness.update(UpdateRequest::new("Show B", "Host B", true)).await;
        settle(400).await;
        assert_eq!(harness.displayed_title(), Some("Show A".to_string()));
        assert_eq!(harness.surface.revision(), 2);
        assert!(harness
            .drain_events()
            .iter()
            .any(|event| matches!(event, SyncEvent::WriteRejected { title, .. } if title == "Show B")));

        settle(2_000).await;
        let payload = harness.surface.read().expect("surface should be populated");
        assert_eq!(payload.title, "Show B");
        assert!(payload.artwork.is_none());
        assert_eq!(harness.surface.revision(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_artwork_download_falls_back_to_text_only() {
        let mut harness = Harness::start(
            Config::default(),
            ScriptedTransport::always(Behavior::Never),
        );
        harness
            .update(UpdateRequest::new("Show A", "Host A", true).with_artwork_url(ART_URL))
            .await;
        settle(300).await;
        assert_eq!(harness.displayed_title(), Some("Show A".to_string()));

        settle(3_500).await;
        let payload = harness.surface.read().expect("surface should be populated");
        assert!(payload.artwork.is_none());
        assert_eq!(harness.surface.revision(), 1);
        assert!(harness
            .drain_events()
            .iter()
            .any(|event| matches!(event, SyncEvent::ArtworkFailed { url, .. } if url == ART_URL)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verifier_restores_surface_overwritten_after_write() {
        let harness = Harness::start(
            without_forensics(),
            ScriptedTransport::always(Behavior::Respond(Ok(png_bytes(4, 4)))),
        );
        harness.update(UpdateRequest::new("Show A", "Host A", true)).await;
        settle(300).await;
        harness
            .surface
            .write(&intruder())
            .expect("external write should succeed");

        settle(1_500).await;
        assert_eq!(harness.displayed_title(), Some("Show A".to_string()));
        assert_eq!(harness.surface.revision(), 3);
    }

    /// Surface that always reports a foreign payload, whatever is written.
    struct StubbornSurface {
        writes: AtomicUsize,
    }

    impl NowPlayingSurface for StubbornSurface {
        fn write(&self, _payload: &NowPlayingPayload) -> Result<(), String> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn read(&self) -> Option<NowPlayingPayload> {
            Some(intruder())
        }

        fn clear(&self) -> Result<(), String> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_verifier_gives_up_after_three_attempts() {
        let surface = Arc::new(StubbornSurface {
            writes: AtomicUsize::new(0),
        });
        let (handle, _task) = SyncController::spawn(
            &without_forensics(),
            surface.clone(),
            ScriptedTransport::always(Behavior::Never),
        );
        let mut events = handle.subscribe();
        handle
            .request_update(UpdateRequest::new("Show A", "Host A", true))
            .await
            .expect("update should be accepted");

        settle(5_000).await;
        assert_eq!(surface.writes.load(Ordering::SeqCst), 3);

        let mut abandoned = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::VerificationAbandoned { title, attempts } = event {
                abandoned.push((title, attempts));
            }
        }
        assert_eq!(abandoned, vec![("Show A".to_string(), 3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forensic_poll_stops_repairing_after_recovery_is_abandoned() {
        let surface = Arc::new(StubbornSurface {
            writes: AtomicUsize::new(0),
        });
        let (handle, _task) = SyncController::spawn(
            &Config::default(),
            surface.clone(),
            ScriptedTransport::always(Behavior::Never),
        );
        let mut events = handle.subscribe();
        handle
            .request_update(UpdateRequest::new("Show A", "Host A", true))
            .await
            .expect("update should be accepted");

        settle(5_000).await;
        assert_eq!(surface.writes.load(Ordering::SeqCst), 3);
        settle(60_000).await;
        assert_eq!(surface.writes.load(Ordering::SeqCst), 3);

        handle
            .request_update(UpdateRequest::new("Show B", "Host B", true))
            .await
            .expect("update should be accepted");
        settle(60_000).await;
        assert_eq!(surface.writes.load(Ordering::SeqCst), 6);

        let mut abandoned = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::VerificationAbandoned { title, .. } = event {
                abandoned.push(title);
            }
        }
        assert_eq!(abandoned, vec!["Show A".to_string(), "Show B".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forensic_poll_detects_and_repairs_override() {
        let mut harness = Harness::with_artwork();
        harness.update(UpdateRequest::new("Show A", "Host A", true)).await;
        settle(800).await;
        harness
            .surface
            .write(&intruder())
            .expect("external write should succeed");

        settle(700).await;
        assert_eq!(harness.displayed_title(), Some("Show A".to_string()));
        assert!(harness.drain_events().contains(&SyncEvent::OverrideDetected {
            expected_title: "Show A".to_string(),
            found_title: "Intruder".to_string(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_reapplies_last_snapshot_immediately() {
        let harness = Harness::start(
            without_forensics(),
            ScriptedTransport::always(Behavior::Never),
        );
        assert_eq!(
            harness.handle.request_refresh().await,
            Ok(UpdateAck::NothingToRefresh)
        );

        harness.update(UpdateRequest::new("Show A", "Host A", true)).await;
        settle(1_000).await;
        harness
            .surface
            .write(&intruder())
            .expect("external write should succeed");

        assert_eq!(harness.handle.request_refresh().await, Ok(UpdateAck::Applied));
        assert_eq!(harness.displayed_title(), Some("Show A".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_empties_surface_and_forgets_state() {
        let mut harness = Harness::with_artwork();
        harness
            .update(UpdateRequest::new("Show A", "Host A", true).with_artwork_url(ART_URL))
            .await;
        settle(400).await;

        harness.handle.clear().await.expect("clear should succeed");
        assert!(harness.surface.read().is_none());
        assert!(harness.drain_events().contains(&SyncEvent::Cleared));
        assert_eq!(
            harness.handle.request_refresh().await,
            Ok(UpdateAck::NothingToRefresh)
        );

        harness.update(UpdateRequest::new("Show B", "Host B", true)).await;
        settle(300).await;
        assert_eq!(harness.displayed_title(), Some("Show B".to_string()));
    }

    fn slow_artwork() -> Arc<ScriptedTransport> {
        ScriptedTransport::always(Behavior::Delayed(
            Duration::from_millis(1_000),
            png_bytes(4, 4),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_discards_artwork_download_in_flight() {
        let mut harness = Harness::start(Config::default(), slow_artwork());
        harness
            .update(UpdateRequest::new("Show A", "Host A", true).with_artwork_url(ART_URL))
            .await;
        settle(300).await;
        assert_eq!(harness.transport.call_count(), 1);

        harness.handle.clear().await.expect("clear should succeed");
        let revision = harness.surface.revision();
        settle(2_000).await;

        assert!(harness.surface.read().is_none());
        assert_eq!(harness.surface.revision(), revision);
        assert!(!harness
            .drain_events()
            .iter()
            .any(|event| matches!(event, SyncEvent::ArtworkApplied { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_discards_artwork_download_in_flight() {
        let mut harness = Harness::start(Config::default(), slow_artwork());
        harness
            .update(UpdateRequest::new("Show A", "Host A", true).with_artwork_url(ART_URL))
            .await;
        settle(300).await;
        assert_eq!(harness.transport.call_count(), 1);

        harness.handle.shutdown();
        (&mut harness.task)
            .await
            .expect("controller task should finish");
        settle(2_000).await;

        let payload = harness.surface.read().expect("text write should remain");
        assert_eq!(payload.title, "Show A");
        assert!(payload.artwork.is_none());
        assert_eq!(harness.surface.revision(), 1);
        assert!(!harness
            .drain_events()
            .iter()
            .any(|event| matches!(event, SyncEvent::ArtworkApplied { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_missing_fields_is_rejected() {
        let harness = Harness::with_artwork();
        let request = UpdateRequest {
            title: Some("Show A".to_string()),
            is_playing: Some(true),
            ..UpdateRequest::default()
        };
        assert_eq!(
            harness.handle.request_update(request).await,
            Err(SyncError::InvalidRequest("missing artist".to_string()))
        );
        settle(400).await;
        assert_eq!(harness.surface.revision(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_controller_and_drops_pending_update() {
        let harness = Harness::with_artwork();
        harness.update(UpdateRequest::new("Show A", "Host A", true)).await;
        harness.handle.shutdown();
        harness.task.await.expect("controller task should finish");

        assert_eq!(
            harness
                .handle
                .request_update(UpdateRequest::new("Show B", "Host B", true))
                .await,
            Err(SyncError::Disposed)
        );
        settle(400).await;
        assert_eq!(harness.surface.revision(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_without_url_drops_cached_artwork() {
        let harness = Harness::with_artwork();
        harness
            .update(UpdateRequest::new("Show A", "Host A", true).with_artwork_url(ART_URL))
            .await;
        settle(400).await;
        harness.update(UpdateRequest::new("Show B", "Host B", true)).await;
        settle(2_500).await;
        assert!(harness
            .surface
            .read()
            .is_some_and(|payload| payload.artwork.is_none()));

        harness
            .update(UpdateRequest::new("Show A", "Host A", true).with_artwork_url(ART_URL))
            .await;
        settle(400).await;
        assert_eq!(harness.transport.call_count(), 2);
    }
}
