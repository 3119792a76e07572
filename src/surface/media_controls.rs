//! OS media controls surface (MPRIS/SMTC/Now Playing).
//!
//! Publishes payloads to the platform through `souvlaki` and forwards remote
//! play/pause/stop events to the host as [`TransportCommand`]s.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use souvlaki::{
    MediaControlEvent, MediaControls, MediaMetadata, MediaPlayback, MediaPosition, PlatformConfig,
};
use tokio::sync::mpsc::UnboundedSender;

use crate::artwork::image_pipeline::{
    artwork_export_dir, export_artwork_png_in, file_url_for_path, mb_to_bytes, prune_export_dir,
};
use crate::config::{ArtworkConfig, SurfaceConfig};
use crate::protocol::TransportCommand;
use crate::snapshot::NowPlayingPayload;
use crate::surface::NowPlayingSurface;

enum SurfaceCommand {
    Publish(NowPlayingPayload),
    Clear,
}

#[derive(Debug, Clone)]
struct ArtworkExport {
    dir: Option<PathBuf>,
    max_edge_px: u32,
    max_cache_bytes: u64,
}

impl ArtworkExport {
    fn cover_url(&self, payload: &NowPlayingPayload) -> Option<String> {
        let artwork = payload.artwork.as_ref()?;
        let dir = self.dir.as_ref()?;
        let Some(path) = export_artwork_png_in(dir, artwork, self.max_edge_px) else {
            warn!(
                "MediaControlsSurface: failed to export artwork {} to {}",
                artwork.source_url(),
                dir.display()
            );
            return None;
        };
        let removed = prune_export_dir(dir, self.max_cache_bytes, &path);
        if !removed.is_empty() {
            debug!(
                "MediaControlsSurface: pruned {} exported artwork file(s)",
                removed.len()
            );
        }
        Some(file_url_for_path(&path))
    }
}

/// Now-playing surface backed by the platform media controls.
///
/// `souvlaki` controls are not `Send` on every platform, so they live on a
/// dedicated thread fed through a command channel. Platforms expose no way to
/// read the displayed metadata back; `read` reports the last payload published
/// from this process.
pub struct MediaControlsSurface {
    commands: Mutex<Sender<SurfaceCommand>>,
    displayed: Arc<Mutex<Option<NowPlayingPayload>>>,
}

impl MediaControlsSurface {
    pub fn start(
        surface: &SurfaceConfig,
        artwork: &ArtworkConfig,
        transport_commands: UnboundedSender<TransportCommand>,
    ) -> Result<Self, String> {
        let (sender, receiver) = mpsc::channel();
        let displayed = Arc::new(Mutex::new(None));
        let export = ArtworkExport {
            dir: artwork_export_dir(),
            max_edge_px: artwork.export_max_edge_px,
            max_cache_bytes: mb_to_bytes(artwork.export_cache_max_size_mb),
        };
        let display_name = surface.display_name.clone();
        let dbus_name = surface.dbus_name.clone();
        let thread_displayed = Arc::clone(&displayed);

        thread::Builder::new()
            .name("media-controls".to_string())
            .spawn(move || {
                let controls = Self::create_controls(
                    &display_name,
                    &dbus_name,
                    transport_commands,
                    thread_displayed,
                );
                Self::run(controls, receiver, export);
            })
            .map_err(|err| format!("failed to spawn media controls thread: {err}"))?;

        Ok(Self {
            commands: Mutex::new(sender),
            displayed,
        })
    }

    #[cfg(not(target_os = "windows"))]
    fn create_controls(
        display_name: &str,
        dbus_name: &str,
        transport_commands: UnboundedSender<TransportCommand>,
        displayed: Arc<Mutex<Option<NowPlayingPayload>>>,
    ) -> Option<MediaControls> {
        let mut controls = match MediaControls::new(PlatformConfig {
            display_name,
            dbus_name,
            hwnd: None,
        }) {
            Ok(controls) => controls,
            Err(err) => {
                warn!(
                    "MediaControlsSurface: failed to create media controls backend: {}",
                    err
                );
                return None;
            }
        };

        if let Err(err) = controls.attach(move |event| {
            let is_playing = match displayed.lock() {
                Ok(payload) => payload.as_ref().is_some_and(|p| p.is_playing),
                Err(poisoned) => poisoned.into_inner().as_ref().is_some_and(|p| p.is_playing),
            };
            if let Some(command) = Self::map_control_event(event, is_playing) {
                let _ = transport_commands.send(command);
            }
        }) {
            warn!(
                "MediaControlsSurface: failed to attach media controls handler: {}",
                err
            );
            return None;
        }

        Some(controls)
    }

    #[cfg(target_os = "windows")]
    fn create_controls(
        _display_name: &str,
        _dbus_name: &str,
        _transport_commands: UnboundedSender<TransportCommand>,
        _displayed: Arc<Mutex<Option<NowPlayingPayload>>>,
    ) -> Option<MediaControls> {
        // Souvlaki requires an HWND on Windows and this process has no window.
        warn!(
            "MediaControlsSurface: Windows media controls are disabled because no HWND is available"
        );
        None
    }

    /// Remote events for a live stream: play state only, no seeking.
    fn map_control_event(event: MediaControlEvent, is_playing: bool) -> Option<TransportCommand> {
        match event {
            MediaControlEvent::Play => Some(TransportCommand::Play),
            MediaControlEvent::Pause => Some(TransportCommand::Pause),
            MediaControlEvent::Toggle => {
                if is_playing {
                    Some(TransportCommand::Pause)
                } else {
                    Some(TransportCommand::Play)
                }
            }
            MediaControlEvent::Stop => Some(TransportCommand::Stop),
            MediaControlEvent::Next
            | MediaControlEvent::Previous
            | MediaControlEvent::Seek(_)
            | MediaControlEvent::SeekBy(_, _)
            | MediaControlEvent::SetPosition(_)
            | MediaControlEvent::SetVolume(_)
            | MediaControlEvent::OpenUri(_)
            | MediaControlEvent::Raise
            | MediaControlEvent::Quit => None,
        }
    }

    fn playback_for(payload: &NowPlayingPayload) -> MediaPlayback {
        let progress = payload
            .position_ms
            .map(|ms| MediaPosition(Duration::from_millis(ms)));
        if payload.is_playing {
            MediaPlayback::Playing { progress }
        } else {
            MediaPlayback::Paused { progress }
        }
    }

    fn publish(controls: &mut MediaControls, payload: &NowPlayingPayload, export: &ArtworkExport) {
        let cover_url = export.cover_url(payload);
        let duration = payload.duration_ms.map(Duration::from_millis);
        if let Err(err) = controls.set_metadata(MediaMetadata {
            title: Some(payload.title.as_str()),
            artist: Some(payload.artist.as_str()),
            album: Some(payload.album.as_str()),
            cover_url: cover_url.as_deref(),
            duration,
        }) {
            warn!("MediaControlsSurface: failed to publish metadata: {}", err);
        }
        if let Err(err) = controls.set_playback(Self::playback_for(payload)) {
            warn!(
                "MediaControlsSurface: failed to publish playback state: {}",
                err
            );
        }
    }

    fn run(
        mut controls: Option<MediaControls>,
        commands: Receiver<SurfaceCommand>,
        export: ArtworkExport,
    ) {
        info!(
            "MediaControlsSurface: started (platform controls {})",
            if controls.is_some() { "enabled" } else { "disabled" }
        );
        while let Ok(command) = commands.recv() {
            let Some(controls) = controls.as_mut() else {
                continue;
            };
            match command {
                SurfaceCommand::Publish(payload) => Self::publish(controls, &payload, &export),
                SurfaceCommand::Clear => {
                    if let Err(err) = controls.set_metadata(MediaMetadata::default()) {
                        warn!("MediaControlsSurface: failed to clear metadata: {}", err);
                    }
                    if let Err(err) = controls.set_playback(MediaPlayback::Stopped) {
                        warn!("MediaControlsSurface: failed to clear playback: {}", err);
                    }
                }
            }
        }
        info!("MediaControlsSurface: stopped");
    }

    fn send(&self, command: SurfaceCommand) -> Result<(), String> {
        let sender = match self.commands.lock() {
            Ok(sender) => sender,
            Err(poisoned) => poisoned.into_inner(),
        };
        sender
            .send(command)
            .map_err(|_| "media controls thread has stopped".to_string())
    }

    fn set_displayed(&self, payload: Option<NowPlayingPayload>) {
        match self.displayed.lock() {
            Ok(mut displayed) => *displayed = payload,
            Err(poisoned) => *poisoned.into_inner() = payload,
        }
    }
}

impl NowPlayingSurface for MediaControlsSurface {
    fn write(&self, payload: &NowPlayingPayload) -> Result<(), String> {
        self.send(SurfaceCommand::Publish(payload.clone()))?;
        self.set_displayed(Some(payload.clone()));
        Ok(())
    }

    fn read(&self) -> Option<NowPlayingPayload> {
        match self.displayed.lock() {
            Ok(displayed) => displayed.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn clear(&self) -> Result<(), String> {
        self.send(SurfaceCommand::Clear)?;
        self.set_displayed(None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MediaControlsSurface;
    use crate::protocol::TransportCommand;
    use crate::snapshot::{NowPlayingPayload, UpdateRequest};
    use souvlaki::{MediaControlEvent, MediaPlayback, MediaPosition, SeekDirection};
    use std::time::Duration;

    #[test]
    fn test_toggle_event_pauses_when_currently_playing() {
        let command = MediaControlsSurface::map_control_event(MediaControlEvent::Toggle, true);
        assert_eq!(command, Some(TransportCommand::Pause));
    }

    #[test]
    fn test_toggle_event_plays_when_currently_paused() {
        let command = MediaControlsSurface::map_control_event(MediaControlEvent::Toggle, false);
        assert_eq!(command, Some(TransportCommand::Play));
    }

    #[test]
    fn test_play_pause_and_stop_map_directly() {
        assert_eq!(
            MediaControlsSurface::map_control_event(MediaControlEvent::Play, true),
            Some(TransportCommand::Play)
        );
        assert_eq!(
            MediaControlsSurface::map_control_event(MediaControlEvent::Pause, false),
            Some(TransportCommand::Pause)
        );
        assert_eq!(
            MediaControlsSurface::map_control_event(MediaControlEvent::Stop, true),
            Some(TransportCommand::Stop)
        );
    }

    #[test]
    fn test_seek_and_track_skips_are_ignored_for_live_stream() {
        let ignored = [
            MediaControlEvent::Next,
            MediaControlEvent::Previous,
            MediaControlEvent::Seek(SeekDirection::Forward),
            MediaControlEvent::SeekBy(SeekDirection::Backward, Duration::from_secs(5)),
            MediaControlEvent::SetPosition(MediaPosition(Duration::from_secs(30))),
            MediaControlEvent::Raise,
        ];
        for event in ignored {
            assert!(MediaControlsSurface::map_control_event(event, true).is_none());
        }
    }

    #[test]
    fn test_playback_state_carries_position_when_known() {
        let pending = UpdateRequest::new("Show", "Host", false)
            .with_timing(Some(60_000), Some(12_000))
            .into_pending("Station")
            .expect("request should be valid");
        let payload = NowPlayingPayload::from_snapshot(&pending.snapshot, None);
        match MediaControlsSurface::playback_for(&payload) {
            MediaPlayback::Paused {
                progress: Some(MediaPosition(position)),
            } => assert_eq!(position, Duration::from_millis(12_000)),
            _ => panic!("expected paused playback with progress"),
        }
    }
}
