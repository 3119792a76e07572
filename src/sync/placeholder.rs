//! Detection of "stream not loaded yet" metadata.

use std::collections::HashSet;

use crate::config::StationConfig;
use crate::snapshot::NowPlayingSnapshot;

const PLACEHOLDER_TITLES: &[&str] = &[
    "",
    "loading stream...",
    "loading stream…",
    "connecting...",
    "connecting…",
];
const PLACEHOLDER_ARTISTS: &[&str] = &["", "connecting...", "connecting…", "live stream"];
const TITLE_MARKER: &str = "loading stream";
const ARTIST_MARKER: &str = "connecting";

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Classifies snapshots whose text only says the stream is still loading.
#[derive(Debug, Clone)]
pub struct PlaceholderFilter {
    titles: HashSet<String>,
    artists: HashSet<String>,
}

impl PlaceholderFilter {
    pub fn new(station: &StationConfig) -> Self {
        let mut titles: HashSet<String> =
            PLACEHOLDER_TITLES.iter().map(|value| normalize(value)).collect();
        titles.insert(normalize(&station.name));
        titles.extend(station.extra_placeholder_titles.iter().map(|v| normalize(v)));

        let mut artists: HashSet<String> =
            PLACEHOLDER_ARTISTS.iter().map(|value| normalize(value)).collect();
        artists.extend(station.extra_placeholder_artists.iter().map(|v| normalize(v)));

        Self { titles, artists }
    }

    pub fn is_placeholder(&self, title: &str, artist: &str) -> bool {
        let title = normalize(title);
        let artist = normalize(artist);
        self.titles.contains(&title)
            || self.artists.contains(&artist)
            || title.contains(TITLE_MARKER)
            || artist.contains(ARTIST_MARKER)
    }

    /// Placeholders are only dropped while playing; a paused placeholder is
    /// the final state and must still reach the surface.
    pub fn should_suppress(&self, snapshot: &NowPlayingSnapshot) -> bool {
        snapshot.is_playing && self.is_placeholder(&snapshot.title, &snapshot.artist)
    }
}
