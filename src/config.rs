//! Persistent configuration model, defaults, and loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};

const CONFIG_FILE_NAME: &str = "nowplaying_sync.toml";

/// Root configuration persisted to `nowplaying_sync.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Station identity and placeholder denylist extensions.
    pub station: StationConfig,
    #[serde(default)]
    /// Debounce, fetch, lock and verification timings.
    pub timing: TimingConfig,
    #[serde(default)]
    /// Artwork download and export limits.
    pub artwork: ArtworkConfig,
    #[serde(default)]
    /// Which now-playing surface to drive.
    pub surface: SurfaceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Station identity used for default album text and placeholder detection.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct StationConfig {
    #[serde(default = "default_station_name")]
    pub name: String,
    /// Album text used when a request carries none.
    #[serde(default = "default_album")]
    pub default_album: String,
    /// Additional titles treated as "not yet loaded".
    #[serde(default = "default_extra_placeholder_titles")]
    pub extra_placeholder_titles: Vec<String>,
    /// Additional artists treated as "not yet loaded".
    #[serde(default)]
    pub extra_placeholder_artists: Vec<String>,
}

/// Controller timings, all in milliseconds.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TimingConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "default_fetch_max_retries")]
    pub fetch_max_retries: u32,
    /// Delay before retry `n` is `n * fetch_retry_step_ms`.
    #[serde(default = "default_fetch_retry_step_ms")]
    pub fetch_retry_step_ms: u64,
    #[serde(default = "default_artwork_lock_ms")]
    pub artwork_lock_ms: u64,
    #[serde(default = "default_verify_delay_ms")]
    pub verify_delay_ms: u64,
    #[serde(default = "default_verify_max_attempts")]
    pub verify_max_attempts: u32,
    #[serde(default = "default_forensic_interval_ms")]
    pub forensic_interval_ms: u64,
    #[serde(default = "default_true")]
    pub forensic_enabled: bool,
}

/// Artwork download and export limits.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ArtworkConfig {
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,
    /// Longest edge of artwork exported for file-URL surfaces.
    #[serde(default = "default_export_max_edge_px")]
    pub export_max_edge_px: u32,
    #[serde(default = "default_export_cache_max_size_mb")]
    pub export_cache_max_size_mb: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Surface backend selection.
#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceBackend {
    /// OS media controls (MPRIS / SMTC / Now Playing).
    #[default]
    MediaControls,
    /// In-process slot only; useful without a desktop session.
    Headless,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SurfaceConfig {
    #[serde(default)]
    pub backend: SurfaceBackend,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default = "default_dbus_name")]
    pub dbus_name: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LoggingConfig {
    /// One of `error`, `warn`, `info`, `debug`, `trace`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl TimingConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn fetch_retry_step(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_step_ms)
    }

    pub fn artwork_lock(&self) -> Duration {
        Duration::from_millis(self.artwork_lock_ms)
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_millis(self.verify_delay_ms)
    }

    pub fn forensic_interval(&self) -> Duration {
        Duration::from_millis(self.forensic_interval_ms)
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> log::LevelFilter {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "off" => log::LevelFilter::Off,
            "error" => log::LevelFilter::Error,
            "warn" | "warning" => log::LevelFilter::Warn,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => log::LevelFilter::Info,
        }
    }
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            name: default_station_name(),
            default_album: default_album(),
            extra_placeholder_titles: default_extra_placeholder_titles(),
            extra_placeholder_artists: Vec::new(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            fetch_max_retries: default_fetch_max_retries(),
            fetch_retry_step_ms: default_fetch_retry_step_ms(),
            artwork_lock_ms: default_artwork_lock_ms(),
            verify_delay_ms: default_verify_delay_ms(),
            verify_max_attempts: default_verify_max_attempts(),
            forensic_interval_ms: default_forensic_interval_ms(),
            forensic_enabled: true,
        }
    }
}

impl Default for ArtworkConfig {
    fn default() -> Self {
        Self {
            max_download_bytes: default_max_download_bytes(),
            export_max_edge_px: default_export_max_edge_px(),
            export_cache_max_size_mb: default_export_cache_max_size_mb(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            backend: SurfaceBackend::MediaControls,
            display_name: default_display_name(),
            dbus_name: default_dbus_name(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_station_name() -> String {
    "KPFK 90.7 FM".to_string()
}

fn default_album() -> String {
    "KPFK 90.7 FM".to_string()
}

fn default_extra_placeholder_titles() -> Vec<String> {
    vec!["KPFK Radio".to_string(), "KPFK Stream".to_string()]
}

fn default_debounce_ms() -> u64 {
    250
}

fn default_fetch_timeout_ms() -> u64 {
    3_000
}

fn default_fetch_max_retries() -> u32 {
    2
}

fn default_fetch_retry_step_ms() -> u64 {
    1_000
}

fn default_artwork_lock_ms() -> u64 {
    2_000
}

fn default_verify_delay_ms() -> u64 {
    500
}

fn default_verify_max_attempts() -> u32 {
    3
}

fn default_forensic_interval_ms() -> u64 {
    1_000
}

fn default_max_download_bytes() -> u64 {
    8 * 1024 * 1024
}

fn default_export_max_edge_px() -> u32 {
    512
}

fn default_export_cache_max_size_mb() -> u32 {
    32
}

fn default_user_agent() -> String {
    "nowplaying-sync/0.1.0".to_string()
}

fn default_display_name() -> String {
    "KPFK 90.7 FM".to_string()
}

fn default_dbus_name() -> String {
    "nowplaying_sync".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Clamps loaded values into ranges the controller can run with.
pub fn sanitize_config(config: Config) -> Config {
    let mut config = config;
    let timing = &mut config.timing;
    timing.debounce_ms = timing.debounce_ms.clamp(10, 5_000);
    timing.fetch_timeout_ms = timing.fetch_timeout_ms.clamp(250, 30_000);
    timing.fetch_max_retries = timing.fetch_max_retries.min(5);
    timing.fetch_retry_step_ms = timing.fetch_retry_step_ms.clamp(50, 10_000);
    timing.artwork_lock_ms = timing.artwork_lock_ms.clamp(100, 10_000);
    timing.verify_delay_ms = timing.verify_delay_ms.clamp(50, 10_000);
    timing.verify_max_attempts = timing.verify_max_attempts.clamp(1, 10);
    timing.forensic_interval_ms = timing.forensic_interval_ms.clamp(200, 60_000);

    let artwork = &mut config.artwork;
    artwork.max_download_bytes = artwork.max_download_bytes.clamp(64 * 1024, 64 * 1024 * 1024);
    artwork.export_max_edge_px = artwork.export_max_edge_px.clamp(64, 4_096);
    artwork.export_cache_max_size_mb = artwork.export_cache_max_size_mb.max(1);
    if artwork.user_agent.trim().is_empty() {
        artwork.user_agent = default_user_agent();
    }

    if config.station.default_album.trim().is_empty() {
        config.station.default_album = config.station.name.clone();
    }
    if config.surface.dbus_name.trim().is_empty() {
        config.surface.dbus_name = default_dbus_name();
    }
    config
}

/// Default config location under the platform config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Reads the config file, writing defaults first when it does not exist.
///
/// A file that fails to parse falls back to defaults rather than aborting.
pub fn load_or_create(path: &Path) -> Result<Config, String> {
    if !path.exists() {
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("failed to create {}: {err}", parent.display()))?;
        }
        let default_text = toml::to_string(&Config::default())
            .map_err(|err| format!("failed to serialize default config: {err}"))?;
        std::fs::write(path, default_text)
            .map_err(|err| format!("failed to write {}: {err}", path.display()))?;
    }

    let content = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    let parsed = match toml::from_str::<Config>(&content) {
        Ok(config) => config,
        Err(err) => {
            warn!(
                "Config file {} is invalid, using defaults: {}",
                path.display(),
                err
            );
            Config::default()
        }
    };
    Ok(sanitize_config(parsed))
}
