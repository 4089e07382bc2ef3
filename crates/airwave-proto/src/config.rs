use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
    #[serde(default)]
    pub stations: StationsConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Preference store (theme, accent, last station, history).
    #[serde(default = "default_prefs_file")]
    pub prefs_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f32,
    /// Ignore a bundled mpv beside the executable and use the one on PATH.
    #[serde(default)]
    pub use_system_mpv: bool,
}

/// Station list source: a local TOML catalog, falling back to an m3u file or URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationsConfig {
    /// Path to a local TOML station file (highest priority).
    /// Defaults to `~/.config/airwave/stations.toml`.
    #[serde(default = "default_stations_toml")]
    pub stations_toml: PathBuf,
    /// URL or file path for an m3u station list (fallback when TOML not found).
    /// Empty disables the fallback.
    #[serde(default)]
    pub m3u_url: String,
}

/// Now-playing proxy and refresh cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Base URL of the metadata proxy; the stream URL is passed as `?url=`.
    #[serde(default = "default_proxy_base")]
    pub proxy_base: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Period of the background refresh ticker once playback is confirmed.
    #[serde(default = "default_refresh_period_secs")]
    pub refresh_period_secs: u64,
    /// Minimum spacing between unforced checks.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Minimum spacing between unforced checks while no client is in the foreground.
    #[serde(default = "default_background_cooldown_secs")]
    pub background_cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Delay before retrying a failed play attempt or a broken stream.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

/// Offline asset cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Version tag; caches from any other tag are evicted on activation.
    #[serde(default = "default_cache_version")]
    pub version: String,
    /// Assets fetched into the cache at install time.
    #[serde(default)]
    pub precache: Vec<String>,
    /// URL substrings that are always fetched from the network.
    #[serde(default = "default_network_only_hosts")]
    pub network_only_hosts: Vec<String>,
}

impl MetadataConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.refresh_period_secs.max(1))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn background_cooldown(&self) -> Duration {
        Duration::from_secs(self.background_cooldown_secs)
    }
}

impl PlaybackConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            prefs_file: default_prefs_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            use_system_mpv: false,
        }
    }
}

impl Default for StationsConfig {
    fn default() -> Self {
        Self {
            stations_toml: default_stations_toml(),
            m3u_url: String::new(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            proxy_base: default_proxy_base(),
            request_timeout_secs: default_request_timeout_secs(),
            refresh_period_secs: default_refresh_period_secs(),
            cooldown_secs: default_cooldown_secs(),
            background_cooldown_secs: default_background_cooldown_secs(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            version: default_cache_version(),
            precache: Vec::new(),
            network_only_hosts: default_network_only_hosts(),
        }
    }
}

fn default_prefs_file() -> PathBuf {
    platform::data_dir().join("prefs.json")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8989
}

fn default_volume() -> f32 {
    0.5
}

fn default_stations_toml() -> PathBuf {
    // Portable install: stations.toml next to the executable
    #[cfg(windows)]
    {
        if let Some(p) = platform::beside_exe("stations.toml") {
            return p;
        }
    }

    platform::config_dir().join("stations.toml")
}

fn default_proxy_base() -> String {
    "http://127.0.0.1:8787/metadata".to_string()
}

fn default_request_timeout_secs() -> u64 {
    8
}

fn default_refresh_period_secs() -> u64 {
    5
}

fn default_cooldown_secs() -> u64 {
    15
}

fn default_background_cooldown_secs() -> u64 {
    30
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_cache_version() -> String {
    "v1".to_string()
}

fn default_network_only_hosts() -> Vec<String> {
    [
        "icecast",
        "shoutcast",
        "streamtheworld",
        "somafm.com",
        "zeno.fm",
        "radio.co",
        "/stream",
        ".m3u8",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8989);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert!(config.stations.m3u_url.is_empty());
        assert!(config
            .stations
            .stations_toml
            .ends_with("airwave/stations.toml"));
        assert_eq!(config.metadata.refresh_period(), Duration::from_secs(5));
        assert_eq!(config.metadata.cooldown(), Duration::from_secs(15));
        assert_eq!(config.metadata.background_cooldown(), Duration::from_secs(30));
        assert_eq!(config.playback.retry_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
[metadata]
proxy_base = "https://np.example/api"
cooldown_secs = 20

[cache]
version = "v7"
"#,
        )
        .unwrap();
        assert_eq!(config.metadata.proxy_base, "https://np.example/api");
        assert_eq!(config.metadata.cooldown_secs, 20);
        assert_eq!(config.metadata.refresh_period_secs, 5);
        assert_eq!(config.cache.version, "v7");
        assert!(config.cache.network_only_hosts.iter().any(|h| h == "icecast"));
        assert_eq!(config.http.port, 8989);
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.metadata.proxy_base, config.metadata.proxy_base);
        assert_eq!(back.daemon.prefs_file, config.daemon.prefs_file);
    }
}
