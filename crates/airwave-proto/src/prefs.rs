//! Preference store: string-keyed JSON blobs persisted in one file.
//!
//! Each value is stored as its own JSON text so that a single corrupted key
//! falls back to its default without taking the others down with it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::protocol::{AccentColor, Station, Theme};
use crate::recent::{RecentEntry, RecentlyPlayed};

pub const KEY_THEME: &str = "theme";
pub const KEY_ACCENT_COLOR: &str = "accentColor";
pub const KEY_LAST_STATION: &str = "lastStation";
pub const KEY_RECENTLY_PLAYED: &str = "recentlyPlayed";
pub const KEY_VOLUME: &str = "volume";

/// `{name, link}` snapshot of the last selected station.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StationSnapshot {
    pub name: String,
    pub link: String,
}

impl From<&Station> for StationSnapshot {
    fn from(station: &Station) -> Self {
        Self {
            name: station.name.clone(),
            link: station.stream_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Preferences {
    pub theme: Theme,
    pub accent_color: AccentColor,
    pub last_station: Option<StationSnapshot>,
}

pub struct PreferenceStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl PreferenceStore {
    /// Open the store at `path`.  A missing or unreadable file yields an
    /// empty store; it is created on the first write.
    pub fn open(path: PathBuf) -> Self {
        let entries = Self::load_entries(&path);
        Self { path, entries }
    }

    fn load_entries(path: &Path) -> BTreeMap<String, String> {
        let Ok(content) = std::fs::read_to_string(path) else {
            return BTreeMap::new();
        };
        match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("prefs: {} is not valid, starting empty: {}", path.display(), e);
                BTreeMap::new()
            }
        }
    }

    /// Typed read.  Missing keys and undecodable values both yield `default`.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        let Some(raw) = self.entries.get(key) else {
            return default;
        };
        match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!("prefs: key '{}' is corrupt, using default: {}", key, e);
                default
            }
        }
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> anyhow::Result<()> {
        let raw = serde_json::to_string(value)?;
        self.entries.insert(key.to_string(), raw);
        self.save()
    }

    pub fn remove(&mut self, key: &str) -> anyhow::Result<()> {
        if self.entries.remove(key).is_some() {
            self.save()?;
        }
        Ok(())
    }

    fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, json)?;
        debug!("prefs: saved {} keys to {}", self.entries.len(), self.path.display());
        Ok(())
    }

    // ── typed records ─────────────────────────────────────────────────────────

    pub fn preferences(&self) -> Preferences {
        Preferences {
            theme: self.get(KEY_THEME, Theme::default()),
            accent_color: self.get(KEY_ACCENT_COLOR, AccentColor::default()),
            last_station: self.get(KEY_LAST_STATION, None),
        }
    }

    pub fn recently_played(&self) -> RecentlyPlayed {
        RecentlyPlayed::from_entries(self.get::<Vec<RecentEntry>>(KEY_RECENTLY_PLAYED, Vec::new()))
    }

    pub fn set_theme(&mut self, theme: Theme) -> anyhow::Result<()> {
        self.set(KEY_THEME, &theme)
    }

    pub fn set_accent_color(&mut self, color: AccentColor) -> anyhow::Result<()> {
        self.set(KEY_ACCENT_COLOR, &color)
    }

    pub fn set_last_station(&mut self, station: &StationSnapshot) -> anyhow::Result<()> {
        self.set(KEY_LAST_STATION, station)
    }

    pub fn set_recently_played(&mut self, recent: &RecentlyPlayed) -> anyhow::Result<()> {
        self.set(KEY_RECENTLY_PLAYED, &recent.entries())
    }
}
