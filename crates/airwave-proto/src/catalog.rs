use std::collections::BTreeMap;

use crate::protocol::{split_genres, Station};
use crate::recent::RecentlyPlayed;

/// Display name of the pseudo-category synthesized from the play history.
pub const RECENTLY_PLAYED_GENRE: &str = "Recently played";

/// The station list loaded at startup, in catalog order.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    stations: Vec<Station>,
}

impl Catalog {
    /// Duplicate names are dropped (first one wins): the name is the key
    /// every command and history entry refers to.
    pub fn new(stations: Vec<Station>) -> Self {
        let mut unique: Vec<Station> = Vec::with_capacity(stations.len());
        for station in stations {
            if unique.iter().any(|s| s.name == station.name) {
                tracing::warn!("catalog: duplicate station name '{}' ignored", station.name);
                continue;
            }
            unique.push(station);
        }
        Self { stations: unique }
    }

    pub fn into_stations(self) -> Vec<Station> {
        self.stations
    }

    pub fn find(&self, name: &str) -> Option<&Station> {
        self.stations.iter().find(|s| s.name == name)
    }

    pub fn find_by_link(&self, link: &str) -> Option<&Station> {
        self.stations.iter().find(|s| s.stream_url == link)
    }

    /// All genre tags, case-insensitively merged, sorted.
    pub fn genres(&self) -> Vec<String> {
        let mut seen: BTreeMap<String, String> = BTreeMap::new();
        for tag in self.stations.iter().flat_map(|s| s.genres.iter()) {
            seen.entry(tag.to_lowercase()).or_insert_with(|| tag.clone());
        }
        seen.into_values().collect()
    }

    pub fn by_genre(&self, genre: &str) -> Vec<&Station> {
        self.stations.iter().filter(|s| s.has_genre(genre)).collect()
    }

    /// Stations for the "recently played" pseudo-category, in history order.
    /// Entries whose link is still in the catalog resolve to the catalog
    /// record; the rest are materialized from the history row itself.
    pub fn recently_played(&self, recent: &RecentlyPlayed) -> Vec<Station> {
        recent
            .entries()
            .iter()
            .map(|e| {
                self.find_by_link(&e.link)
                    .cloned()
                    .unwrap_or_else(|| Station::new(e.name.clone(), e.link.clone(), &e.genre))
            })
            .collect()
    }
}

pub fn parse_m3u_from_str(content: &str) -> anyhow::Result<Vec<Station>> {
    let mut stations = Vec::new();
    let mut pending: Option<(String, String)> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            if let Some(comma_idx) = rest.rfind(',') {
                let attrs = &rest[..comma_idx];
                let name = rest[comma_idx + 1..].trim().to_string();
                let genre = extinf_attr(attrs, "group-title").unwrap_or_default();
                pending = Some((name, genre));
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let url = line.to_string();
        let (name, genre) = pending.take().unwrap_or_else(|| (url.clone(), String::new()));

        stations.push(Station::new(name, url, &genre));
    }

    Ok(stations)
}

/// Extract `key="value"` from the attribute part of an `#EXTINF` line.
fn extinf_attr(attrs: &str, key: &str) -> Option<String> {
    let needle = format!("{}=\"", key);
    let start = attrs.find(&needle)? + needle.len();
    let end = attrs[start..].find('"')? + start;
    Some(attrs[start..end].to_string())
}

pub fn load_stations_from_m3u(path: &std::path::Path) -> anyhow::Result<Vec<Station>> {
    let content = std::fs::read_to_string(path)?;
    parse_m3u_from_str(&content)
}

// ── TOML station loader ───────────────────────────────────────────────────────

/// Matches the `[[station]]` table.  Kept apart from `Station` so the file
/// format can diverge from the wire struct.
#[derive(Debug, serde::Deserialize)]
struct TomlStationFile {
    station: Vec<TomlStation>,
}

#[derive(Debug, serde::Deserialize)]
struct TomlStation {
    name: String,
    link: String,
    #[serde(default)]
    genre: String,
}

pub fn load_stations_from_toml(path: &std::path::Path) -> anyhow::Result<Vec<Station>> {
    let content = std::fs::read_to_string(path)?;
    parse_stations_from_toml_str(&content)
}

pub fn parse_stations_from_toml_str(content: &str) -> anyhow::Result<Vec<Station>> {
    let file: TomlStationFile = toml::from_str(content)?;
    let stations = file
        .station
        .into_iter()
        .map(|s| Station {
            name: s.name,
            stream_url: s.link,
            genres: split_genres(&s.genre),
            ..Station::default()
        })
        .collect();
    Ok(stations)
}
