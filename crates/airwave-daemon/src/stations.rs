use std::path::{Path, PathBuf};

use airwave_proto::catalog::{load_stations_from_m3u, load_stations_from_toml, parse_m3u_from_str};
use airwave_proto::config::StationsConfig;
use airwave_proto::platform;
use airwave_proto::protocol::Station;
use tracing::{info, warn};

/// Resolve the station catalog.  First source that parses wins:
///
/// 1. the configured `stations.toml`
/// 2. `stations.toml` beside the executable
/// 3. `stations.toml` in the working directory
/// 4. the configured m3u URL or file
///
/// No source at all yields an empty catalog.
pub async fn load_stations(config: &StationsConfig) -> Vec<Station> {
    let mut candidates: Vec<(&str, PathBuf)> = vec![("config", config.stations_toml.clone())];
    if let Some(beside) = platform::beside_exe("stations.toml") {
        candidates.push(("beside-exe", beside));
    }
    candidates.push(("working dir", PathBuf::from("stations.toml")));

    for (label, path) in &candidates {
        if let Some(stations) = try_toml(label, path) {
            return stations;
        }
    }

    let source = config.m3u_url.trim();
    if source.is_empty() {
        info!("No station source available, starting with empty list");
        return Vec::new();
    }

    info!("Loading stations from m3u: {}", source);
    let loaded = if source.starts_with("http://") || source.starts_with("https://") {
        fetch_m3u_url(source).await
    } else {
        load_stations_from_m3u(Path::new(source))
    };
    match loaded {
        Ok(s) => {
            info!("Loaded {} stations from m3u", s.len());
            s
        }
        Err(e) => {
            warn!("Failed to load m3u stations from {}: {:#}", source, e);
            Vec::new()
        }
    }
}

fn try_toml(label: &str, path: &Path) -> Option<Vec<Station>> {
    if !path.exists() {
        return None;
    }
    match load_stations_from_toml(path) {
        Ok(s) => {
            info!("Loaded {} stations from {} TOML: {}", s.len(), label, path.display());
            Some(s)
        }
        Err(e) => {
            warn!("Failed to parse {} stations.toml {}: {:#}", label, path.display(), e);
            None
        }
    }
}

async fn fetch_m3u_url(url: &str) -> anyhow::Result<Vec<Station>> {
    let response = reqwest::get(url).await?;
    if !response.status().is_success() {
        anyhow::bail!("HTTP {}", response.status());
    }
    let text = response.text().await?;
    parse_m3u_from_str(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const M3U: &str = "#EXTM3U\n\
        #EXTINF:-1 group-title=\"ambient\",Drone Zone\n\
        https://ice.example/dronezone\n";

    #[tokio::test]
    async fn test_configured_toml_wins() {
        let dir = tempfile::tempdir().unwrap();
        let toml = dir.path().join("stations.toml");
        std::fs::write(
            &toml,
            "[[station]]\nname = \"Groove Salad\"\nlink = \"https://ice.example/gs\"\ngenre = \"ambient\"\n",
        )
        .unwrap();
        let m3u = dir.path().join("radios.m3u");
        std::fs::write(&m3u, M3U).unwrap();

        let stations = load_stations(&StationsConfig {
            stations_toml: toml,
            m3u_url: m3u.display().to_string(),
        })
        .await;
        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].name, "Groove Salad");
    }

    #[tokio::test]
    async fn test_broken_toml_falls_back_to_m3u() {
        let dir = tempfile::tempdir().unwrap();
        let toml = dir.path().join("stations.toml");
        std::fs::write(&toml, "[[station]]\nname = 5\n").unwrap();
        let m3u = dir.path().join("radios.m3u");
        std::fs::write(&m3u, M3U).unwrap();

        let stations = load_stations(&StationsConfig {
            stations_toml: toml,
            m3u_url: m3u.display().to_string(),
        })
        .await;
        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].name, "Drone Zone");
        assert_eq!(stations[0].genres, vec!["ambient"]);
    }

    #[tokio::test]
    async fn test_no_source_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let stations = load_stations(&StationsConfig {
            stations_toml: dir.path().join("missing.toml"),
            m3u_url: String::new(),
        })
        .await;
        assert!(stations.is_empty());
    }
}
