//! Offline cache for static assets (station logos, stylesheets, anything a
//! presentation client asks the daemon to fetch through `/api/asset`).
//!
//! Entries live under `{root}/assets-{version}/`.  Activation removes every
//! `assets-*` directory from other versions.  Stream and icon URLs are never
//! cached.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;

use airwave_proto::config::CacheConfig;
use anyhow::Context;
use tracing::{debug, info, warn};

const DIR_PREFIX: &str = "assets-";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub from_cache: bool,
}

pub struct AssetCache {
    root: PathBuf,
    version: String,
    network_only_hosts: Vec<String>,
    client: reqwest::Client,
}

impl AssetCache {
    pub fn new(root: PathBuf, config: &CacheConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .user_agent(concat!("airwave/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            root,
            version: config.version.clone(),
            network_only_hosts: config.network_only_hosts.clone(),
            client,
        })
    }

    fn dir(&self) -> PathBuf {
        self.root.join(format!("{}{}", DIR_PREFIX, self.version))
    }

    fn entry_path(&self, url: &str) -> PathBuf {
        let mut hasher = DefaultHasher::new();
        url.hash(&mut hasher);
        self.dir().join(format!("{:x}", hasher.finish()))
    }

    /// Streams and icons always go to the network.
    pub fn is_network_only(&self, url: &str) -> bool {
        let lower = url.to_ascii_lowercase();
        let path = lower.split(['?', '#']).next().unwrap_or_default();
        path.ends_with(".ico")
            || path.contains("favicon")
            || self
                .network_only_hosts
                .iter()
                .any(|host| lower.contains(&host.to_ascii_lowercase()))
    }

    /// Fetch every URL in `urls` into the cache.  Failures are logged and
    /// skipped; returns how many entries were stored.
    pub async fn install(&self, urls: &[String]) -> usize {
        let mut stored = 0;
        for url in urls {
            if self.is_network_only(url) {
                debug!("asset cache: '{}' is network-only, not precached", url);
                continue;
            }
            match self.download(url).await {
                Ok(asset) => match self.store(url, &asset).await {
                    Ok(()) => stored += 1,
                    Err(e) => warn!("asset cache: could not store '{}': {:#}", url, e),
                },
                Err(e) => warn!("asset cache: precache of '{}' failed: {:#}", url, e),
            }
        }
        info!("asset cache: precached {}/{} assets", stored, urls.len());
        stored
    }

    /// Remove cache directories left over from other versions.  Returns how
    /// many were removed.
    pub async fn activate(&self) -> anyhow::Result<usize> {
        tokio::fs::create_dir_all(self.dir())
            .await
            .with_context(|| format!("creating {:?}", self.dir()))?;

        let current = format!("{}{}", DIR_PREFIX, self.version);
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(DIR_PREFIX) || name == current {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    info!("asset cache: evicted {}", name);
                    removed += 1;
                }
                Err(e) => warn!("asset cache: could not evict {}: {}", name, e),
            }
        }
        Ok(removed)
    }

    /// Cache-first fetch.  Network-only URLs bypass the cache entirely.
    pub async fn fetch(&self, url: &str) -> anyhow::Result<Asset> {
        if self.is_network_only(url) {
            return self.download(url).await;
        }
        if let Some(asset) = self.lookup(url).await {
            debug!("asset cache: hit for '{}'", url);
            return Ok(asset);
        }
        let asset = self.download(url).await?;
        if let Err(e) = self.store(url, &asset).await {
            warn!("asset cache: could not store '{}': {:#}", url, e);
        }
        Ok(asset)
    }

    async fn download(&self, url: &str) -> anyhow::Result<Asset> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("requesting {}", url))?
            .error_for_status()?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let bytes = resp.bytes().await?.to_vec();
        Ok(Asset {
            bytes,
            content_type,
            from_cache: false,
        })
    }

    async fn lookup(&self, url: &str) -> Option<Asset> {
        let path = self.entry_path(url);
        let bytes = tokio::fs::read(&path).await.ok()?;
        let content_type = tokio::fs::read_to_string(content_type_path(&path))
            .await
            .unwrap_or_else(|_| DEFAULT_CONTENT_TYPE.to_string());
        Some(Asset {
            bytes,
            content_type,
            from_cache: true,
        })
    }

    async fn store(&self, url: &str, asset: &Asset) -> anyhow::Result<()> {
        let path = self.entry_path(url);
        tokio::fs::create_dir_all(self.dir()).await?;
        tokio::fs::write(&path, &asset.bytes).await?;
        tokio::fs::write(content_type_path(&path), &asset.content_type).await?;
        Ok(())
    }
}

fn content_type_path(entry: &Path) -> PathBuf {
    entry.with_extension("type")
}
