//! Now-playing lookups through the metadata proxy.
//!
//! The proxy is asked `GET {proxy_base}?url=<stream url>` and answers
//! `{success, title?, isStationName?, quality?: {bitrate?, format?}}`.
//! Every failure collapses to "nothing" at the [`MetadataSource`] seam; the
//! typed [`MetadataError`] only exists so the reason can be logged.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Result of one successful lookup.  `title` is already normalized; `None`
/// means the proxy had nothing usable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NowPlaying {
    pub title: Option<String>,
    pub bitrate: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("proxy answered HTTP {0}")]
    Status(u16),
    #[error("malformed proxy body: {0}")]
    Body(#[from] serde_json::Error),
    #[error("proxy reported no metadata")]
    Unsuccessful,
}

/// Anything the controller can ask for now-playing info.
pub trait MetadataSource: Send + Sync + 'static {
    fn fetch_now_playing(&self, stream_url: &str)
        -> impl Future<Output = Option<NowPlaying>> + Send;
}

#[derive(Debug, Deserialize)]
struct ProxyResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, rename = "isStationName")]
    is_station_name: bool,
    #[serde(default)]
    quality: Option<ProxyQuality>,
}

#[derive(Debug, Deserialize)]
struct ProxyQuality {
    #[serde(default)]
    bitrate: Option<Value>,
    #[serde(default)]
    format: Option<Value>,
}

/// Bitrate arrives as either `128` or `"128"` depending on the upstream.
fn value_text(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

// ── title normalization ───────────────────────────────────────────────────────

/// Boilerplate prefixes stations put in front of the actual title.
const BOILERPLATE_PREFIXES: &[&str] = &[
    "now playing:",
    "now playing -",
    "currently playing:",
    "on air:",
    "playing:",
];

/// Whole-title placeholders that mean "nothing to show".
const PLACEHOLDER_TITLES: &[&str] = &["unknown", "n/a", "untitled", "-", "null", "undefined"];

pub struct TitleScrubber {
    html_tag: Regex,
    url: Regex,
    spaces: Regex,
}

impl TitleScrubber {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            html_tag: Regex::new(r"<[^>]*>")?,
            url: Regex::new(r"(?i)\b(?:https?://|www\.)\S+")?,
            spaces: Regex::new(r"\s+")?,
        })
    }

    /// Strip markup, links, "|"-suffixes and boilerplate.  Empty result is `None`.
    pub fn normalize(&self, raw: &str) -> Option<String> {
        let text = self.html_tag.replace_all(raw, " ");
        let text = self.url.replace_all(&text, " ");
        let text = match text.find('|') {
            Some(idx) => &text[..idx],
            None => &text[..],
        };
        let text = self.spaces.replace_all(text, " ");
        let mut text = text.trim();

        for prefix in BOILERPLATE_PREFIXES {
            let head = text.get(..prefix.len()).unwrap_or_default();
            if head.eq_ignore_ascii_case(prefix) {
                text = text[prefix.len()..].trim();
            }
        }

        let text = text.trim_matches(|c: char| c == '-' || c.is_whitespace());
        if text.is_empty() || PLACEHOLDER_TITLES.iter().any(|p| text.eq_ignore_ascii_case(p)) {
            return None;
        }
        Some(text.to_string())
    }
}

/// Phrases that mark a programme or station identifier rather than a song.
const STATION_PHRASES: &[&str] = &[
    "live stream",
    "livestream",
    "24/7",
    "on air",
    "morning show",
    "breakfast",
    "drive time",
    "drivetime",
    "late night",
    "overnight",
    "afternoon show",
    "evening show",
    "non-stop",
];

/// Single words that mark a station identifier.
const STATION_WORDS: &[&str] = &["radio", "fm"];

/// Whether `title` reads like a station or show name instead of a song.
pub fn looks_like_station_name(title: &str, station_name: &str) -> bool {
    let lower = title.to_lowercase();
    if lower.trim() == station_name.trim().to_lowercase() {
        return true;
    }
    if STATION_PHRASES.iter().any(|p| lower.contains(p)) {
        return true;
    }
    lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| STATION_WORDS.contains(&word))
}

/// What a fetched title means for the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TitleUpdate {
    /// Nothing usable; keep showing whatever is shown.
    NoTitle,
    /// Same as the last accepted title.
    Unchanged,
    Changed(String),
}

pub fn classify(title: Option<&str>, station_name: &str, last_known: Option<&str>) -> TitleUpdate {
    let Some(title) = title.map(str::trim).filter(|t| !t.is_empty()) else {
        return TitleUpdate::NoTitle;
    };
    if looks_like_station_name(title, station_name) {
        return TitleUpdate::NoTitle;
    }
    if last_known == Some(title) {
        return TitleUpdate::Unchanged;
    }
    TitleUpdate::Changed(title.to_string())
}

// ── HTTP client ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MetadataClient {
    client: reqwest::Client,
    proxy_base: String,
    scrubber: Arc<TitleScrubber>,
}

impl MetadataClient {
    pub fn new(proxy_base: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("airwave/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            proxy_base: proxy_base.into(),
            scrubber: Arc::new(TitleScrubber::new()?),
        })
    }

    pub async fn try_fetch(&self, stream_url: &str) -> Result<NowPlaying, MetadataError> {
        let response = self
            .client
            .get(&self.proxy_base)
            .query(&[("url", stream_url)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MetadataError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        let parsed: ProxyResponse = serde_json::from_slice(&body)?;
        if !parsed.success {
            return Err(MetadataError::Unsuccessful);
        }

        let title = if parsed.is_station_name {
            None
        } else {
            parsed.title.as_deref().and_then(|t| self.scrubber.normalize(t))
        };
        let (bitrate, format) = match &parsed.quality {
            Some(q) => (value_text(q.bitrate.as_ref()), value_text(q.format.as_ref())),
            None => (None, None),
        };

        Ok(NowPlaying {
            title,
            bitrate,
            format,
        })
    }
}

impl MetadataSource for MetadataClient {
    async fn fetch_now_playing(&self, stream_url: &str) -> Option<NowPlaying> {
        match self.try_fetch(stream_url).await {
            Ok(np) => Some(np),
            Err(MetadataError::Unsuccessful) => {
                debug!("metadata: no result for {}", stream_url);
                None
            }
            Err(e) => {
                warn!("metadata: lookup for {} failed: {}", stream_url, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;

    async fn proxy(Query(params): Query<HashMap<String, String>>) -> axum::response::Response {
        let url = params.get("url").cloned().unwrap_or_default();
        let body = match url.as_str() {
            "https://ok.example/live" => serde_json::json!({
                "success": true,
                "title": "<b>Boards of Canada - Roygbiv</b> | via https://ok.example",
                "quality": { "bitrate": 128, "format": "MP3" }
            }),
            "https://ident.example/live" => serde_json::json!({
                "success": true,
                "title": "Ident FM",
                "isStationName": true
            }),
            "https://nothing.example/live" => serde_json::json!({ "success": false }),
            "https://broken.example/live" => {
                return (StatusCode::OK, "{ not json").into_response();
            }
            _ => return StatusCode::BAD_GATEWAY.into_response(),
        };
        axum::Json(body).into_response()
    }

    async fn spawn_proxy() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/metadata", get(proxy));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/metadata", addr)
    }

    fn client(base: String) -> MetadataClient {
        MetadataClient::new(base, Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_normalizes_title_and_quality() {
        let c = client(spawn_proxy().await);
        let np = c.fetch_now_playing("https://ok.example/live").await.unwrap();
        assert_eq!(np.title.as_deref(), Some("Boards of Canada - Roygbiv"));
        assert_eq!(np.bitrate.as_deref(), Some("128"));
        assert_eq!(np.format.as_deref(), Some("MP3"));
    }

    #[tokio::test]
    async fn test_station_name_flag_blanks_title() {
        let c = client(spawn_proxy().await);
        let np = c.fetch_now_playing("https://ident.example/live").await.unwrap();
        assert!(np.title.is_none());
    }

    #[tokio::test]
    async fn test_failures_map_to_nothing() {
        let c = client(spawn_proxy().await);
        assert!(c.fetch_now_playing("https://nothing.example/live").await.is_none());
        assert!(c.fetch_now_playing("https://broken.example/live").await.is_none());
        assert!(c.fetch_now_playing("https://other.example/live").await.is_none());

        assert!(matches!(
            c.try_fetch("https://other.example/live").await,
            Err(MetadataError::Status(502))
        ));
        assert!(matches!(
            c.try_fetch("https://broken.example/live").await,
            Err(MetadataError::Body(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_proxy_maps_to_nothing() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let c = client(format!("http://{}/metadata", addr));
        assert!(c.fetch_now_playing("https://ok.example/live").await.is_none());
    }

    #[test]
    fn test_normalize() {
        let s = TitleScrubber::new().unwrap();
        assert_eq!(
            s.normalize("Now Playing: Nina Simone - Sinnerman").as_deref(),
            Some("Nina Simone - Sinnerman")
        );
        assert_eq!(
            s.normalize("Artist - Song www.station.example").as_deref(),
            Some("Artist - Song")
        );
        assert_eq!(s.normalize("  <i></i>  "), None);
        assert_eq!(s.normalize("Unknown"), None);
        assert_eq!(s.normalize(" - "), None);
    }

    #[test]
    fn test_station_like_titles() {
        assert!(looks_like_station_name("KEXP 90.3 FM", "KEXP"));
        assert!(looks_like_station_name("Radio Paradise", "RP"));
        assert!(looks_like_station_name("The Morning Show with Jo", "X"));
        assert!(looks_like_station_name("groove salad", "Groove Salad"));
        assert!(!looks_like_station_name("Radiohead - Airbag", "X"));
        assert!(!looks_like_station_name("Boards of Canada - Roygbiv", "X"));
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(None, "S", None), TitleUpdate::NoTitle);
        assert_eq!(classify(Some("  "), "S", None), TitleUpdate::NoTitle);
        assert_eq!(classify(Some("Live Stream"), "S", None), TitleUpdate::NoTitle);
        assert_eq!(classify(Some("A - B"), "S", Some("A - B")), TitleUpdate::Unchanged);
        assert_eq!(
            classify(Some("A - C"), "S", Some("A - B")),
            TitleUpdate::Changed("A - C".into())
        );
    }
}
