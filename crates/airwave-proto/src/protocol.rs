use serde::{Deserialize, Serialize};

use crate::prefs::Preferences;
use crate::recent::RecentEntry;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Play { name: String },
    Stop,
    Next,
    Prev,
    Random,
    TogglePause,
    Volume { value: f32 },
    SetTheme { theme: Theme },
    SetAccentColor { color: AccentColor },
    SetVisibility { visibility: Visibility },
    GetState,
}

/// Messages sent from the daemon to clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: PlayerState,
    },
    State {
        data: PlayerState,
    },
    /// The displayed "now playing" title changed for `station`.
    NowPlaying {
        station: String,
        title: Option<String>,
    },
    /// One-shot user-facing notice (e.g. the stream could not be played).
    Alert {
        message: String,
    },
    Log {
        message: String,
    },
}

/// Controller state as seen by clients.
///
/// `Loading` covers both "buffering after a switch" and a station restored
/// from preferences that has not been started yet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle,
    Loading,
    Playing,
    /// Transport failed; a retry is pending.
    Stalled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccentColor {
    #[default]
    Blue,
    Green,
    Yellow,
    Red,
}

/// Whether any presentation surface is in the foreground.  Metadata checks
/// back off while backgrounded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Foreground,
    Background,
}

impl std::str::FromStr for Theme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dark" => Ok(Theme::Dark),
            "light" => Ok(Theme::Light),
            other => anyhow::bail!("unknown theme '{}'", other),
        }
    }
}

impl std::str::FromStr for AccentColor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blue" => Ok(AccentColor::Blue),
            "green" => Ok(AccentColor::Green),
            "yellow" => Ok(AccentColor::Yellow),
            "red" => Ok(AccentColor::Red),
            other => anyhow::bail!("unknown accent color '{}'", other),
        }
    }
}

impl std::str::FromStr for Visibility {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "foreground" | "visible" => Ok(Visibility::Foreground),
            "background" | "hidden" => Ok(Visibility::Background),
            other => anyhow::bail!("unknown visibility '{}'", other),
        }
    }
}

/// Health of the mpv process as observed by the daemon.
///
/// Transitions:
///   Absent -> Starting -> Running -> Dead -> Starting ...
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum MpvHealth {
    /// mpv process does not exist yet (before first use).
    #[default]
    Absent,
    /// Process is spawning / socket not yet available.
    Starting,
    /// Socket connected, IPC responding normally.
    Running,
    /// Process exited or socket closed.
    Dead,
}

/// Full state of the player.  `rev` is a monotonically increasing counter
/// incremented every time the state changes.  Clients can use it to detect
/// missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlayerState {
    /// Monotonic revision counter, incremented on every state change.
    #[serde(default)]
    pub rev: u64,
    pub stations: Vec<Station>,
    /// Name of the station owning the current playback session.
    pub current_station: Option<String>,
    /// Generation of the current playback session (0 = none yet).
    #[serde(default)]
    pub generation: u64,
    pub status: PlaybackStatus,
    #[serde(default)]
    pub is_paused: bool,
    /// What the presentation layer shows: the song title when one is known,
    /// otherwise the bare station name.
    pub display_title: Option<String>,
    /// Last accepted song title for the current session.
    pub now_playing: Option<String>,
    pub volume: f32,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub preferences: Preferences,
    #[serde(default)]
    pub recently_played: Vec<RecentEntry>,
    #[serde(default)]
    pub mpv_health: MpvHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Station {
    /// Unique display key.
    pub name: String,
    #[serde(rename = "link")]
    pub stream_url: String,
    /// Genre tags, deduplicated, in catalog order.
    #[serde(default)]
    pub genres: Vec<String>,
    /// Filled in from now-playing quality info when the proxy reports it.
    #[serde(default)]
    pub bitrate: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
}

impl Station {
    pub fn new(name: impl Into<String>, stream_url: impl Into<String>, genre: &str) -> Self {
        Self {
            name: name.into(),
            stream_url: stream_url.into(),
            genres: split_genres(genre),
            bitrate: None,
            format: None,
        }
    }

    /// Genre tags joined back into the comma-separated catalog form.
    pub fn genre_line(&self) -> String {
        self.genres.join(", ")
    }

    pub fn has_genre(&self, genre: &str) -> bool {
        self.genres.iter().any(|g| g.eq_ignore_ascii_case(genre))
    }
}

/// Split a comma-separated genre list into trimmed, case-insensitively
/// deduplicated tags.
pub fn split_genres(genre: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in genre.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if !tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            tags.push(tag.to_string());
        }
    }
    tags
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

/// Largest body a peer may declare.  Anything bigger is treated as a
/// corrupt stream rather than buffered.
pub const MAX_FRAME_LEN: usize = 1 << 20;

impl Message {
    /// Declared body length of the frame at the start of `data`, once the
    /// 4-byte header is available.
    pub fn frame_len(data: &[u8]) -> Option<usize> {
        let header: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(header) as usize)
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        let Some(len) = Self::frame_len(data) else {
            anyhow::bail!("Insufficient data for length header");
        };
        if len > MAX_FRAME_LEN {
            anyhow::bail!("Frame of {} bytes exceeds limit", len);
        }
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_encode_decode() {
        let msg = Message::Command(Command::Play {
            name: "Groove Salad".into(),
        });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::Play { name }) => assert_eq!(name, "Groove Salad"),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let encoded = Message::Command(Command::Stop).encode().unwrap();
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(Message::decode(&encoded[..2]).is_err());
        assert_eq!(Message::frame_len(&encoded[..2]), None);
        assert_eq!(Message::frame_len(&encoded), Some(encoded.len() - 4));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut frame = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        frame.resize(4 + MAX_FRAME_LEN + 1, b' ');
        let err = Message::decode(&frame).unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[test]
    fn test_hello_carries_state() {
        let state = PlayerState {
            rev: 42,
            status: PlaybackStatus::Playing,
            ..Default::default()
        };
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            daemon_rev: 42,
            state,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                daemon_rev,
                state,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(daemon_rev, 42);
                assert_eq!(state.status, PlaybackStatus::Playing);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_station_wire_uses_link_key() {
        let station = Station::new("KEXP", "https://kexp.example/stream", "indie, rock");
        let json = serde_json::to_value(&station).unwrap();
        assert_eq!(json["link"], "https://kexp.example/stream");
        assert!(json.get("stream_url").is_none());
    }

    #[test]
    fn test_split_genres_trims_and_dedups() {
        assert_eq!(
            split_genres(" jazz, Lounge ,,JAZZ, soul "),
            vec!["jazz", "Lounge", "soul"]
        );
        assert!(split_genres("").is_empty());
    }

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(serde_json::to_string(&Theme::Light).unwrap(), "\"light\"");
        assert_eq!(serde_json::to_string(&AccentColor::Yellow).unwrap(), "\"yellow\"");
        assert_eq!("RED".parse::<AccentColor>().unwrap(), AccentColor::Red);
        assert_eq!("hidden".parse::<Visibility>().unwrap(), Visibility::Background);
        assert!("purple".parse::<AccentColor>().is_err());
    }
}
