use crate::catalog::Catalog;
use crate::prefs::{PreferenceStore, StationSnapshot, KEY_VOLUME};
use crate::protocol::{
    AccentColor, MpvHealth, PlaybackStatus, PlayerState, Station, Theme, Visibility,
};
use crate::recent::{RecentEntry, RecentlyPlayed};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

struct Persisted {
    store: PreferenceStore,
    recent: RecentlyPlayed,
}

/// Shared player state plus its persistence.
///
/// Readers (socket, HTTP) take snapshots through [`StateManager::get_state`];
/// only the controller calls the mutating methods.
pub struct StateManager {
    state: Arc<RwLock<PlayerState>>,
    persisted: Mutex<Persisted>,
}

impl StateManager {
    pub fn new(prefs_file: PathBuf, stations: Vec<Station>, default_volume: f32) -> Self {
        let store = PreferenceStore::open(prefs_file);
        let preferences = store.preferences();
        let recent = store.recently_played();
        let volume = store.get(KEY_VOLUME, default_volume).clamp(0.0, 1.0);

        let state = PlayerState {
            rev: 1,
            stations: Catalog::new(stations).into_stations(),
            volume,
            preferences,
            recently_played: recent.entries().to_vec(),
            ..PlayerState::default()
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            persisted: Mutex::new(Persisted { store, recent }),
        }
    }

    pub async fn get_state(&self) -> PlayerState {
        self.state.read().await.clone()
    }

    /// Snapshot of the station list as a catalog (includes quality info
    /// learned so far).
    pub async fn catalog(&self) -> Catalog {
        Catalog::new(self.state.read().await.stations.clone())
    }

    pub async fn station(&self, name: &str) -> Option<Station> {
        self.state
            .read()
            .await
            .stations
            .iter()
            .find(|s| s.name == name)
            .cloned()
    }

    /// Station `offset` positions away from `current` in catalog order,
    /// wrapping around.  Without a current station, starts from the first.
    pub async fn neighbor(&self, current: Option<&str>, offset: isize) -> Option<Station> {
        let state = self.state.read().await;
        let len = state.stations.len();
        if len == 0 {
            return None;
        }
        let idx = match current.and_then(|name| state.stations.iter().position(|s| s.name == name)) {
            Some(i) => (i as isize + offset).rem_euclid(len as isize) as usize,
            None => 0,
        };
        state.stations.get(idx).cloned()
    }

    pub async fn random_station(&self) -> Option<Station> {
        use rand::Rng;

        let state = self.state.read().await;
        if state.stations.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..state.stations.len());
        state.stations.get(idx).cloned()
    }

    /// Last station recorded in preferences, if any.
    pub async fn last_station(&self) -> Option<StationSnapshot> {
        self.state.read().await.preferences.last_station.clone()
    }

    pub async fn forget_last_station(&self) -> anyhow::Result<()> {
        self.state.write().await.preferences.last_station = None;
        let mut persisted = self.persisted.lock().await;
        persisted.store.remove(crate::prefs::KEY_LAST_STATION)
    }

    /// A new playback session for `station`: reset the display to the bare
    /// station name, record the station in history and as last station.
    pub async fn begin_session(&self, station: &Station, generation: u64) -> anyhow::Result<()> {
        let snapshot = StationSnapshot::from(station);
        let recent = {
            let mut persisted = self.persisted.lock().await;
            persisted.recent.push(RecentEntry::from(station));
            persisted.recent.clone()
        };
        {
            let mut state = self.state.write().await;
            state.current_station = Some(station.name.clone());
            state.generation = generation;
            state.status = PlaybackStatus::Loading;
            state.is_paused = false;
            state.display_title = Some(station.name.clone());
            state.now_playing = None;
            state.recently_played = recent.entries().to_vec();
            state.preferences.last_station = Some(snapshot.clone());
            state.rev += 1;
        }
        let mut persisted = self.persisted.lock().await;
        persisted.store.set_recently_played(&recent)?;
        persisted.store.set_last_station(&snapshot)?;
        Ok(())
    }

    /// Session restored from preferences at startup: shown as loading, not
    /// recorded again.
    pub async fn restore_session(&self, station: &Station, generation: u64) {
        let mut state = self.state.write().await;
        state.current_station = Some(station.name.clone());
        state.generation = generation;
        state.status = PlaybackStatus::Loading;
        state.is_paused = false;
        state.display_title = Some(station.name.clone());
        state.now_playing = None;
        state.rev += 1;
    }

    pub async fn set_stopped(&self, generation: u64) {
        let mut state = self.state.write().await;
        state.current_station = None;
        state.generation = generation;
        state.status = PlaybackStatus::Idle;
        state.is_paused = false;
        state.display_title = None;
        state.now_playing = None;
        state.rev += 1;
    }

    pub async fn set_status(&self, status: PlaybackStatus) {
        let mut state = self.state.write().await;
        state.status = status;
        state.rev += 1;
    }

    pub async fn set_paused(&self, paused: bool) {
        let mut state = self.state.write().await;
        state.is_paused = paused;
        state.rev += 1;
    }

    pub async fn set_now_playing(&self, title: &str) {
        let mut state = self.state.write().await;
        state.now_playing = Some(title.to_string());
        state.display_title = Some(title.to_string());
        state.rev += 1;
    }

    /// Record stream quality reported by the metadata proxy.  Returns true
    /// when anything changed.
    pub async fn set_quality(
        &self,
        name: &str,
        bitrate: Option<&str>,
        format: Option<&str>,
    ) -> bool {
        let mut state = self.state.write().await;
        let Some(station) = state.stations.iter_mut().find(|s| s.name == name) else {
            return false;
        };
        let mut changed = false;
        if let Some(b) = bitrate {
            if station.bitrate.as_deref() != Some(b) {
                station.bitrate = Some(b.to_string());
                changed = true;
            }
        }
        if let Some(f) = format {
            if station.format.as_deref() != Some(f) {
                station.format = Some(f.to_string());
                changed = true;
            }
        }
        if changed {
            state.rev += 1;
        }
        changed
    }

    pub async fn set_mpv_health(&self, health: MpvHealth) {
        let mut state = self.state.write().await;
        state.mpv_health = health;
        state.rev += 1;
    }

    pub async fn set_visibility(&self, visibility: Visibility) {
        let mut state = self.state.write().await;
        state.visibility = visibility;
        state.rev += 1;
    }

    pub async fn set_volume(&self, volume: f32) -> anyhow::Result<f32> {
        let volume = volume.clamp(0.0, 1.0);
        {
            let mut state = self.state.write().await;
            state.volume = volume;
            state.rev += 1;
        }
        self.persisted.lock().await.store.set(KEY_VOLUME, &volume)?;
        Ok(volume)
    }

    pub async fn set_theme(&self, theme: Theme) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.preferences.theme = theme;
            state.rev += 1;
        }
        self.persisted.lock().await.store.set_theme(theme)
    }

    pub async fn set_accent_color(&self, color: AccentColor) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.preferences.accent_color = color;
            state.rev += 1;
        }
        self.persisted.lock().await.store.set_accent_color(color)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::PreferenceStore;

    fn stations() -> Vec<Station> {
        vec![
            Station::new("A", "http://a.example/live", "jazz"),
            Station::new("B", "http://b.example/live", "rock, indie"),
            Station::new("C", "http://c.example/live", ""),
        ]
    }

    fn manager(dir: &tempfile::TempDir) -> StateManager {
        StateManager::new(dir.path().join("prefs.json"), stations(), 0.5)
    }

    #[tokio::test]
    async fn test_begin_session_persists_history_and_last_station() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(&dir);
        let b = sm.station("B").await.unwrap();
        sm.begin_session(&b, 3).await.unwrap();

        let state = sm.get_state().await;
        assert_eq!(state.current_station.as_deref(), Some("B"));
        assert_eq!(state.generation, 3);
        assert_eq!(state.status, PlaybackStatus::Loading);
        assert_eq!(state.display_title.as_deref(), Some("B"));
        assert_eq!(state.recently_played[0].genre, "rock, indie");

        let store = PreferenceStore::open(dir.path().join("prefs.json"));
        assert_eq!(store.recently_played().entries()[0].link, "http://b.example/live");
        assert_eq!(store.preferences().last_station.unwrap().name, "B");
    }

    #[tokio::test]
    async fn test_history_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let sm = manager(&dir);
            for name in ["A", "B", "A"] {
                let s = sm.station(name).await.unwrap();
                sm.begin_session(&s, 1).await.unwrap();
            }
        }
        let sm = manager(&dir);
        let names: Vec<String> = sm
            .get_state()
            .await
            .recently_played
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_neighbor_wraps() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(&dir);
        assert_eq!(sm.neighbor(Some("C"), 1).await.unwrap().name, "A");
        assert_eq!(sm.neighbor(Some("A"), -1).await.unwrap().name, "C");
        assert_eq!(sm.neighbor(None, 1).await.unwrap().name, "A");
    }

    #[tokio::test]
    async fn test_set_quality_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(&dir);
        assert!(sm.set_quality("A", Some("128"), Some("mp3")).await);
        assert!(!sm.set_quality("A", Some("128"), None).await);
        assert!(!sm.set_quality("missing", Some("64"), None).await);
        let a = sm.station("A").await.unwrap();
        assert_eq!(a.bitrate.as_deref(), Some("128"));
        assert_eq!(a.format.as_deref(), Some("mp3"));
    }

    #[tokio::test]
    async fn test_rev_increases_on_every_change() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(&dir);
        let before = sm.get_state().await.rev;
        sm.set_theme(Theme::Light).await.unwrap();
        sm.set_volume(2.0).await.unwrap();
        let state = sm.get_state().await;
        assert_eq!(state.rev, before + 2);
        assert_eq!(state.volume, 1.0);
        assert_eq!(state.preferences.theme, Theme::Light);
    }

    #[tokio::test]
    async fn test_forget_last_station() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(&dir);
        let a = sm.station("A").await.unwrap();
        sm.begin_session(&a, 1).await.unwrap();
        sm.forget_last_station().await.unwrap();
        assert!(sm.last_station().await.is_none());
        let store = PreferenceStore::open(dir.path().join("prefs.json"));
        assert!(store.preferences().last_station.is_none());
    }
}
