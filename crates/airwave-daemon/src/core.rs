/// DaemonCore: single-owner event loop for playback state.
///
/// Every input (client commands, transport events, finished play attempts,
/// finished metadata lookups, refresh ticks, retry timers) arrives as a
/// `DaemonEvent` and is applied here in order.  Anything that has to wait
/// runs in a spawned task that only posts an event back, tagged with the
/// generation of the session that issued it.  Results whose generation or
/// station no longer match the current session are dropped.
use std::sync::Arc;

use airwave_proto::config::Config;
use airwave_proto::protocol::{
    Command, MpvHealth, PlaybackStatus, Station, Visibility,
};
use airwave_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metadata::{classify, MetadataSource, NowPlaying, TitleUpdate};
use crate::refresh::{self, RefreshPolicy};
use crate::transport::{Transport, TransportEvent};
use crate::BroadcastMessage;

/// All inputs into the DaemonCore loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from a socket or HTTP client.
    ClientCommand(Command),
    Transport(TransportEvent),
    PlayAttemptFinished {
        generation: u64,
        station: String,
        result: Result<(), String>,
    },
    RetryPlay {
        generation: u64,
        station: String,
        /// Load the source again instead of only asking it to play.
        reload: bool,
    },
    RefreshTick {
        generation: u64,
    },
    MetadataFetched {
        generation: u64,
        station: String,
        result: Option<NowPlaying>,
    },
    ClientCountChanged(usize),
    Shutdown,
}

/// The current playback session.  Replaced on every station switch.
struct Session {
    station: Station,
    generation: u64,
    last_known_title: Option<String>,
    last_check: Option<Instant>,
    /// False for a session restored at startup until the user starts it.
    autoplay: bool,
    fetch_in_flight: bool,
    retry_pending: bool,
    alerted: bool,
    /// The source loaded for this session reported ready.  Pause changes
    /// before that come from loading, not from the listener.
    ready: bool,
}

impl Session {
    fn new(station: Station, generation: u64, autoplay: bool) -> Self {
        Self {
            station,
            generation,
            last_known_title: None,
            last_check: None,
            autoplay,
            fetch_in_flight: false,
            retry_pending: false,
            alerted: false,
            ready: false,
        }
    }
}

pub struct DaemonCore<T: Transport, M: MetadataSource> {
    state_manager: Arc<StateManager>,
    transport: T,
    metadata: Arc<M>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    policy: RefreshPolicy,
    retry_backoff: Duration,
    /// Last generation handed out; bumped by every switch and stop.
    generation: u64,
    session: Option<Session>,
    /// Loads issued whose `Started` has not arrived yet.  While non-zero,
    /// readiness and errors belong to a source that was replaced.
    pending_starts: u32,
    ticker: Option<CancellationToken>,
    status: PlaybackStatus,
    paused: bool,
    visibility: Visibility,
    mpv_health: MpvHealth,
    last_broadcast_rev: u64,
}

impl<T: Transport, M: MetadataSource> DaemonCore<T, M> {
    pub fn new(
        config: &Config,
        state_manager: Arc<StateManager>,
        transport: T,
        metadata: Arc<M>,
        event_tx: mpsc::Sender<DaemonEvent>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        Self {
            state_manager,
            transport,
            metadata,
            event_tx,
            broadcast_tx,
            policy: RefreshPolicy::from_config(&config.metadata),
            retry_backoff: config.playback.retry_backoff(),
            generation: 0,
            session: None,
            pending_starts: 0,
            ticker: None,
            status: PlaybackStatus::Idle,
            paused: false,
            // No client is connected yet.
            visibility: Visibility::Background,
            mpv_health: MpvHealth::Absent,
            last_broadcast_rev: 0,
        }
    }

    /// Run until `Shutdown` or until every event sender is gone.
    pub async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<DaemonEvent>,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");
        self.state_manager.set_visibility(self.visibility).await;
        self.restore_last_station().await;
        self.publish_state().await;

        loop {
            let evt = tokio::select! {
                evt = event_rx.recv() => match evt {
                    Some(evt) => evt,
                    None => {
                        info!("DaemonCore: event channel closed, shutting down");
                        break;
                    }
                },
                Some(evt) = transport_rx.recv() => DaemonEvent::Transport(evt),
            };

            if matches!(evt, DaemonEvent::Shutdown) {
                info!("DaemonCore: shutdown requested");
                break;
            }
            self.handle_event(evt).await;
            self.publish_state().await;
        }

        self.dispose().await;
        Ok(())
    }

    async fn handle_event(&mut self, evt: DaemonEvent) {
        match evt {
            DaemonEvent::ClientCommand(cmd) => {
                info!("DaemonCore: command {:?}", cmd);
                if let Err(e) = self.handle_command(cmd).await {
                    error!("DaemonCore: command error: {:#}", e);
                }
            }
            DaemonEvent::Transport(evt) => self.handle_transport_event(evt).await,
            DaemonEvent::PlayAttemptFinished {
                generation,
                station,
                result,
            } => self.on_play_attempt(generation, &station, result).await,
            DaemonEvent::RetryPlay {
                generation,
                station,
                reload,
            } => self.on_retry(generation, &station, reload).await,
            DaemonEvent::RefreshTick { generation } => {
                if generation == self.generation {
                    self.check_metadata(false);
                } else {
                    debug!("refresh: tick from generation {} ignored", generation);
                }
            }
            DaemonEvent::MetadataFetched {
                generation,
                station,
                result,
            } => self.on_metadata(generation, &station, result).await,
            DaemonEvent::ClientCountChanged(count) => {
                let visibility = if count == 0 {
                    Visibility::Background
                } else {
                    Visibility::Foreground
                };
                self.set_visibility(visibility).await;
            }
            DaemonEvent::Shutdown => {}
        }
    }

    // ── commands ──────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        match cmd {
            Command::Play { name } => {
                let station = self
                    .state_manager
                    .station(&name)
                    .await
                    .ok_or_else(|| anyhow::anyhow!("unknown station '{}'", name))?;
                self.select_station(station).await;
            }
            Command::Stop => self.stop().await,
            Command::Next => self.step(1).await,
            Command::Prev => self.step(-1).await,
            Command::Random => {
                if let Some(station) = self.state_manager.random_station().await {
                    self.select_station(station).await;
                }
            }
            Command::TogglePause => self.toggle_pause().await?,
            Command::Volume { value } => {
                let volume = self.state_manager.set_volume(value).await?;
                self.transport.set_volume(volume).await?;
            }
            Command::SetTheme { theme } => self.state_manager.set_theme(theme).await?,
            Command::SetAccentColor { color } => {
                self.state_manager.set_accent_color(color).await?
            }
            Command::SetVisibility { visibility } => self.set_visibility(visibility).await,
            Command::GetState => {
                // Force a fresh State broadcast even without changes.
                self.last_broadcast_rev = 0;
            }
        }
        Ok(())
    }

    async fn step(&mut self, offset: isize) {
        let current = self.session.as_ref().map(|s| s.station.name.clone());
        if let Some(station) = self.state_manager.neighbor(current.as_deref(), offset).await {
            self.select_station(station).await;
        }
    }

    /// Start a new session for `station`.  Everything issued for earlier
    /// sessions becomes stale from here on.
    pub async fn select_station(&mut self, station: Station) {
        self.generation += 1;
        let generation = self.generation;
        self.cancel_ticker();
        info!("DaemonCore: selecting '{}' (generation {})", station.name, generation);

        self.session = Some(Session::new(station.clone(), generation, true));
        self.paused = false;
        self.status = PlaybackStatus::Loading;
        if let Err(e) = self.state_manager.begin_session(&station, generation).await {
            warn!("DaemonCore: could not persist history: {:#}", e);
        }

        if let Err(e) = self.transport.stop().await {
            debug!("DaemonCore: transport stop before load failed: {}", e);
        }
        if let Err(e) = self.load_source(&station.stream_url).await {
            self.stall(format!("{:#}", e), true).await;
        }
    }

    /// Hand the session's source to the transport.
    async fn load_source(&mut self, url: &str) -> anyhow::Result<()> {
        if let Some(session) = self.session.as_mut() {
            session.ready = false;
        }
        self.transport.load(url).await?;
        self.pending_starts += 1;
        Ok(())
    }

    async fn stop(&mut self) {
        self.generation += 1;
        self.cancel_ticker();
        self.session = None;
        self.paused = false;
        self.status = PlaybackStatus::Idle;
        info!("DaemonCore: stopping playback");
        if let Err(e) = self.transport.stop().await {
            warn!("DaemonCore: transport stop failed: {}", e);
        }
        self.state_manager.set_stopped(self.generation).await;
    }

    async fn toggle_pause(&mut self) -> anyhow::Result<()> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        if !session.autoplay {
            // Restored at startup and never started: this is the first play.
            let station = session.station.clone();
            self.select_station(station).await;
            return Ok(());
        }

        let paused = !self.paused;
        self.transport.set_pause(paused).await?;
        self.set_paused(paused).await;
        Ok(())
    }

    async fn set_paused(&mut self, paused: bool) {
        if paused == self.paused {
            return;
        }
        debug!("DaemonCore: paused {} -> {}", self.paused, paused);
        self.paused = paused;
        self.state_manager.set_paused(paused).await;
        if !paused && self.status == PlaybackStatus::Playing {
            self.check_metadata(true);
        }
    }

    async fn set_visibility(&mut self, visibility: Visibility) {
        if visibility == self.visibility {
            return;
        }
        info!("DaemonCore: visibility {:?} -> {:?}", self.visibility, visibility);
        self.visibility = visibility;
        self.state_manager.set_visibility(visibility).await;
        if visibility == Visibility::Foreground && self.status == PlaybackStatus::Playing {
            self.check_metadata(false);
        }
    }

    // ── transport ─────────────────────────────────────────────────────────────

    async fn handle_transport_event(&mut self, evt: TransportEvent) {
        debug!("DaemonCore: transport {:?} while {:?}", evt, self.status);
        match evt {
            TransportEvent::Started => {
                self.pending_starts = self.pending_starts.saturating_sub(1);
            }
            TransportEvent::ReadyToPlay => {
                if self.pending_starts > 0 {
                    debug!("DaemonCore: readiness of a replaced source ignored");
                    return;
                }
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                if !session.autoplay {
                    return;
                }
                session.ready = true;
                let (generation, station) = (session.generation, session.station.name.clone());
                if matches!(self.status, PlaybackStatus::Loading | PlaybackStatus::Stalled) {
                    self.spawn_play_attempt(generation, station);
                }
            }
            TransportEvent::Error(reason) => {
                if self.pending_starts > 0 {
                    debug!("DaemonCore: error from a replaced source ignored: {}", reason);
                    return;
                }
                let active = self.session.as_ref().is_some_and(|s| s.autoplay);
                if active && self.status != PlaybackStatus::Idle {
                    warn!("DaemonCore: transport error: {}", reason);
                    self.stall(reason, true).await;
                }
            }
            TransportEvent::Ended => {
                if self.status == PlaybackStatus::Playing {
                    info!("DaemonCore: source ended, refreshing now playing");
                    self.check_metadata(true);
                }
            }
            TransportEvent::Paused(paused) => {
                let ready = self.session.as_ref().is_some_and(|s| s.ready);
                if ready && matches!(self.status, PlaybackStatus::Playing | PlaybackStatus::Stalled) {
                    self.set_paused(paused).await;
                }
            }
            TransportEvent::Health(health) => {
                let dead = health == MpvHealth::Dead;
                if health != self.mpv_health {
                    info!("DaemonCore: mpv health {:?} -> {:?}", self.mpv_health, health);
                    self.mpv_health = health.clone();
                    self.state_manager.set_mpv_health(health).await;
                }
                if dead {
                    // Nothing more will arrive for loads sent to the old process.
                    self.pending_starts = 0;
                    let active = self.session.as_ref().is_some_and(|s| s.autoplay);
                    if active && self.status != PlaybackStatus::Idle {
                        warn!("DaemonCore: mpv exited during playback");
                        self.stall("player exited".into(), true).await;
                    }
                }
            }
        }
    }

    fn spawn_play_attempt(&self, generation: u64, station: String) {
        let transport = self.transport.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = transport.play().await.map_err(|e| format!("{:#}", e));
            let _ = event_tx
                .send(DaemonEvent::PlayAttemptFinished {
                    generation,
                    station,
                    result,
                })
                .await;
        });
    }

    async fn on_play_attempt(&mut self, generation: u64, station: &str, result: Result<(), String>) {
        if !self.is_current(generation, station) {
            debug!(
                "DaemonCore: stale play result for '{}' (generation {}) dropped",
                station, generation
            );
            return;
        }
        match result {
            Ok(()) => {
                info!("DaemonCore: '{}' playing", station);
                if self.paused {
                    // Playing unpauses the source, whatever was asked while loading.
                    self.paused = false;
                    self.state_manager.set_paused(false).await;
                }
                self.set_status(PlaybackStatus::Playing).await;
                self.check_metadata(true);
                self.arm_ticker();
            }
            Err(reason) => {
                warn!("DaemonCore: play '{}' failed: {}", station, reason);
                self.stall(reason, false).await;
            }
        }
    }

    async fn on_retry(&mut self, generation: u64, station: &str, reload: bool) {
        if !self.is_current(generation, station) {
            debug!(
                "DaemonCore: stale retry for '{}' (generation {}) dropped",
                station, generation
            );
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.retry_pending = false;
        if self.status != PlaybackStatus::Stalled {
            return;
        }

        if reload {
            let url = session.station.stream_url.clone();
            info!("DaemonCore: reloading '{}'", station);
            if let Err(e) = self.load_source(&url).await {
                self.stall(format!("{:#}", e), true).await;
            }
        } else {
            info!("DaemonCore: retrying play of '{}'", station);
            self.spawn_play_attempt(generation, station.to_string());
        }
    }

    /// Mark the session stalled and schedule a retry for the same generation.
    async fn stall(&mut self, reason: String, reload: bool) {
        self.cancel_ticker();
        self.set_status(PlaybackStatus::Stalled).await;

        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.alerted {
            session.alerted = true;
            let _ = self.broadcast_tx.send(BroadcastMessage::Alert(format!(
                "Could not play {}: {}",
                session.station.name, reason
            )));
        }
        if session.retry_pending {
            return;
        }
        session.retry_pending = true;

        let generation = session.generation;
        let station = session.station.name.clone();
        let backoff = self.retry_backoff;
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = event_tx
                .send(DaemonEvent::RetryPlay {
                    generation,
                    station,
                    reload,
                })
                .await;
        });
    }

    async fn set_status(&mut self, status: PlaybackStatus) {
        if status == self.status {
            return;
        }
        info!("DaemonCore: status {:?} -> {:?}", self.status, status);
        self.status = status;
        self.state_manager.set_status(status).await;
    }

    // ── now playing ───────────────────────────────────────────────────────────

    /// Issue a lookup for the current session.  Unforced checks respect the
    /// cooldown and do not stack on a lookup that is still running.
    fn check_metadata(&mut self, force: bool) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let now = Instant::now();
        if !force {
            if session.fetch_in_flight {
                debug!("refresh: lookup already in flight for '{}'", session.station.name);
                return;
            }
            if !self.policy.is_due(session.last_check, now, self.visibility) {
                debug!("refresh: '{}' checked recently, skipping", session.station.name);
                return;
            }
        }
        session.last_check = Some(now);
        session.fetch_in_flight = true;

        let generation = session.generation;
        let station = session.station.name.clone();
        let url = session.station.stream_url.clone();
        let metadata = Arc::clone(&self.metadata);
        let event_tx = self.event_tx.clone();
        debug!("refresh: looking up '{}' (force={})", station, force);
        tokio::spawn(async move {
            let result = metadata.fetch_now_playing(&url).await;
            let _ = event_tx
                .send(DaemonEvent::MetadataFetched {
                    generation,
                    station,
                    result,
                })
                .await;
        });
    }

    async fn on_metadata(&mut self, generation: u64, station: &str, result: Option<NowPlaying>) {
        if !self.is_current(generation, station) {
            debug!(
                "refresh: stale lookup for '{}' (generation {}) dropped",
                station, generation
            );
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.fetch_in_flight = false;

        let Some(np) = result else {
            return;
        };
        let update = classify(
            np.title.as_deref(),
            &session.station.name,
            session.last_known_title.as_deref(),
        );
        if let TitleUpdate::Changed(title) = &update {
            session.last_known_title = Some(title.clone());
        }

        self.state_manager
            .set_quality(station, np.bitrate.as_deref(), np.format.as_deref())
            .await;

        match update {
            TitleUpdate::Changed(title) => {
                info!("refresh: '{}' now playing '{}'", station, title);
                self.state_manager.set_now_playing(&title).await;
                let _ = self.broadcast_tx.send(BroadcastMessage::NowPlaying {
                    station: station.to_string(),
                    title: Some(title),
                });
            }
            TitleUpdate::Unchanged => debug!("refresh: '{}' title unchanged", station),
            TitleUpdate::NoTitle => debug!("refresh: '{}' has no usable title", station),
        }
    }

    fn arm_ticker(&mut self) {
        self.cancel_ticker();
        let token = CancellationToken::new();
        refresh::spawn_ticker(
            self.generation,
            self.policy.period,
            self.event_tx.clone(),
            token.clone(),
        );
        self.ticker = Some(token);
    }

    fn cancel_ticker(&mut self) {
        if let Some(token) = self.ticker.take() {
            token.cancel();
        }
    }

    // ── lifecycle ─────────────────────────────────────────────────────────────

    fn is_current(&self, generation: u64, station: &str) -> bool {
        generation == self.generation
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.generation == generation && s.station.name == station)
    }

    /// Show the last station from preferences as loading, without touching
    /// the transport.  A station that left the catalog is forgotten.
    async fn restore_last_station(&mut self) {
        let Some(snapshot) = self.state_manager.last_station().await else {
            return;
        };
        let catalog = self.state_manager.catalog().await;
        let station = catalog
            .find(&snapshot.name)
            .or_else(|| catalog.find_by_link(&snapshot.link))
            .cloned();

        let Some(station) = station else {
            info!("DaemonCore: last station '{}' no longer listed", snapshot.name);
            if let Err(e) = self.state_manager.forget_last_station().await {
                warn!("DaemonCore: could not clear last station: {:#}", e);
            }
            return;
        };

        self.generation += 1;
        info!("DaemonCore: restored '{}' (not started)", station.name);
        self.state_manager.restore_session(&station, self.generation).await;
        self.session = Some(Session::new(station, self.generation, false));
        self.status = PlaybackStatus::Loading;
    }

    async fn publish_state(&mut self) {
        let rev = self.state_manager.get_state().await.rev;
        if rev != self.last_broadcast_rev {
            self.last_broadcast_rev = rev;
            let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
        }
    }

    async fn dispose(&mut self) {
        info!("DaemonCore: cleanup");
        self.cancel_ticker();
        self.session = None;
        self.transport.shutdown().await;
    }
}
