mod asset_cache;
mod core;
mod http;
mod metadata;
mod mpv;
mod refresh;
mod socket;
mod stations;
mod transport;

use std::sync::Arc;

use airwave_proto::config::Config;
use airwave_proto::platform;
use airwave_proto::state::StateManager;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    /// Displayed title changed for the current station.
    NowPlaying {
        station: String,
        title: Option<String>,
    },
    /// One-shot user-facing notice.
    Alert(String),
    Log(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only WARN and ERROR go to clients
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = String::new();
        let now = chrono::Local::now();
        message.push_str(&format!("{} ", now.format("%H:%M:%S")));
        message.push_str(&format!("[{}] ", level));

        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Broadcast channel first so logging can use it
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("airwave.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,airwave=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());
    platform::set_use_system_mpv(config.mpv.use_system_mpv);

    let stations = stations::load_stations(&config.stations).await;
    let state_manager = Arc::new(StateManager::new(
        config.daemon.prefs_file.clone(),
        stations,
        config.mpv.default_volume,
    ));

    // All external inputs funnel into DaemonCore
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<core::DaemonEvent>(256);
    let (transport_tx, transport_rx) = tokio::sync::mpsc::unbounded_channel();

    let volume = state_manager.get_state().await.volume;
    let transport = transport::MpvTransport::new(volume, transport_tx);
    let metadata = Arc::new(metadata::MetadataClient::new(
        config.metadata.proxy_base.clone(),
        config.metadata.request_timeout(),
    )?);

    let assets = Arc::new(asset_cache::AssetCache::new(
        platform::cache_dir(),
        &config.cache,
    )?);
    {
        let assets = assets.clone();
        let precache = config.cache.precache.clone();
        tokio::spawn(async move {
            if let Err(e) = assets.activate().await {
                warn!("asset cache: activation failed: {:#}", e);
            }
            assets.install(&precache).await;
        });
    }

    let clients = Arc::new(tokio::sync::RwLock::new(Vec::<socket::ClientHandle>::new()));

    let _socket_handle = socket::start_server(
        config.http.bind_address.clone(),
        platform::DAEMON_TCP_PORT,
        state_manager.clone(),
        clients.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            http::HttpState {
                state_manager: state_manager.clone(),
                event_tx: event_tx.clone(),
                assets: Some(assets.clone()),
            },
        );
    }

    {
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received");
                let _ = event_tx.send(core::DaemonEvent::Shutdown).await;
            }
        });
    }

    let daemon_core = core::DaemonCore::new(
        &config,
        state_manager,
        transport,
        metadata,
        event_tx,
        broadcast_tx,
    );

    info!("Daemon initialised, running event loop");
    daemon_core.run(event_rx, transport_rx).await?;

    Ok(())
}
