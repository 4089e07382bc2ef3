use crate::asset_cache::AssetCache;
use crate::core::DaemonEvent;
use airwave_proto::catalog::RECENTLY_PLAYED_GENRE;
use airwave_proto::protocol::{Command, PlayerState, Station};
use airwave_proto::state::StateManager;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct HttpState {
    pub state_manager: Arc<StateManager>,
    pub event_tx: mpsc::Sender<DaemonEvent>,
    pub assets: Option<Arc<AssetCache>>,
}

#[derive(Serialize)]
struct VolumeStatus {
    volume: u8,
}

#[derive(Deserialize)]
struct GenreQuery {
    genre: Option<String>,
}

#[derive(Deserialize)]
struct AssetQuery {
    url: String,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/play/:name", get(play_station).post(play_station))
        .route("/api/stop", get(stop).post(stop))
        .route("/api/pause", get(toggle_pause).post(toggle_pause))
        .route("/api/next", get(next_station).post(next_station))
        .route("/api/prev", get(prev_station).post(prev_station))
        .route("/api/random", get(random_station).post(random_station))
        .route("/api/volume/:volume", get(set_volume).post(set_volume))
        .route("/api/volume", get(get_volume))
        .route("/api/theme/:theme", get(set_theme).post(set_theme))
        .route("/api/accent/:color", get(set_accent).post(set_accent))
        .route(
            "/api/visibility/:visibility",
            get(set_visibility).post(set_visibility),
        )
        .route("/api/genres", get(get_genres))
        .route("/api/stations", get(get_stations))
        .route("/api/recent", get(get_recent))
        .route("/api/asset", get(get_asset))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state: HttpState,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn send(state: &HttpState, cmd: Command) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    if state.event_tx.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
        error!("Failed to forward HTTP command");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

async fn get_state(State(state): State<HttpState>) -> Json<PlayerState> {
    Json(state.state_manager.get_state().await)
}

async fn play_station(State(state): State<HttpState>, Path(name): Path<String>) -> StatusCode {
    if state.state_manager.station(&name).await.is_none() {
        return StatusCode::NOT_FOUND;
    }
    send(&state, Command::Play { name }).await
}

async fn stop(State(state): State<HttpState>) -> StatusCode {
    send(&state, Command::Stop).await
}

async fn toggle_pause(State(state): State<HttpState>) -> StatusCode {
    send(&state, Command::TogglePause).await
}

async fn next_station(State(state): State<HttpState>) -> StatusCode {
    send(&state, Command::Next).await
}

async fn prev_station(State(state): State<HttpState>) -> StatusCode {
    send(&state, Command::Prev).await
}

async fn random_station(State(state): State<HttpState>) -> StatusCode {
    send(&state, Command::Random).await
}

async fn set_volume(State(state): State<HttpState>, Path(volume): Path<i32>) -> StatusCode {
    let value = (volume as f32 / 100.0).clamp(0.0, 1.0);
    send(&state, Command::Volume { value }).await
}

async fn get_volume(State(state): State<HttpState>) -> Json<VolumeStatus> {
    let daemon_state = state.state_manager.get_state().await;
    let volume = (daemon_state.volume * 100.0).round() as u8;
    Json(VolumeStatus { volume })
}

async fn set_theme(State(state): State<HttpState>, Path(theme): Path<String>) -> StatusCode {
    match theme.parse() {
        Ok(theme) => send(&state, Command::SetTheme { theme }).await,
        Err(_) => StatusCode::BAD_REQUEST,
    }
}

async fn set_accent(State(state): State<HttpState>, Path(color): Path<String>) -> StatusCode {
    match color.parse() {
        Ok(color) => send(&state, Command::SetAccentColor { color }).await,
        Err(_) => StatusCode::BAD_REQUEST,
    }
}

async fn set_visibility(
    State(state): State<HttpState>,
    Path(visibility): Path<String>,
) -> StatusCode {
    match visibility.parse() {
        Ok(visibility) => send(&state, Command::SetVisibility { visibility }).await,
        Err(_) => StatusCode::BAD_REQUEST,
    }
}

/// Genre list with the synthetic recently-played genre first.
async fn get_genres(State(state): State<HttpState>) -> Json<Vec<String>> {
    let mut genres = vec![RECENTLY_PLAYED_GENRE.to_string()];
    genres.extend(state.state_manager.catalog().await.genres());
    Json(genres)
}

async fn get_stations(
    State(state): State<HttpState>,
    Query(query): Query<GenreQuery>,
) -> Json<Vec<Station>> {
    let catalog = state.state_manager.catalog().await;
    let stations = match query.genre.as_deref() {
        None => catalog.into_stations(),
        Some(RECENTLY_PLAYED_GENRE) => recent_stations(&state).await,
        Some(genre) => catalog.by_genre(genre).into_iter().cloned().collect(),
    };
    Json(stations)
}

async fn get_recent(State(state): State<HttpState>) -> Json<Vec<Station>> {
    Json(recent_stations(&state).await)
}

async fn recent_stations(state: &HttpState) -> Vec<Station> {
    let snapshot = state.state_manager.get_state().await;
    let recent = airwave_proto::recent::RecentlyPlayed::from_entries(snapshot.recently_played);
    state.state_manager.catalog().await.recently_played(&recent)
}

async fn get_asset(State(state): State<HttpState>, Query(query): Query<AssetQuery>) -> Response {
    let Some(assets) = state.assets.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match assets.fetch(&query.url).await {
        Ok(asset) => ([(header::CONTENT_TYPE, asset.content_type)], asset.bytes).into_response(),
        Err(e) => {
            warn!("HTTP API: asset '{}' unavailable: {:#}", query.url, e);
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airwave_proto::protocol::{Theme, Visibility};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct Setup {
        app: Router,
        events: mpsc::Receiver<DaemonEvent>,
        state: Arc<StateManager>,
        _dir: tempfile::TempDir,
    }

    fn setup() -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateManager::new(
            dir.path().join("prefs.json"),
            vec![
                Station::new("Groove Salad", "https://ice.example/gs", "ambient, chill"),
                Station::new("Indie Pop Rocks", "https://ice.example/ipr", "indie"),
            ],
            0.5,
        ));
        let (event_tx, events) = mpsc::channel(8);
        let app = router(HttpState {
            state_manager: state.clone(),
            event_tx,
            assets: None,
        });
        Setup {
            app,
            events,
            state,
            _dir: dir,
        }
    }

    async fn get(app: &Router, uri: &str) -> Response {
        app.clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn json<T: serde::de::DeserializeOwned>(resp: Response) -> T {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_play_by_name() {
        let mut s = setup();
        let resp = get(&s.app, "/api/play/Groove%20Salad").await;
        assert_eq!(resp.status(), StatusCode::OK);
        match s.events.recv().await {
            Some(DaemonEvent::ClientCommand(Command::Play { name })) => {
                assert_eq!(name, "Groove Salad")
            }
            other => panic!("unexpected event {:?}", other),
        }

        let resp = get(&s.app, "/api/play/Nope").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_preference_routes_validate_input() {
        let mut s = setup();
        assert_eq!(get(&s.app, "/api/theme/light").await.status(), StatusCode::OK);
        assert!(matches!(
            s.events.recv().await,
            Some(DaemonEvent::ClientCommand(Command::SetTheme { theme: Theme::Light }))
        ));

        assert_eq!(get(&s.app, "/api/visibility/hidden").await.status(), StatusCode::OK);
        assert!(matches!(
            s.events.recv().await,
            Some(DaemonEvent::ClientCommand(Command::SetVisibility {
                visibility: Visibility::Background
            }))
        ));

        assert_eq!(
            get(&s.app, "/api/accent/purple").await.status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_volume_percent() {
        let mut s = setup();
        assert_eq!(get(&s.app, "/api/volume/150").await.status(), StatusCode::OK);
        match s.events.recv().await {
            Some(DaemonEvent::ClientCommand(Command::Volume { value })) => assert_eq!(value, 1.0),
            other => panic!("unexpected event {:?}", other),
        }
        let status: serde_json::Value = json(get(&s.app, "/api/volume").await).await;
        assert_eq!(status["volume"], 50);
    }

    #[tokio::test]
    async fn test_genres_and_filtered_stations() {
        let s = setup();
        let genres: Vec<String> = json(get(&s.app, "/api/genres").await).await;
        assert_eq!(genres[0], RECENTLY_PLAYED_GENRE);
        assert!(genres.contains(&"indie".to_string()));

        let stations: Vec<Station> = json(get(&s.app, "/api/stations?genre=chill").await).await;
        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].name, "Groove Salad");
    }

    #[tokio::test]
    async fn test_recent_reflects_history() {
        let s = setup();
        let station = s.state.station("Indie Pop Rocks").await.unwrap();
        s.state.begin_session(&station, 1).await.unwrap();

        let recent: Vec<Station> = json(get(&s.app, "/api/recent").await).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].name, "Indie Pop Rocks");

        let state: PlayerState = json(get(&s.app, "/api/state").await).await;
        assert_eq!(state.current_station.as_deref(), Some("Indie Pop Rocks"));
    }

    #[tokio::test]
    async fn test_asset_without_cache() {
        let s = setup();
        let resp = get(&s.app, "/api/asset?url=https%3A%2F%2Fexample.com%2Flogo.png").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
