//! Audio transport seam.  The controller only sees [`Transport`] and the
//! [`TransportEvent`]s it emits; [`MpvTransport`] backs it with mpv.

use std::future::Future;
use std::sync::Arc;

use airwave_proto::protocol::MpvHealth;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::mpv::{MpvDriver, MpvEvent, MpvHandle, OBS_PAUSE};

/// What the transport reports back to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A requested source began opening.  One per successful `load`.
    Started,
    /// The loaded source can start playing.
    ReadyToPlay,
    /// The source ended on its own.
    Ended,
    Error(String),
    Paused(bool),
    Health(MpvHealth),
}

pub trait Transport: Clone + Send + Sync + 'static {
    /// Replace the current source.  Reported as [`TransportEvent::Started`]
    /// once the source is taken up, then [`TransportEvent::ReadyToPlay`].
    fn load(&self, url: &str) -> impl Future<Output = anyhow::Result<()>> + Send;
    fn play(&self) -> impl Future<Output = anyhow::Result<()>> + Send;
    fn stop(&self) -> impl Future<Output = anyhow::Result<()>> + Send;
    fn set_pause(&self, paused: bool) -> impl Future<Output = anyhow::Result<()>> + Send;
    fn set_volume(&self, volume: f32) -> impl Future<Output = anyhow::Result<()>> + Send;
    fn shutdown(&self) -> impl Future<Output = ()> + Send;
}

/// Translate one mpv event.  `None` for anything the controller does not
/// care about (including `end-file` caused by our own stop/replace).
pub fn transport_event_from_mpv(evt: &MpvEvent) -> Option<TransportEvent> {
    if let Some((id, data)) = evt.as_property_change() {
        return match id {
            OBS_PAUSE => data.as_bool().map(TransportEvent::Paused),
            _ => None,
        };
    }
    if let Some(reason) = evt.end_file_reason() {
        return match reason {
            "eof" => Some(TransportEvent::Ended),
            "error" | "network" | "quit" => {
                let detail = evt
                    .raw
                    .get("file_error")
                    .and_then(|v| v.as_str())
                    .unwrap_or(reason);
                Some(TransportEvent::Error(detail.to_string()))
            }
            _ => None,
        };
    }
    match evt.event_name() {
        Some("start-file") => Some(TransportEvent::Started),
        Some("file-loaded") => Some(TransportEvent::ReadyToPlay),
        _ => None,
    }
}

struct Connection {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
}

/// mpv-backed transport.  mpv is started on first use and restarted when
/// its IPC connection is gone.  Events go out on an unbounded channel so the
/// IPC reader never waits on the controller.
#[derive(Clone)]
pub struct MpvTransport {
    conn: Arc<Mutex<Connection>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl MpvTransport {
    pub fn new(initial_volume: f32, event_tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Connection {
                driver: MpvDriver::new(initial_volume),
                handle: None,
            })),
            event_tx,
        }
    }

    fn report(&self, health: MpvHealth) {
        let _ = self.event_tx.send(TransportEvent::Health(health));
    }

    async fn ensure_handle(&self) -> anyhow::Result<MpvHandle> {
        let mut conn = self.conn.lock().await;
        if let Some(handle) = conn.handle.as_ref().filter(|h| h.is_connected()) {
            return Ok(handle.clone());
        }
        if conn.handle.take().is_some() {
            warn!("transport: mpv connection lost, restarting");
        }

        self.report(MpvHealth::Starting);

        // One forwarder per connection; it ends when the reader task does.
        let (mpv_tx, mut mpv_rx) = mpsc::channel::<MpvEvent>(64);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(evt) = mpv_rx.recv().await {
                debug!("transport: mpv event {:?}", evt.raw);
                if let Some(mapped) = transport_event_from_mpv(&evt) {
                    if event_tx.send(mapped).is_err() {
                        return;
                    }
                }
            }
            let _ = event_tx.send(TransportEvent::Health(MpvHealth::Dead));
        });

        let handle = match conn.driver.connect(mpv_tx).await {
            Ok(h) => h,
            Err(e) => {
                self.report(MpvHealth::Dead);
                return Err(e);
            }
        };
        handle.observe_properties().await;
        info!("transport: mpv ready");
        self.report(MpvHealth::Running);
        conn.handle = Some(handle.clone());
        Ok(handle)
    }

    async fn current_handle(&self) -> Option<MpvHandle> {
        self.conn
            .lock()
            .await
            .handle
            .clone()
            .filter(MpvHandle::is_connected)
    }
}

impl Transport for MpvTransport {
    async fn load(&self, url: &str) -> anyhow::Result<()> {
        let handle = self.ensure_handle().await?;
        let volume = self.conn.lock().await.driver.last_volume;
        handle.load(url, volume).await
    }

    async fn play(&self) -> anyhow::Result<()> {
        self.ensure_handle().await?.play().await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        match self.current_handle().await {
            Some(handle) => handle.stop().await,
            None => Ok(()),
        }
    }

    async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        match self.current_handle().await {
            Some(handle) => handle.set_pause(paused).await,
            None => Ok(()),
        }
    }

    async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        self.conn.lock().await.driver.last_volume = volume;
        match self.current_handle().await {
            Some(handle) => handle.set_volume(volume).await,
            None => Ok(()),
        }
    }

    async fn shutdown(&self) {
        let mut conn = self.conn.lock().await;
        if let Some(handle) = conn.handle.take() {
            let _ = handle.stop().await;
        }
        conn.driver.kill().await;
        info!("transport: mpv shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evt(raw: serde_json::Value) -> MpvEvent {
        MpvEvent { raw }
    }

    #[test]
    fn test_file_loaded_means_ready() {
        assert_eq!(
            transport_event_from_mpv(&evt(json!({"event": "start-file", "playlist_entry_id": 2}))),
            Some(TransportEvent::Started)
        );
        assert_eq!(
            transport_event_from_mpv(&evt(json!({"event": "file-loaded"}))),
            Some(TransportEvent::ReadyToPlay)
        );
    }

    #[test]
    fn test_end_file_reasons() {
        assert_eq!(
            transport_event_from_mpv(&evt(json!({"event": "end-file", "reason": "eof"}))),
            Some(TransportEvent::Ended)
        );
        assert_eq!(
            transport_event_from_mpv(&evt(json!({
                "event": "end-file",
                "reason": "error",
                "file_error": "loading failed"
            }))),
            Some(TransportEvent::Error("loading failed".into()))
        );
        // Our own stop/replace is not an error.
        assert_eq!(
            transport_event_from_mpv(&evt(json!({"event": "end-file", "reason": "stop"}))),
            None
        );
    }

    #[test]
    fn test_pause_property() {
        assert_eq!(
            transport_event_from_mpv(&evt(json!({
                "event": "property-change",
                "id": OBS_PAUSE,
                "name": "pause",
                "data": true
            }))),
            Some(TransportEvent::Paused(true))
        );
        assert_eq!(
            transport_event_from_mpv(&evt(json!({
                "event": "property-change",
                "id": 99,
                "data": 1.0
            }))),
            None
        );
        assert_eq!(transport_event_from_mpv(&evt(json!({"event": "idle"}))), None);
    }
}
