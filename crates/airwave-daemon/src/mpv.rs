/// mpv JSON IPC driver.
///
/// ```text
///   MpvDriver::connect()
///         │
///         ├── writer_task   ← MpvRequest via mpsc → one JSON line per command
///         └── reader_task   ← JSON lines from the socket
///                                ├── reply (has request_id) → pending oneshot
///                                └── event / property-change → event channel
/// ```
///
/// Unix uses a domain socket, Windows a named pipe (`\\.\pipe\<name>`).  Both
/// are driven by the same IO tasks.
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// observe_property id for `pause`.
pub const OBS_PAUSE: u64 = 1;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct MpvRequest {
    req_id: u64,
    payload: String,
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// Unsolicited line from mpv (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// `Some((obs_id, data))` for property-change events.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.event_name()? != "property-change" {
            return None;
        }
        let id = self.raw.get("id")?.as_u64()?;
        Some((id, self.raw.get("data").unwrap_or(&Value::Null)))
    }

    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// `reason` of an `end-file` event (eof, stop, quit, error, redirect).
    pub fn end_file_reason(&self) -> Option<&str> {
        if self.event_name()? != "end-file" {
            return None;
        }
        Some(self.raw.get("reason").and_then(Value::as_str).unwrap_or("unknown"))
    }
}

/// Cloneable handle to the writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<MpvRequest>,
    connected: Arc<AtomicBool>,
}

impl MpvHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed) && !self.tx.is_closed()
    }

    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let mut payload = serde_json::to_string(&json!({ "command": command, "request_id": req_id }))?;
        payload.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(MpvRequest {
                req_id,
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    /// Replace the current file.  Playback stays paused until [`MpvHandle::play`].
    pub async fn load(&self, url: &str, volume: f32) -> anyhow::Result<()> {
        self.set_pause(true).await?;
        self.send(json!(["loadfile", url, "replace"])).await?;
        if let Err(e) = self.set_volume(volume).await {
            debug!("mpv: volume after load failed: {}", e);
        }
        Ok(())
    }

    pub async fn play(&self) -> anyhow::Result<()> {
        self.set_pause(false).await
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        let pct = (volume * 100.0).clamp(0.0, 100.0);
        self.send(json!(["set_property", "volume", pct])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    /// Register the property observations.  Needed once per connection.
    pub async fn observe_properties(&self) {
        match self.send(json!(["observe_property", OBS_PAUSE, "pause"])).await {
            Ok(_) => debug!("mpv: observing pause"),
            Err(e) => warn!("mpv: observe_property pause failed: {}", e),
        }
    }
}

/// Owns the mpv child process and the IPC endpoint name.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    pub last_volume: f32,
}

impl MpvDriver {
    pub fn new(volume: f32) -> Self {
        Self {
            socket_name: airwave_proto::platform::mpv_socket_name(),
            process: None,
            last_volume: volume,
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    fn spawn_process(&mut self) -> anyhow::Result<()> {
        let mpv_binary = airwave_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        let volume = (self.last_volume * 100.0).clamp(0.0, 100.0).round() as i64;

        info!("mpv: spawning {}", mpv_binary.display());
        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--quiet")
            .arg(airwave_proto::platform::mpv_socket_arg())
            .arg(format!("--volume={}", volume))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    /// Attach to an mpv already listening on our endpoint, or spawn one.
    pub async fn connect(&mut self, event_tx: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvHandle> {
        if let Some(handle) = self.try_attach(event_tx.clone()).await {
            info!("mpv: attached to existing IPC endpoint");
            return Ok(handle);
        }

        self.kill().await;
        self.spawn_and_connect(event_tx).await
    }

    #[cfg(unix)]
    async fn try_attach(&self, event_tx: mpsc::Sender<MpvEvent>) -> Option<MpvHandle> {
        let stream = tokio::net::UnixStream::connect(&self.socket_name).await.ok()?;
        Some(start_io_tasks(stream, event_tx))
    }

    #[cfg(unix)]
    async fn spawn_and_connect(&mut self, event_tx: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvHandle> {
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;
        self.spawn_process()?;

        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear at {}", socket_path.display());
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = tokio::net::UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        Ok(start_io_tasks(stream, event_tx))
    }

    #[cfg(windows)]
    async fn try_attach(&self, event_tx: mpsc::Sender<MpvEvent>) -> Option<MpvHandle> {
        use tokio::net::windows::named_pipe::ClientOptions;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        let client = ClientOptions::new().open(&pipe_path).ok()?;
        Some(start_io_tasks(client, event_tx))
    }

    #[cfg(windows)]
    async fn spawn_and_connect(&mut self, event_tx: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvHandle> {
        use tokio::net::windows::named_pipe::ClientOptions;

        self.spawn_process()?;
        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                return Ok(start_io_tasks(client, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

/// Split `stream` into reader/writer tasks and return the handle.
pub(crate) fn start_io_tasks<S>(stream: S, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let connected = Arc::new(AtomicBool::new(true));
    let (cmd_tx, cmd_rx) = mpsc::channel::<MpvRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(
        BufReader::new(read_half),
        pending,
        event_tx,
        connected.clone(),
    ));

    MpvHandle {
        tx: cmd_tx,
        connected,
    }
}

/// Map an mpv reply to the command's result.
fn reply_result(val: Value) -> anyhow::Result<Value> {
    match val.get("error").and_then(Value::as_str) {
        Some("success") => Ok(val),
        Some(err) => Err(anyhow::anyhow!("mpv error: {}", err)),
        None => Err(anyhow::anyhow!("mpv error: reply without status")),
    }
}

async fn fail_pending(pending: &PendingMap, reason: &str) {
    for (_, tx) in pending.lock().await.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
    connected: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(Value::as_u64) {
                    match pending.lock().await.remove(&req_id) {
                        Some(tx) => {
                            let _ = tx.send(reply_result(val));
                        }
                        None => debug!("mpv reader: reply for unknown req={}", req_id),
                    }
                } else if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                    debug!("mpv reader: event receiver gone");
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    fail_pending(&pending, "mpv IPC connection closed").await;
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<MpvRequest>, pending: PendingMap)
where
    W: AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can always match the reply.
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: req={} {}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;

    #[test]
    fn test_event_accessors() {
        let change = MpvEvent {
            raw: json!({"event": "property-change", "id": OBS_PAUSE, "name": "pause", "data": true}),
        };
        let (id, data) = change.as_property_change().unwrap();
        assert_eq!(id, OBS_PAUSE);
        assert_eq!(data, &json!(true));
        assert!(change.end_file_reason().is_none());

        let end = MpvEvent {
            raw: json!({"event": "end-file", "reason": "eof"}),
        };
        assert_eq!(end.end_file_reason(), Some("eof"));
        assert!(end.as_property_change().is_none());
    }

    #[test]
    fn test_reply_result() {
        assert!(reply_result(json!({"error": "success", "data": 1})).is_ok());
        let err = reply_result(json!({"error": "property unavailable"})).unwrap_err();
        assert!(err.to_string().contains("property unavailable"));
    }

    #[tokio::test]
    async fn test_replies_and_events_are_routed() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let handle = start_io_tasks(ours, event_tx);

        // Fake mpv: answer every request, then push one event.
        tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(theirs);
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: Value = serde_json::from_str(&line).unwrap();
                let id = req["request_id"].as_u64().unwrap();
                let reply = json!({"request_id": id, "error": "success", "data": null});
                write_half
                    .write_all(format!("{}\n", reply).as_bytes())
                    .await
                    .unwrap();
                let event = json!({"event": "file-loaded"});
                write_half
                    .write_all(format!("{}\n", event).as_bytes())
                    .await
                    .unwrap();
            }
        });

        handle.set_pause(false).await.unwrap();
        let evt = event_rx.recv().await.unwrap();
        assert_eq!(evt.event_name(), Some("file-loaded"));
        assert!(handle.is_connected());
    }

    #[tokio::test]
    async fn test_closed_connection_fails_pending_requests() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (event_tx, _event_rx) = mpsc::channel(8);
        let handle = start_io_tasks(ours, event_tx);
        drop(theirs);

        assert!(handle.stop().await.is_err());
        for _ in 0..10 {
            if !handle.is_connected() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!handle.is_connected());
    }
}
