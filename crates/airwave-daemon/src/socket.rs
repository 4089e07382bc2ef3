use crate::core::DaemonEvent;
use crate::BroadcastMessage;
use airwave_proto::protocol::{Broadcast, Message, MAX_FRAME_LEN, PROTOCOL_VERSION};
use airwave_proto::state::StateManager;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

pub struct ClientHandle {
    pub id: usize,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    clients: Arc<RwLock<Vec<ClientHandle>>>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);
        serve(listener, state_manager, clients, event_tx, broadcast_tx).await;
    })
}

/// Accept loop.  Every connect and disconnect reports the new client count,
/// which the controller turns into foreground/background visibility.
pub async fn serve(
    listener: TcpListener,
    state_manager: Arc<StateManager>,
    clients: Arc<RwLock<Vec<ClientHandle>>>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) {
    let mut client_id = 0usize;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                client_id += 1;
                let id = client_id;

                let client_count = {
                    let mut guard = clients.write().await;
                    guard.push(ClientHandle { id });
                    guard.len()
                };

                let bcast_rx = broadcast_tx.subscribe();
                info!("Client {} connected from {}", id, peer);
                let _ = event_tx
                    .send(DaemonEvent::ClientCountChanged(client_count))
                    .await;

                let sm = state_manager.clone();
                let evt_tx = event_tx.clone();
                let clients_ref = clients.clone();

                tokio::spawn(async move {
                    handle_client(stream, sm, id, evt_tx.clone(), bcast_rx).await;

                    let client_count = {
                        let mut guard = clients_ref.write().await;
                        guard.retain(|c| c.id != id);
                        guard.len()
                    };
                    info!("Client {} disconnected", id);
                    let _ = evt_tx
                        .send(DaemonEvent::ClientCountChanged(client_count))
                        .await;
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    state_manager: Arc<StateManager>,
    client_id: usize,
    event_tx: mpsc::Sender<DaemonEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Hello with the current snapshot on connect
    if let Ok(encoded) = encode_hello(&state_manager).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        while let Some(len) = Message::frame_len(&read_buf) {
                            if len > MAX_FRAME_LEN {
                                warn!("Client {} declared a {} byte frame, closing", client_id, len);
                                return;
                            }
                            if read_buf.len() < 4 + len { break; }

                            // Whole frame present: consume it even if it does not decode.
                            let frame: Vec<u8> = read_buf.drain(..4 + len).collect();
                            match Message::decode(&frame) {
                                Ok((Message::Command(cmd), _)) => {
                                    debug!("Client {} sent command: {:?}", client_id, cmd);

                                    if event_tx.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
                                        warn!("DaemonEvent channel closed");
                                        return;
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => warn!("Client {} sent an invalid frame: {}", client_id, e),
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let encoded = match msg {
                    Ok(BroadcastMessage::StateUpdated) => encode_state(&state_manager).await,
                    Ok(other) => encode_broadcast(other),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        encode_state(&state_manager).await
                    }
                    Err(_) => break,
                };
                if let Ok(encoded) = encoded {
                    if write_half.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

fn encode_broadcast(msg: BroadcastMessage) -> anyhow::Result<Vec<u8>> {
    let broadcast = match msg {
        BroadcastMessage::NowPlaying { station, title } => Broadcast::NowPlaying { station, title },
        BroadcastMessage::Alert(message) => Broadcast::Alert { message },
        BroadcastMessage::Log(message) => Broadcast::Log { message },
        BroadcastMessage::StateUpdated => anyhow::bail!("state updates carry a snapshot"),
    };
    Message::Broadcast(broadcast).encode()
}

async fn encode_hello(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    let rev = state.rev;
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        daemon_rev: rev,
        state,
    })
    .encode()
}

async fn encode_state(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    Message::Broadcast(Broadcast::State { data: state }).encode()
}
