//! The paint server: reliable acceptor, session tasks, room workers.
//!
//! Architecture:
//! ```text
//! Client A ──┐  TCP 6769   ┌──────────────┐
//!            ├────────────► │ session task │──┐
//! Client B ──┘              └──────────────┘  │  mutations + echoes
//!                                             ▼
//! Client A ──┐  UDP 6770+id ┌──────────────┐ Room (layers, users,
//!            ├────────────► │ room worker  │─► subscribers, peers)
//! Client B ──┘   DRAW/LINE  └──────────────┘  │
//!                /CURSOR                      │ dirty-driven
//!                                             ▼
//!                                        canvas.json (60s autosave)
//! ```
//!
//! One task per accepted reliable connection, one per Active room's
//! datagram socket, one acceptor, one autosave loop. All of them reach
//! room state only through the room mutex.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc::{self, UnboundedSender};
use uuid::Uuid;

use crate::brush::BrushCatalog;
use crate::layer::LAYER_BYTES;
use crate::persistence;
use crate::protocol::{Datagram, Frame, MessageType, ProtocolError, DATAGRAM_LEN, FRAME_LEN, SIGNATURE_LEN};
use crate::room::{Room, RoomRegistry};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address and reliable port to bind to.
    pub bind_addr: String,
    /// Persistence document path, conventionally `canvas.json` in the
    /// working directory.
    pub document_path: PathBuf,
    /// Autosave period.
    pub autosave_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:6769".to_string(),
            document_path: PathBuf::from(persistence::DOCUMENT_NAME),
            autosave_interval: Duration::from_secs(60),
        }
    }
}

/// Server startup errors.
#[derive(Debug)]
pub enum ServerError {
    /// The reliable listener could not bind; the process should exit
    /// non-zero.
    Bind(std::io::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(e) => write!(f, "bind failed: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

/// The paint server: owns the room registry and the shared brush
/// catalog; the acceptor and the autosave loop both close over it.
pub struct Server {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    brushes: Arc<BrushCatalog>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Arc::new(RoomRegistry::new()),
            brushes: Arc::new(BrushCatalog::standard()),
        })
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Bind the reliable listener, restore persisted canvases, start the
    /// autosave loop and the acceptor. Returns the bound address as soon
    /// as the server is reachable.
    pub async fn serve(self: &Arc<Self>) -> Result<SocketAddr, ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(ServerError::Bind)?;
        let local = listener.local_addr().map_err(ServerError::Io)?;

        if let Err(e) = persistence::load_all(&self.registry, &self.config.document_path).await {
            log::error!("could not restore {}: {e}", self.config.document_path.display());
        }

        tokio::spawn(persistence::autosave_loop(
            self.registry.clone(),
            self.config.document_path.clone(),
            self.config.autosave_interval,
        ));

        let server = self.clone();
        tokio::spawn(async move {
            server.accept_loop(listener, local).await;
        });

        log::info!(
            "listening on {local} (datagram ports from {})",
            local.port() + 1
        );
        Ok(local)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, local: SocketAddr) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    log::info!("connection from {peer}");
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_session(stream, peer, local).await;
                    });
                }
                Err(e) => {
                    log::warn!("accept failed: {e}");
                }
            }
        }
    }

    /// Bind the room's datagram socket and start its worker, if not
    /// already Active. Returns false when the port cannot be bound, in
    /// which case the login fails and the room stays Created.
    async fn activate_room(&self, room: &Arc<Room>, local: SocketAddr) -> bool {
        // Concurrent first logins race only on the dedicated activation
        // lock; the room state mutex is never held across the bind.
        let _guard = room.activation_guard().await;
        if room.is_active() {
            return true;
        }
        let udp_port = local.port() + 1 + room.id as u16;
        let bind = SocketAddr::new(local.ip(), udp_port);
        let socket = match UdpSocket::bind(bind).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                log::error!("canvas #{}: UDP bind on {bind} failed: {e}", room.id);
                return false;
            }
        };
        room.set_active(socket.clone(), udp_port);
        tokio::spawn(room_worker(room.clone(), socket, self.brushes.clone()));
        log::info!("canvas #{} active on UDP port {udp_port}", room.id);
        true
    }

    async fn handle_session(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, local: SocketAddr) {
        let conn_id = Uuid::new_v4();
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<Vec<u8>>>();

        let write_task = tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if writer.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        let mut joined: Option<(Arc<Room>, u8)> = None;
        let mut buf = [0u8; FRAME_LEN];

        loop {
            if reader.read_exact(&mut buf).await.is_err() {
                break;
            }
            let frame = match Frame::decode(&buf) {
                Ok(frame) => frame,
                Err(ProtocolError::UnknownType(t)) => {
                    log::debug!("{peer}: ignoring unknown message type {t}");
                    continue;
                }
                Err(_) => break,
            };

            match frame.kind {
                MessageType::Login => {
                    if joined.is_some() {
                        continue;
                    }
                    match self.login(conn_id, &frame, &tx, local).await {
                        Some(room) => joined = Some((room, frame.canvas_id)),
                        None => {
                            let _ = tx.send(Arc::new(Frame::error(frame.canvas_id).encode().to_vec()));
                        }
                    }
                }
                MessageType::Logout => {
                    log::info!("{peer}: logout");
                    break;
                }
                MessageType::Save => {
                    if joined.is_some() {
                        match persistence::save_all(&self.registry, &self.config.document_path).await
                        {
                            Ok(written) => log::info!("{peer}: save requested (written: {written})"),
                            Err(e) => log::error!("save failed: {e}"),
                        }
                    }
                }
                MessageType::Signature => {
                    let Some((room, canvas_id)) = &joined else { continue };
                    if frame.data_len as usize != SIGNATURE_LEN {
                        log::debug!("{peer}: signature with bad length {}", frame.data_len);
                        continue;
                    }
                    let state = &mut *room.lock().await;
                    if let Some(uid) = state.set_signature(&conn_id, frame.data) {
                        let echo = Frame::signature(*canvas_id, uid, &frame.data);
                        state.broadcast_frame(&echo, None);
                        log::info!("{peer}: stored signature for uid {uid}");
                    }
                }
                MessageType::LayerAdd => {
                    let Some((room, canvas_id)) = &joined else { continue };
                    let state = &mut *room.lock().await;
                    if let Some((count, index)) = state.add_layer(frame.layer_id) {
                        let mut echo = Frame::layer_add(*canvas_id, index);
                        echo.layer_count = count;
                        state.broadcast_frame(&echo, None);
                        log::info!("canvas #{canvas_id}: layer added at {index} (total {count})");
                    }
                }
                MessageType::LayerDel => {
                    let Some((room, canvas_id)) = &joined else { continue };
                    let state = &mut *room.lock().await;
                    if let Some(count) = state.delete_layer(frame.layer_id) {
                        let mut echo = Frame::layer_del(*canvas_id, frame.layer_id);
                        echo.layer_count = count;
                        state.broadcast_frame(&echo, None);
                        log::info!(
                            "canvas #{canvas_id}: layer {} deleted (remaining {count})",
                            frame.layer_id
                        );
                    }
                }
                MessageType::LayerSync => {
                    let Some((room, _)) = &joined else { break };
                    let mut payload = vec![0u8; LAYER_BYTES];
                    if reader.read_exact(&mut payload).await.is_err() {
                        break;
                    }
                    let state = &mut *room.lock().await;
                    if state.replace_layer(frame.layer_id, &payload) {
                        let mut chunk = Vec::with_capacity(FRAME_LEN + LAYER_BYTES);
                        chunk.extend_from_slice(&buf);
                        chunk.extend_from_slice(&payload);
                        state.broadcast_bytes(Arc::new(chunk), Some(&conn_id));
                        log::info!("{peer}: layer {} synced", frame.layer_id);
                    }
                }
                MessageType::LayerReorder => {
                    let Some((room, _)) = &joined else { continue };
                    let (from, to) = frame.reorder_indices();
                    let state = &mut *room.lock().await;
                    if state.reorder_layer(from, to) {
                        state.broadcast_frame(&frame, None);
                        log::info!("{peer}: layer {from} moved to {to}");
                    }
                }
                MessageType::LayerMove => {
                    let Some((room, _)) = &joined else { continue };
                    let (dx, dy) = frame.move_delta();
                    let state = &mut *room.lock().await;
                    if state.translate_layer(frame.layer_id, dx, dy) {
                        // The sender already applied the translate locally.
                        state.broadcast_frame(&frame, Some(&conn_id));
                        log::info!("{peer}: layer {} translated by ({dx}, {dy})", frame.layer_id);
                    }
                }
                // Stroke traffic belongs on the datagram socket; the rest
                // are server-to-client or reserved.
                MessageType::Welcome
                | MessageType::CanvasData
                | MessageType::Draw
                | MessageType::Cursor
                | MessageType::Line
                | MessageType::Error
                | MessageType::LayerSelect => {}
            }
        }

        if let Some((room, canvas_id)) = joined {
            let mut state = room.lock().await;
            if let Some(user) = state.leave(&conn_id) {
                log::info!(
                    "{peer}: '{}' (uid {}) left canvas #{canvas_id}",
                    user.name,
                    user.room_uid
                );
            }
        }
        write_task.abort();
        log::info!("{peer}: session closed");
    }

    /// Register a login: activate the room, assign a uid, and queue the
    /// welcome reply, the layer stream, and the other users' signatures
    /// in one atomic section.
    async fn login(
        &self,
        conn_id: Uuid,
        frame: &Frame,
        tx: &UnboundedSender<Arc<Vec<u8>>>,
        local: SocketAddr,
    ) -> Option<Arc<Room>> {
        let canvas_id = frame.canvas_id;
        let name = frame.name();
        log::info!("login: '{name}' on canvas #{canvas_id}");

        let room = self.registry.get_or_create(canvas_id).await;
        if !self.activate_room(&room, local).await {
            return None;
        }

        {
            let state = &mut *room.lock().await;
            let (room_uid, layer_count) = state.join(conn_id, name.clone(), tx.clone())?;

            let welcome = Frame::welcome(canvas_id, layer_count, room_uid);
            let mut chunk =
                Vec::with_capacity(FRAME_LEN + 4 + (layer_count as usize - 1) * LAYER_BYTES);
            chunk.extend_from_slice(&welcome.encode());
            chunk.extend_from_slice(&(layer_count as i32).to_le_bytes());
            for layer in &state.layers()[1..] {
                chunk.extend_from_slice(layer.bytes());
            }
            state.send_to(&conn_id, Arc::new(chunk));

            for (uid, signature) in state.signatures_of_others(&conn_id) {
                let forward = Frame::signature(canvas_id, uid, &signature);
                state.send_to(&conn_id, Arc::new(forward.encode().to_vec()));
            }

            log::info!(
                "'{name}' joined canvas #{canvas_id} as uid {room_uid} ({} users)",
                state.subscriber_count()
            );
        }
        Some(room)
    }
}

/// Per-room datagram worker: one blocking receive loop with a 1-second
/// liveness timeout, applying DRAW/LINE strokes and fanning every packet
/// out to the other peers.
async fn room_worker(room: Arc<Room>, socket: Arc<UdpSocket>, brushes: Arc<BrushCatalog>) {
    let canvas_id = room.id;
    log::info!("canvas #{canvas_id}: worker started");
    let mut buf = [0u8; 64];
    let mut drawing: std::collections::HashMap<SocketAddr, bool> = std::collections::HashMap::new();

    while room.is_active() {
        let received =
            match tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf)).await {
                Err(_) => continue, // liveness poll
                Ok(Err(e)) => {
                    log::debug!("canvas #{canvas_id}: recv error: {e}");
                    continue;
                }
                Ok(Ok(received)) => received,
            };
        let (len, from) = received;
        if len < DATAGRAM_LEN {
            continue;
        }
        let Ok(packet) = Datagram::decode(&buf[..len]) else {
            continue;
        };

        let state = &mut *room.lock().await;
        if state.note_peer(from) {
            log::info!("canvas #{canvas_id}: new peer {from} ({} total)", state.peer_count());
        }

        match packet.kind {
            MessageType::Draw => {
                let active = drawing.entry(from).or_insert(false);
                if !*active {
                    *active = true;
                    log::info!(
                        "canvas #{canvas_id}: draw start from {from} (layer {} brush {})",
                        packet.layer_id,
                        packet.brush_id
                    );
                }
                state.stamp(
                    &brushes,
                    packet.brush_id,
                    packet.layer_id,
                    packet.x as i32,
                    packet.y as i32,
                    packet.color,
                    packet.size,
                    packet.pressure,
                    packet.angle(),
                );
                state.rebroadcast_datagram(&socket, &packet, from);
            }
            MessageType::Line => {
                log::debug!(
                    "canvas #{canvas_id}: line ({},{}) -> ({},{}) from {from}",
                    packet.x,
                    packet.y,
                    packet.ex,
                    packet.ey
                );
                state.stroke_line(
                    &brushes,
                    packet.brush_id,
                    packet.layer_id,
                    packet.x as i32,
                    packet.y as i32,
                    packet.ex as i32,
                    packet.ey as i32,
                    packet.color,
                    packet.size,
                    packet.pressure,
                );
                state.rebroadcast_datagram(&socket, &packet, from);
            }
            MessageType::Cursor => {
                if drawing.get(&from).copied().unwrap_or(false) {
                    drawing.insert(from, false);
                    log::info!("canvas #{canvas_id}: draw end from {from}");
                }
                state.rebroadcast_datagram(&socket, &packet, from);
            }
            _ => {}
        }
    }
    log::info!("canvas #{canvas_id}: worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:6769");
        assert_eq!(config.document_path, PathBuf::from("canvas.json"));
        assert_eq!(config.autosave_interval, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_serve_binds_and_reports_addr() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            document_path: dir.path().join("canvas.json"),
            autosave_interval: Duration::from_secs(60),
        });
        let addr = server.serve().await.unwrap();
        assert_ne!(addr.port(), 0);
        // Canvas 0 is seeded when no document exists.
        assert!(server.registry().get(0).await.is_some());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr().unwrap();
        let server = Server::new(ServerConfig {
            bind_addr: addr.to_string(),
            ..ServerConfig::default()
        });
        match server.serve().await {
            Err(ServerError::Bind(_)) => {}
            other => panic!("expected bind error, got {other:?}"),
        }
    }
}
