//! Headless paint client mirroring the server's protocol handling.
//!
//! The client keeps a local copy of the canvas's layer stack and applies
//! its own strokes through the same [`crate::layer::apply_stamp`] /
//! [`crate::layer::apply_line`] entry points the server uses, so local
//! echo and server state agree pixel-for-pixel for every packet.
//!
//! Connection lifecycle:
//! ```text
//! connect() ── LOGIN ──► WELCOME + layer stream ──► local stack
//!     │                                                │
//!     ├── reliable reader task (layer ops, signatures) ┤
//!     └── datagram reader task (DRAW/LINE/CURSOR) ─────┘
//!                              │
//!                              ▼
//!                     CanvasEvent channel
//! ```

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, RwLock};

use crate::brush::BrushCatalog;
use crate::codec::Pixel;
use crate::layer::{self, Layer, LAYER_BYTES};
use crate::protocol::{
    Datagram, Frame, MessageType, ProtocolError, DATAGRAM_LEN, FRAME_LEN, SIGNATURE_LEN,
};
use crate::MAX_LAYERS;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host or address, without port.
    pub server: String,
    /// Reliable port; the datagram port is derived from it and the
    /// canvas id.
    pub port: u16,
    pub canvas_id: u8,
    /// Display name, truncated to 31 bytes on the wire.
    pub name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".to_string(),
            port: 6769,
            canvas_id: 0,
            name: "anonymous".to_string(),
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events surfaced to the application.
#[derive(Debug, Clone)]
pub enum CanvasEvent {
    /// A layer was inserted at `index`; `count` is the new total.
    LayerAdded { index: u8, count: u8 },
    LayerDeleted { index: u8, count: u8 },
    LayerReordered { from: u8, to: u8 },
    /// A full-layer sync replaced layer `index`.
    LayerReplaced { index: u8 },
    LayerMoved { index: u8, dx: i32, dy: i32 },
    /// A remote stamp was applied locally.
    RemoteStamp { layer_id: u8, x: i16, y: i16 },
    RemoteLine { layer_id: u8, x0: i16, y0: i16, x1: i16, y1: i16 },
    RemoteCursor { room_uid: u8, x: i16, y: i16 },
    /// Another user's signature arrived (own echoes are dropped).
    SignatureReceived { room_uid: u8, payload: [u8; SIGNATURE_LEN] },
    Disconnected,
}

/// Client errors.
#[derive(Debug)]
pub enum ClientError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    /// The server refused the login (room not activatable or full).
    Rejected,
    /// The welcome stream was malformed.
    Handshake(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Rejected => write!(f, "login rejected"),
            Self::Handshake(msg) => write!(f, "bad welcome stream: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// A headless participant in one canvas.
pub struct PaintClient {
    canvas_id: u8,
    room_uid: u8,
    layers: Arc<Mutex<Vec<Layer>>>,
    brushes: Arc<BrushCatalog>,
    outgoing: UnboundedSender<Vec<u8>>,
    udp: Arc<UdpSocket>,
    events: Option<UnboundedReceiver<CanvasEvent>>,
    state: Arc<RwLock<ConnectionState>>,
}

impl PaintClient {
    /// Log into a canvas: performs the LOGIN/WELCOME handshake, consumes
    /// the layer stream, binds the datagram socket, and spawns the reader
    /// tasks.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));

        let mut stream =
            TcpStream::connect((config.server.as_str(), config.port)).await?;
        stream
            .write_all(&Frame::login(config.canvas_id, &config.name).encode())
            .await?;

        let mut buf = [0u8; FRAME_LEN];
        stream.read_exact(&mut buf).await?;
        let welcome = Frame::decode(&buf)?;
        match welcome.kind {
            MessageType::Welcome => {}
            MessageType::Error => return Err(ClientError::Rejected),
            other => {
                return Err(ClientError::Handshake(format!("unexpected {other:?} reply")))
            }
        }
        let room_uid = welcome.user_id;

        let mut count_buf = [0u8; 4];
        stream.read_exact(&mut count_buf).await?;
        let layer_count = i32::from_le_bytes(count_buf);
        if !(2..=MAX_LAYERS as i32).contains(&layer_count) {
            return Err(ClientError::Handshake(format!(
                "layer count {layer_count} out of range"
            )));
        }

        let mut layers = Vec::with_capacity(layer_count as usize);
        layers.push(Layer::white());
        for _ in 1..layer_count {
            let mut bitmap = vec![0u8; LAYER_BYTES];
            stream.read_exact(&mut bitmap).await?;
            let mut layer = Layer::transparent();
            layer.replace(&bitmap);
            layers.push(layer);
        }
        log::info!(
            "joined canvas #{} as uid {room_uid} ({layer_count} layers)",
            config.canvas_id
        );

        let udp = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let udp_port = config.port + 1 + config.canvas_id as u16;
        udp.connect((config.server.as_str(), udp_port)).await?;

        let layers = Arc::new(Mutex::new(layers));
        let brushes = Arc::new(BrushCatalog::standard());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let (reader, mut writer) = stream.into_split();
        tokio::spawn(async move {
            while let Some(chunk) = outgoing_rx.recv().await {
                if writer.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });
        tokio::spawn(reliable_reader(
            reader,
            layers.clone(),
            event_tx.clone(),
            room_uid,
            state.clone(),
        ));
        tokio::spawn(datagram_reader(
            udp.clone(),
            layers.clone(),
            brushes.clone(),
            event_tx,
        ));

        *state.write().await = ConnectionState::Connected;

        let client = Self {
            canvas_id: config.canvas_id,
            room_uid,
            layers,
            brushes,
            outgoing,
            udp,
            events: Some(event_rx),
            state,
        };
        // Announce our datagram endpoint so the room worker adds us to
        // its peer set before anyone else draws.
        client.cursor(0, 0).await?;
        Ok(client)
    }

    pub fn canvas_id(&self) -> u8 {
        self.canvas_id
    }

    /// The room uid assigned by the server in WELCOME.
    pub fn room_uid(&self) -> u8 {
        self.room_uid
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Take the event receiver. Yields `None` on the second call.
    pub fn take_events(&mut self) -> Option<UnboundedReceiver<CanvasEvent>> {
        self.events.take()
    }

    pub async fn layer_count(&self) -> u8 {
        self.layers.lock().await.len() as u8
    }

    pub async fn layer_pixel(&self, layer_id: u8, x: i32, y: i32) -> Option<Pixel> {
        self.layers.lock().await.get(layer_id as usize)?.pixel(x, y)
    }

    /// Flatten the local stack for display or export.
    pub async fn composite(&self) -> Vec<u8> {
        layer::composite(&self.layers.lock().await)
    }

    /// Stamp locally and emit the DRAW datagram. `angle` is the stroke
    /// direction in degrees.
    #[allow(clippy::too_many_arguments)]
    pub async fn stamp(
        &self,
        brush_id: u8,
        layer_id: u8,
        x: i16,
        y: i16,
        angle: i16,
        color: Pixel,
        size: u8,
        pressure: u8,
    ) -> Result<(), ClientError> {
        {
            let mut layers = self.layers.lock().await;
            layer::apply_stamp(
                &mut layers,
                &self.brushes,
                brush_id,
                layer_id,
                x as i32,
                y as i32,
                color,
                size,
                pressure,
                angle as i32,
            );
        }
        let packet = Datagram::draw(brush_id, layer_id, x, y, angle, color, size, pressure);
        self.udp.send(&packet.encode()).await?;
        Ok(())
    }

    /// Rasterize a line locally and emit the LINE datagram.
    #[allow(clippy::too_many_arguments)]
    pub async fn stroke_line(
        &self,
        brush_id: u8,
        layer_id: u8,
        x0: i16,
        y0: i16,
        x1: i16,
        y1: i16,
        color: Pixel,
        size: u8,
        pressure: u8,
    ) -> Result<(), ClientError> {
        {
            let mut layers = self.layers.lock().await;
            layer::apply_line(
                &mut layers,
                &self.brushes,
                brush_id,
                layer_id,
                x0 as i32,
                y0 as i32,
                x1 as i32,
                y1 as i32,
                color,
                size,
                pressure,
            );
        }
        let packet = Datagram::line(brush_id, layer_id, x0, y0, x1, y1, color, size, pressure);
        self.udp.send(&packet.encode()).await?;
        Ok(())
    }

    /// Broadcast our cursor position. Best-effort like every datagram.
    pub async fn cursor(&self, x: i16, y: i16) -> Result<(), ClientError> {
        let packet = Datagram::cursor(self.room_uid, x, y);
        self.udp.send(&packet.encode()).await?;
        Ok(())
    }

    /// Request a layer insertion. Applied locally when the echo arrives.
    pub fn add_layer(&self, at: u8) -> Result<(), ClientError> {
        self.send_frame(Frame::layer_add(self.canvas_id, at))
    }

    /// Request a layer deletion. Applied locally when the echo arrives.
    pub fn delete_layer(&self, layer_id: u8) -> Result<(), ClientError> {
        self.send_frame(Frame::layer_del(self.canvas_id, layer_id))
    }

    /// Request a layer reorder. Applied locally when the echo arrives.
    pub fn reorder_layer(&self, from: u8, to: u8) -> Result<(), ClientError> {
        self.send_frame(Frame::layer_reorder(self.canvas_id, from, to))
    }

    /// Translate a layer locally and notify the server. The server does
    /// not echo the move back to us.
    pub async fn move_layer(&self, layer_id: u8, dx: i32, dy: i32) -> Result<(), ClientError> {
        {
            let mut layers = self.layers.lock().await;
            let i = layer_id as usize;
            if i < 1 || i >= layers.len() {
                return Ok(());
            }
            layers[i].translate(dx, dy);
        }
        self.send_frame(Frame::layer_move(self.canvas_id, layer_id, dx, dy))
    }

    /// Upload our copy of a layer to the server (reliable
    /// reconciliation after lossy stroke traffic).
    pub async fn sync_layer(&self, layer_id: u8) -> Result<(), ClientError> {
        let layers = self.layers.lock().await;
        let i = layer_id as usize;
        if i < 1 || i >= layers.len() {
            return Ok(());
        }
        let header = Frame::layer_sync(self.canvas_id, layer_id);
        let mut chunk = Vec::with_capacity(FRAME_LEN + LAYER_BYTES);
        chunk.extend_from_slice(&header.encode());
        chunk.extend_from_slice(layers[i].bytes());
        self.outgoing
            .send(chunk)
            .map_err(|_| ClientError::Io(std::io::ErrorKind::BrokenPipe.into()))
    }

    /// Ask the server to persist all canvases now.
    pub fn save(&self) -> Result<(), ClientError> {
        self.send_frame(Frame::save(self.canvas_id))
    }

    /// Publish a signature payload; the server broadcasts it verbatim to
    /// every subscriber.
    pub fn send_signature(&self, payload: &[u8; SIGNATURE_LEN]) -> Result<(), ClientError> {
        self.send_frame(Frame::signature(self.canvas_id, self.room_uid, payload))
    }

    /// Gracefully end the session.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.send_frame(Frame::logout(self.canvas_id))?;
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    fn send_frame(&self, frame: Frame) -> Result<(), ClientError> {
        self.outgoing
            .send(frame.encode().to_vec())
            .map_err(|_| ClientError::Io(std::io::ErrorKind::BrokenPipe.into()))
    }
}

/// Reliable-channel reader: applies layer operations and forwarded
/// signatures to the local stack and surfaces them as events.
async fn reliable_reader(
    mut reader: OwnedReadHalf,
    layers: Arc<Mutex<Vec<Layer>>>,
    events: UnboundedSender<CanvasEvent>,
    own_uid: u8,
    state: Arc<RwLock<ConnectionState>>,
) {
    let mut buf = [0u8; FRAME_LEN];
    loop {
        if reader.read_exact(&mut buf).await.is_err() {
            break;
        }
        let frame = match Frame::decode(&buf) {
            Ok(frame) => frame,
            Err(_) => continue,
        };
        match frame.kind {
            MessageType::LayerAdd => {
                let mut layers = layers.lock().await;
                let index = frame.layer_id as usize;
                if index >= 1 && layers.len() < MAX_LAYERS {
                    if index <= layers.len() {
                        layers.insert(index, Layer::transparent());
                    } else {
                        layers.push(Layer::transparent());
                    }
                    let _ = events.send(CanvasEvent::LayerAdded {
                        index: frame.layer_id,
                        count: frame.layer_count,
                    });
                }
            }
            MessageType::LayerDel => {
                let mut layers = layers.lock().await;
                let index = frame.layer_id as usize;
                if index >= 1 && index < layers.len() && layers.len() > 2 {
                    layers.remove(index);
                    let _ = events.send(CanvasEvent::LayerDeleted {
                        index: frame.layer_id,
                        count: frame.layer_count,
                    });
                }
            }
            MessageType::LayerReorder => {
                let (from, to) = frame.reorder_indices();
                let mut layers = layers.lock().await;
                let (f, t) = (from as usize, to as usize);
                if f >= 1 && f < layers.len() && t >= 1 && t < layers.len() && f != t {
                    let layer = layers.remove(f);
                    layers.insert(t, layer);
                    let _ = events.send(CanvasEvent::LayerReordered { from, to });
                }
            }
            MessageType::LayerSync => {
                let mut payload = vec![0u8; LAYER_BYTES];
                if reader.read_exact(&mut payload).await.is_err() {
                    break;
                }
                let mut layers = layers.lock().await;
                let index = frame.layer_id as usize;
                if index >= 1 && index < layers.len() {
                    layers[index].replace(&payload);
                    let _ = events.send(CanvasEvent::LayerReplaced { index: frame.layer_id });
                }
            }
            MessageType::LayerMove => {
                let (dx, dy) = frame.move_delta();
                let mut layers = layers.lock().await;
                let index = frame.layer_id as usize;
                if index >= 1 && index < layers.len() {
                    layers[index].translate(dx, dy);
                    let _ = events.send(CanvasEvent::LayerMoved {
                        index: frame.layer_id,
                        dx,
                        dy,
                    });
                }
            }
            MessageType::Signature => {
                // Our own signature comes back too; drop it by uid.
                if frame.user_id != own_uid {
                    let _ = events.send(CanvasEvent::SignatureReceived {
                        room_uid: frame.user_id,
                        payload: frame.data,
                    });
                }
            }
            _ => {}
        }
    }
    *state.write().await = ConnectionState::Disconnected;
    let _ = events.send(CanvasEvent::Disconnected);
}

/// Datagram reader: applies remote strokes through the shared raster
/// entry points and surfaces cursor traffic.
async fn datagram_reader(
    udp: Arc<UdpSocket>,
    layers: Arc<Mutex<Vec<Layer>>>,
    brushes: Arc<BrushCatalog>,
    events: UnboundedSender<CanvasEvent>,
) {
    let mut buf = [0u8; 64];
    loop {
        let len = match udp.recv(&mut buf).await {
            Ok(len) => len,
            Err(_) => break,
        };
        if len < DATAGRAM_LEN {
            continue;
        }
        let Ok(packet) = Datagram::decode(&buf[..len]) else {
            continue;
        };
        match packet.kind {
            MessageType::Draw => {
                let mut layers = layers.lock().await;
                layer::apply_stamp(
                    &mut layers,
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
                let _ = events.send(CanvasEvent::RemoteStamp {
                    layer_id: packet.layer_id,
                    x: packet.x,
                    y: packet.y,
                });
            }
            MessageType::Line => {
                let mut layers = layers.lock().await;
                layer::apply_line(
                    &mut layers,
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
                let _ = events.send(CanvasEvent::RemoteLine {
                    layer_id: packet.layer_id,
                    x0: packet.x,
                    y0: packet.y,
                    x1: packet.ex,
                    y1: packet.ey,
                });
            }
            MessageType::Cursor => {
                let _ = events.send(CanvasEvent::RemoteCursor {
                    room_uid: packet.brush_id,
                    x: packet.x,
                    y: packet.y,
                });
            }
            _ => {}
        }
    }
}
