//! # fresco — collaborative raster painting over TCP + UDP
//!
//! A multi-user, multi-canvas painting service: participants connect to a
//! central server and concurrently edit canvases made of stacked
//! translucent RGBA layers. Control traffic (logins, layer operations,
//! bulk layer syncs, signatures) rides an ordered TCP channel; high-volume
//! stroke and cursor traffic rides best-effort UDP, one socket per active
//! canvas.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  TCP 6769 (frames)   ┌──────────────────────────┐
//! │ PaintClient │ ◄──────────────────► │ Server                   │
//! │ (per user)  │                      │  ├ session task per conn │
//! └──────┬──────┘  UDP 6770+id         │  ├ Room per canvas       │
//!        │        ◄──────────────────► │  │  (one mutex each)     │
//!        ▼          DRAW/LINE/CURSOR   │  ├ worker per Active room│
//! ┌─────────────┐                      │  └ autosave loop         │
//! │ local layer │                      └────────────┬─────────────┘
//! │ stack       │   identical raster code           │ dirty-driven
//! └─────────────┘ ◄────────────────────────────────►▼
//!                   (apply_stamp / apply_line)  canvas.json
//! ```
//!
//! ## Modules
//!
//! - [`codec`] — straight-alpha source-over blending and Bresenham lines
//! - [`brush`] — the stamping catalog keyed by wire brush id
//! - [`layer`] — fixed-size RGBA frames, dirty tracking, compositing
//! - [`protocol`] — exact 263-byte frame and 18-byte datagram layouts
//! - [`signature`] — 2-bit quantized signature bitmap packing
//! - [`room`] — per-canvas state machine and the room registry
//! - [`server`] — acceptor, session handlers, room workers
//! - [`client`] — headless client mirroring the server bit-for-bit
//! - [`persistence`] — PackBits + base64 layer blobs in one JSON document
//!
//! Stroke application is deliberately shared: the server's room worker
//! and every client's local echo go through the same raster entry points,
//! which is what makes a preview trustworthy on a lossy channel.

pub mod brush;
pub mod client;
pub mod codec;
pub mod layer;
pub mod persistence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod signature;

/// Canvas width shared by every layer of every room.
pub const CANVAS_WIDTH: usize = 1280;
/// Canvas height shared by every layer of every room.
pub const CANVAS_HEIGHT: usize = 720;
/// Maximum layers per room, paper included.
pub const MAX_LAYERS: usize = 15;

pub use brush::{Brush, BrushCatalog};
pub use client::{CanvasEvent, ClientConfig, ClientError, ConnectionState, PaintClient};
pub use codec::{Pixel, WriteMode};
pub use layer::{composite, composite_with_opacity, Layer, LAYER_BYTES};
pub use protocol::{Datagram, Frame, MessageType, ProtocolError};
pub use room::{Room, RoomRegistry};
pub use server::{Server, ServerConfig, ServerError};
