//! Wire protocol: fixed-size reliable frames and unreliable datagrams.
//!
//! Layouts (all multi-byte integers little-endian):
//! ```text
//! Reliable frame, 263 bytes            Datagram, 18 bytes
//! ┌────────┬──────┬─────────────┐      ┌────────┬──────┬──────────────┐
//! │ offset │ size │ field       │      │ offset │ size │ field        │
//! ├────────┼──────┼─────────────┤      ├────────┼──────┼──────────────┤
//! │ 0      │ 1    │ type        │      │ 0      │ 1    │ type         │
//! │ 1      │ 1    │ canvas_id   │      │ 1      │ 1    │ brush_id     │
//! │ 2      │ 2    │ data_len    │      │ 2      │ 1    │ layer_id     │
//! │ 4      │ 1    │ layer_count │      │ 3      │ 2    │ x (i16)      │
//! │ 5      │ 1    │ layer_id    │      │ 5      │ 2    │ y (i16)      │
//! │ 6      │ 1    │ user_id     │      │ 7      │ 2    │ ex (i16)     │
//! │ 7      │ 256  │ data        │      │ 9      │ 2    │ ey (i16)     │
//! └────────┴──────┴─────────────┘      │ 11     │ 4    │ r, g, b, a   │
//!                                      │ 15     │ 1    │ size         │
//!                                      │ 16     │ 1    │ pressure     │
//!                                      └────────┴──────┴──────────────┘
//! ```
//!
//! The `data` field is always transmitted in full; `data_len` marks the
//! significant prefix. `LAYER_SYNC` frames are followed on the stream by a
//! raw `W·H·4`-byte bitmap; `WELCOME` replies are followed by an `i32`
//! layer count and the drawable layers' bitmaps. For DRAW datagrams `ex`
//! carries the stroke angle in degrees; for CURSOR the `brush_id` field
//! carries the sender's room uid.

use crate::codec::Pixel;

/// Total size of one reliable frame on the wire.
pub const FRAME_LEN: usize = 263;
/// Size of the opaque `data` field.
pub const FRAME_DATA_LEN: usize = 256;
/// Size of one unreliable datagram.
pub const DATAGRAM_LEN: usize = 18;
/// Longest accepted display name, in bytes.
pub const MAX_NAME_LEN: usize = 31;
/// Exact length of a signature payload.
pub const SIGNATURE_LEN: usize = 256;

/// Reliable and unreliable message types. Identifier 16 is intentionally
/// unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Login = 1,
    Logout = 2,
    Welcome = 3,
    CanvasData = 4,
    Save = 5,
    Draw = 6,
    Cursor = 7,
    Line = 8,
    Error = 9,
    LayerAdd = 10,
    LayerDel = 11,
    LayerSelect = 12,
    LayerSync = 13,
    LayerReorder = 14,
    Signature = 15,
    LayerMove = 17,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            1 => MessageType::Login,
            2 => MessageType::Logout,
            3 => MessageType::Welcome,
            4 => MessageType::CanvasData,
            5 => MessageType::Save,
            6 => MessageType::Draw,
            7 => MessageType::Cursor,
            8 => MessageType::Line,
            9 => MessageType::Error,
            10 => MessageType::LayerAdd,
            11 => MessageType::LayerDel,
            12 => MessageType::LayerSelect,
            13 => MessageType::LayerSync,
            14 => MessageType::LayerReorder,
            15 => MessageType::Signature,
            17 => MessageType::LayerMove,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// Protocol decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// `type` byte outside the known enum. The reader skips the record.
    UnknownType(u8),
    /// Buffer shorter than the fixed record size.
    Truncated { expected: usize, got: usize },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownType(t) => write!(f, "unknown message type {t}"),
            Self::Truncated { expected, got } => {
                write!(f, "truncated record: expected {expected} bytes, got {got}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// One 263-byte reliable frame.
#[derive(Clone)]
pub struct Frame {
    pub kind: MessageType,
    pub canvas_id: u8,
    pub data_len: u16,
    pub layer_count: u8,
    pub layer_id: u8,
    pub user_id: u8,
    pub data: [u8; FRAME_DATA_LEN],
}

impl Frame {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            canvas_id: 0,
            data_len: 0,
            layer_count: 0,
            layer_id: 0,
            user_id: 0,
            data: [0; FRAME_DATA_LEN],
        }
    }

    /// Login request: the significant `data` prefix is the display name,
    /// truncated to [`MAX_NAME_LEN`] bytes.
    pub fn login(canvas_id: u8, name: &str) -> Self {
        let mut frame = Frame::new(MessageType::Login);
        frame.canvas_id = canvas_id;
        let bytes = name.as_bytes();
        let len = bytes.len().min(MAX_NAME_LEN);
        frame.data[..len].copy_from_slice(&bytes[..len]);
        frame.data_len = len as u16;
        frame
    }

    pub fn logout(canvas_id: u8) -> Self {
        let mut frame = Frame::new(MessageType::Logout);
        frame.canvas_id = canvas_id;
        frame
    }

    /// Welcome reply: total layer count and the caller's assigned room uid.
    pub fn welcome(canvas_id: u8, layer_count: u8, room_uid: u8) -> Self {
        let mut frame = Frame::new(MessageType::Welcome);
        frame.canvas_id = canvas_id;
        frame.layer_count = layer_count;
        frame.user_id = room_uid;
        frame
    }

    pub fn error(canvas_id: u8) -> Self {
        let mut frame = Frame::new(MessageType::Error);
        frame.canvas_id = canvas_id;
        frame
    }

    pub fn save(canvas_id: u8) -> Self {
        let mut frame = Frame::new(MessageType::Save);
        frame.canvas_id = canvas_id;
        frame
    }

    /// Signature carrying exactly [`SIGNATURE_LEN`] opaque bytes.
    /// `user_id` is filled by the server when broadcasting.
    pub fn signature(canvas_id: u8, room_uid: u8, payload: &[u8; SIGNATURE_LEN]) -> Self {
        let mut frame = Frame::new(MessageType::Signature);
        frame.canvas_id = canvas_id;
        frame.user_id = room_uid;
        frame.data_len = SIGNATURE_LEN as u16;
        frame.data.copy_from_slice(payload);
        frame
    }

    /// Layer insertion request/broadcast. `layer_id` is the insertion
    /// index (zero or past-the-end appends); broadcasts also carry the
    /// resulting total in `layer_count`.
    pub fn layer_add(canvas_id: u8, at: u8) -> Self {
        let mut frame = Frame::new(MessageType::LayerAdd);
        frame.canvas_id = canvas_id;
        frame.layer_id = at;
        frame
    }

    pub fn layer_del(canvas_id: u8, layer_id: u8) -> Self {
        let mut frame = Frame::new(MessageType::LayerDel);
        frame.canvas_id = canvas_id;
        frame.layer_id = layer_id;
        frame
    }

    /// Header announcing a full-layer bitmap on the same stream.
    pub fn layer_sync(canvas_id: u8, layer_id: u8) -> Self {
        let mut frame = Frame::new(MessageType::LayerSync);
        frame.canvas_id = canvas_id;
        frame.layer_id = layer_id;
        frame
    }

    pub fn layer_reorder(canvas_id: u8, from: u8, to: u8) -> Self {
        let mut frame = Frame::new(MessageType::LayerReorder);
        frame.canvas_id = canvas_id;
        frame.data[0] = from;
        frame.data[1] = to;
        frame.data_len = 2;
        frame
    }

    pub fn layer_move(canvas_id: u8, layer_id: u8, dx: i32, dy: i32) -> Self {
        let mut frame = Frame::new(MessageType::LayerMove);
        frame.canvas_id = canvas_id;
        frame.layer_id = layer_id;
        frame.data[0..4].copy_from_slice(&dx.to_le_bytes());
        frame.data[4..8].copy_from_slice(&dy.to_le_bytes());
        frame.data_len = 8;
        frame
    }

    /// Display name from a login frame's significant data prefix
    /// (NUL-terminated, at most [`MAX_NAME_LEN`] bytes).
    pub fn name(&self) -> String {
        let len = (self.data_len as usize).min(MAX_NAME_LEN);
        let prefix = &self.data[..len];
        let end = prefix.iter().position(|&b| b == 0).unwrap_or(len);
        String::from_utf8_lossy(&prefix[..end]).into_owned()
    }

    /// `(from, to)` of a reorder frame.
    pub fn reorder_indices(&self) -> (u8, u8) {
        (self.data[0], self.data[1])
    }

    /// `(dx, dy)` of a layer-move frame.
    pub fn move_delta(&self) -> (i32, i32) {
        let dx = i32::from_le_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]);
        let dy = i32::from_le_bytes([self.data[4], self.data[5], self.data[6], self.data[7]]);
        (dx, dy)
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0] = self.kind as u8;
        buf[1] = self.canvas_id;
        buf[2..4].copy_from_slice(&self.data_len.to_le_bytes());
        buf[4] = self.layer_count;
        buf[5] = self.layer_id;
        buf[6] = self.user_id;
        buf[7..].copy_from_slice(&self.data);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < FRAME_LEN {
            return Err(ProtocolError::Truncated {
                expected: FRAME_LEN,
                got: buf.len(),
            });
        }
        let kind = MessageType::try_from(buf[0])?;
        let mut data = [0u8; FRAME_DATA_LEN];
        data.copy_from_slice(&buf[7..FRAME_LEN]);
        Ok(Self {
            kind,
            canvas_id: buf[1],
            data_len: u16::from_le_bytes([buf[2], buf[3]]),
            layer_count: buf[4],
            layer_id: buf[5],
            user_id: buf[6],
            data,
        })
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("kind", &self.kind)
            .field("canvas_id", &self.canvas_id)
            .field("data_len", &self.data_len)
            .field("layer_count", &self.layer_count)
            .field("layer_id", &self.layer_id)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// One 18-byte unreliable datagram: DRAW, LINE, or CURSOR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram {
    pub kind: MessageType,
    pub brush_id: u8,
    pub layer_id: u8,
    pub x: i16,
    pub y: i16,
    pub ex: i16,
    pub ey: i16,
    pub color: Pixel,
    pub size: u8,
    pub pressure: u8,
}

impl Datagram {
    /// Single stamp. The stroke angle rides in `ex`.
    pub fn draw(
        brush_id: u8,
        layer_id: u8,
        x: i16,
        y: i16,
        angle: i16,
        color: Pixel,
        size: u8,
        pressure: u8,
    ) -> Self {
        Self {
            kind: MessageType::Draw,
            brush_id,
            layer_id,
            x,
            y,
            ex: angle,
            ey: 0,
            color,
            size,
            pressure,
        }
    }

    /// Interpolated line from `(x, y)` to `(ex, ey)`.
    pub fn line(
        brush_id: u8,
        layer_id: u8,
        x: i16,
        y: i16,
        ex: i16,
        ey: i16,
        color: Pixel,
        size: u8,
        pressure: u8,
    ) -> Self {
        Self {
            kind: MessageType::Line,
            brush_id,
            layer_id,
            x,
            y,
            ex,
            ey,
            color,
            size,
            pressure,
        }
    }

    /// Cursor position. The sender's room uid rides in `brush_id`.
    pub fn cursor(room_uid: u8, x: i16, y: i16) -> Self {
        Self {
            kind: MessageType::Cursor,
            brush_id: room_uid,
            layer_id: 0,
            x,
            y,
            ex: 0,
            ey: 0,
            color: Pixel::TRANSPARENT,
            size: 0,
            pressure: 0,
        }
    }

    /// Stroke angle in degrees for DRAW packets.
    pub fn angle(&self) -> i32 {
        self.ex as i32
    }

    pub fn encode(&self) -> [u8; DATAGRAM_LEN] {
        let mut buf = [0u8; DATAGRAM_LEN];
        buf[0] = self.kind as u8;
        buf[1] = self.brush_id;
        buf[2] = self.layer_id;
        buf[3..5].copy_from_slice(&self.x.to_le_bytes());
        buf[5..7].copy_from_slice(&self.y.to_le_bytes());
        buf[7..9].copy_from_slice(&self.ex.to_le_bytes());
        buf[9..11].copy_from_slice(&self.ey.to_le_bytes());
        buf[11] = self.color.r;
        buf[12] = self.color.g;
        buf[13] = self.color.b;
        buf[14] = self.color.a;
        buf[15] = self.size;
        buf[16] = self.pressure;
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < DATAGRAM_LEN {
            return Err(ProtocolError::Truncated {
                expected: DATAGRAM_LEN,
                got: buf.len(),
            });
        }
        Ok(Self {
            kind: MessageType::try_from(buf[0])?,
            brush_id: buf[1],
            layer_id: buf[2],
            x: i16::from_le_bytes([buf[3], buf[4]]),
            y: i16::from_le_bytes([buf[5], buf[6]]),
            ex: i16::from_le_bytes([buf[7], buf[8]]),
            ey: i16::from_le_bytes([buf[9], buf[10]]),
            color: Pixel::rgba(buf[11], buf[12], buf[13], buf[14]),
            size: buf[15],
            pressure: buf[16],
        })
    }
}
