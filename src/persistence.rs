//! Durable canvas storage: one JSON document for every room.
//!
//! Layer pipeline:
//! ```text
//! ┌──────────────┐   pack    ┌───────────┐   PackBits   ┌────────┐
//! │ RGBA pixels  │ ────────► │ BE words  │ ───────────► │ runs   │
//! │ (row-major)  │           │ r·g·b·a   │              │        │
//! └──────────────┘           └───────────┘              └───┬────┘
//!                                                           │ base64
//!                                                           ▼
//!                          { "index": i, "data": "Qk3…" }  blob
//! ```
//!
//! Saves are dirty-driven: the autosave tick and explicit SAVE requests
//! run the same pass, which returns silently when nothing changed and
//! otherwise writes the whole document via write-then-rename. Clean
//! layers contribute their cached encoding without being re-read.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::codec::Pixel;
use crate::layer::Layer;
use crate::room::RoomRegistry;
use crate::{CANVAS_HEIGHT, CANVAS_WIDTH};

/// Well-known document filename, resolved against the working directory.
pub const DOCUMENT_NAME: &str = "canvas.json";

/// Document format version.
pub const DOCUMENT_VERSION: u32 = 2;

/// Persistence failures. Saves are retried on the next tick; loads fall
/// back to a fresh document.
#[derive(Debug)]
pub enum PersistError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Decode(base64::DecodeError),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Json(e) => write!(f, "document error: {e}"),
            Self::Decode(e) => write!(f, "base64 error: {e}"),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<base64::DecodeError> for PersistError {
    fn from(e: base64::DecodeError) -> Self {
        Self::Decode(e)
    }
}

// ───────────────────────────────────────────────────────────────────
// PackBits
// ───────────────────────────────────────────────────────────────────

/// PackBits compression.
///
/// Header byte `n` as i8: `0..=127` means `n + 1` literal bytes follow;
/// `-127..=-1` means the next byte repeats `1 − n` times; `-128` is a
/// no-op. A repeat stretch starting a segment becomes a run even at
/// length two; a literal in progress breaks only when a stretch of three
/// begins. Literal segments cap at 128 bytes, runs at 128 repeats.
pub fn packbits_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let run_start = i;
        while i + 1 < data.len() && data[i] == data[i + 1] && (i - run_start) < 127 {
            i += 1;
        }
        if i > run_start {
            let count = i - run_start + 1;
            out.push((257 - count) as u8);
            out.push(data[run_start]);
            i += 1;
        } else {
            let mut j = i;
            while j < data.len() && (j - i) < 128 {
                if j + 2 < data.len() && data[j] == data[j + 1] && data[j] == data[j + 2] {
                    break;
                }
                j += 1;
            }
            out.push((j - i - 1) as u8);
            out.extend_from_slice(&data[i..j]);
            i = j;
        }
    }
    out
}

/// PackBits decompression. Tolerates truncated input by stopping at the
/// end of the stream.
pub fn packbits_decode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let n = data[i] as i8;
        i += 1;
        if n == -128 {
            continue;
        }
        if n >= 0 {
            let count = n as usize + 1;
            let end = (i + count).min(data.len());
            out.extend_from_slice(&data[i..end]);
            i = end;
        } else {
            let count = 1 - n as isize;
            if i < data.len() {
                let value = data[i];
                i += 1;
                out.extend(std::iter::repeat(value).take(count as usize));
            }
        }
    }
    out
}

// ───────────────────────────────────────────────────────────────────
// Layer blobs
// ───────────────────────────────────────────────────────────────────

/// Encode a layer's pixel buffer: big-endian `(r<<24)|(g<<16)|(b<<8)|a`
/// words in y-major order, PackBits-compressed, base64-wrapped.
///
/// The big-endian word stream is byte-identical to the row-major RGBA
/// buffer, so the buffer compresses directly.
pub(crate) fn encode_pixels(data: &[u8]) -> String {
    BASE64.encode(packbits_encode(data))
}

/// Inverse of [`encode_pixels`], back to raw RGBA bytes.
pub(crate) fn decode_pixels(blob: &str) -> Result<Vec<u8>, PersistError> {
    Ok(packbits_decode(&BASE64.decode(blob)?))
}

/// Decode a stored blob into `layer`, iterating over the document's
/// dimensions so the stream is consumed correctly, clipping writes to the
/// current canvas rectangle.
fn decode_layer_into(
    layer: &mut Layer,
    blob: &str,
    doc_width: usize,
    doc_height: usize,
) -> Result<(), PersistError> {
    let bytes = decode_pixels(blob)?;
    let mut word = 0usize;
    for y in 0..doc_height {
        for x in 0..doc_width {
            let at = word * 4;
            word += 1;
            if at + 4 > bytes.len() {
                return Ok(());
            }
            if x < CANVAS_WIDTH && y < CANVAS_HEIGHT {
                layer.set_pixel(
                    x,
                    y,
                    Pixel::rgba(bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]),
                );
            }
        }
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────────
// Document
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    version: u32,
    width: usize,
    height: usize,
    canvases: Vec<CanvasEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CanvasEntry {
    id: u8,
    /// Number of drawable layers (total minus the paper).
    layer_count: u8,
    layers: Vec<LayerEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LayerEntry {
    /// Position in the room's stack, always ≥ 1.
    index: u8,
    data: String,
}

/// Persist every room's drawable layers into one document.
///
/// Returns `Ok(false)` without touching the file when no room is dirty.
/// Each room's dirty flag is cleared in the same critical section that
/// serializes its layers: a stamp landing after the guard drops re-dirties
/// the room and is picked up by the next pass. A failed write re-marks
/// every room so the next tick retries.
pub async fn save_all(registry: &RoomRegistry, path: &Path) -> Result<bool, PersistError> {
    let _guard = registry.persist_guard().await;
    let rooms = registry.snapshot().await;

    let mut any_dirty = false;
    for room in &rooms {
        if room.lock().await.dirty {
            any_dirty = true;
            break;
        }
    }
    if !any_dirty {
        return Ok(false);
    }

    let mut canvases = Vec::with_capacity(rooms.len());
    for room in &rooms {
        let mut state = room.lock().await;
        if state.dirty {
            log::debug!("encoding canvas #{}", room.id);
        }
        let mut layers = Vec::with_capacity(state.layers().len().saturating_sub(1));
        for index in 1..state.layers().len() {
            layers.push(LayerEntry {
                index: index as u8,
                data: state.layers_mut()[index].serialize(),
            });
        }
        canvases.push(CanvasEntry {
            id: room.id,
            layer_count: layers.len() as u8,
            layers,
        });
        state.dirty = false;
    }

    let document = Document {
        version: DOCUMENT_VERSION,
        width: CANVAS_WIDTH,
        height: CANVAS_HEIGHT,
        canvases,
    };
    let outcome: Result<(), PersistError> = async {
        let text = serde_json::to_string_pretty(&document)?;
        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, text.as_bytes()).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
    .await;
    if let Err(e) = outcome {
        // The document on disk was not replaced; re-mark everything so
        // the next tick retries from the (still valid) layer caches.
        for room in &rooms {
            room.lock().await.dirty = true;
        }
        return Err(e);
    }

    log::info!("saved {} canvases to {}", rooms.len(), path.display());
    Ok(true)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Load the document at `path`, creating rooms on demand.
///
/// A missing document seeds canvas 0 and writes an initial file; an
/// unparseable one is logged and ignored. Returns the number of canvases
/// restored.
pub async fn load_all(registry: &RoomRegistry, path: &Path) -> Result<usize, PersistError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("no document at {}, seeding canvas 0", path.display());
            registry.get_or_create(0).await;
            save_all(registry, path).await?;
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    let document: Document = match serde_json::from_str(&text) {
        Ok(doc) => doc,
        Err(e) => {
            log::warn!("ignoring unreadable document {}: {e}", path.display());
            return Ok(0);
        }
    };
    log::info!(
        "loading document: version {} dimensions {}x{} (current {}x{})",
        document.version,
        document.width,
        document.height,
        CANVAS_WIDTH,
        CANVAS_HEIGHT
    );

    for canvas in &document.canvases {
        let room = registry.get_or_create(canvas.id).await;
        let mut state = room.lock().await;
        let wanted = canvas.layer_count as usize + 1;
        while state.layers().len() < wanted.min(crate::MAX_LAYERS) {
            state.layers_mut().push(Layer::transparent());
        }
        for entry in &canvas.layers {
            let index = entry.index as usize;
            if index < 1 || index >= state.layers().len() {
                log::warn!("canvas #{}: skipping layer entry {index}", canvas.id);
                continue;
            }
            if let Err(e) = decode_layer_into(
                &mut state.layers_mut()[index],
                &entry.data,
                document.width,
                document.height,
            ) {
                log::warn!("canvas #{}: layer {index} unreadable: {e}", canvas.id);
            }
        }
        log::info!(
            "canvas #{}: {} drawable layers loaded",
            canvas.id,
            canvas.layer_count
        );
    }
    Ok(document.canvases.len())
}

/// Periodic save loop: one pass per interval tick, sharing [`save_all`]
/// with explicit SAVE requests. Failures are logged and retried next
/// tick.
pub async fn autosave_loop(registry: Arc<RoomRegistry>, path: PathBuf, interval: Duration) {
    log::info!("autosave running every {}s", interval.as_secs());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately
    loop {
        ticker.tick().await;
        match save_all(&registry, &path).await {
            Ok(true) => {}
            Ok(false) => log::trace!("autosave: nothing dirty"),
            Err(e) => log::error!("autosave failed, will retry: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WriteMode;

    #[test]
    fn test_packbits_known_vector() {
        let input = [7u8, 7, 7, 7, 7, 1, 2, 3, 7, 7, 8, 8, 8, 8];
        let encoded = packbits_encode(&input);
        // Run of five 7s, a five-byte literal (the 7,7 pair stays
        // literal), then a run of four 8s.
        assert_eq!(
            encoded,
            vec![0xFC, 0x07, 0x04, 0x01, 0x02, 0x03, 0x07, 0x07, 0xFD, 0x08]
        );
        assert_eq!(packbits_decode(&encoded), input);
    }

    #[test]
    fn test_packbits_two_byte_run_at_segment_start() {
        let input = [5u8, 5, 9];
        let encoded = packbits_encode(&input);
        assert_eq!(encoded, vec![0xFF, 0x05, 0x00, 0x09]);
        assert_eq!(packbits_decode(&encoded), input);
    }

    #[test]
    fn test_packbits_long_run_splits_at_128() {
        let input = vec![42u8; 300];
        let encoded = packbits_encode(&input);
        assert_eq!(packbits_decode(&encoded), input);
        // 300 = 128 + 128 + 44, three runs.
        assert_eq!(encoded.len(), 6);
        assert_eq!(encoded[0] as i8, -127);
    }

    #[test]
    fn test_packbits_literal_caps_at_128() {
        let input: Vec<u8> = (0..200u16).map(|v| (v % 251) as u8).collect();
        let encoded = packbits_encode(&input);
        assert_eq!(encoded[0], 127);
        assert_eq!(packbits_decode(&encoded), input);
    }

    #[test]
    fn test_packbits_decode_skips_noop() {
        let encoded = [0x80u8, 0x00, 0x41];
        assert_eq!(packbits_decode(&encoded), vec![0x41]);
    }

    #[test]
    fn test_packbits_empty() {
        assert!(packbits_encode(&[]).is_empty());
        assert!(packbits_decode(&[]).is_empty());
    }

    #[test]
    fn test_pixel_blob_roundtrip() {
        let mut layer = Layer::transparent();
        layer.write(3, 1, Pixel::rgba(200, 100, 50, 255), WriteMode::Replace);
        let blob = encode_pixels(layer.bytes());
        assert_eq!(decode_pixels(&blob).unwrap(), layer.bytes());
    }

    #[test]
    fn test_decode_layer_clips_foreign_dimensions() {
        // A blob saved from a 2048-wide canvas still decodes: the stream
        // is consumed with the stored width and clipped to ours.
        let doc_w = CANVAS_WIDTH + 8;
        let mut wide = vec![0u8; doc_w * 2 * 4];
        // Pixel (CANVAS_WIDTH + 1, 0) in the wide frame, out of range here.
        let off = (CANVAS_WIDTH + 1) * 4;
        wide[off..off + 4].copy_from_slice(&[1, 2, 3, 4]);
        // Pixel (5, 1) lands in range.
        let off = (doc_w + 5) * 4;
        wide[off..off + 4].copy_from_slice(&[9, 9, 9, 9]);

        let blob = BASE64.encode(packbits_encode(&wide));
        let mut layer = Layer::transparent();
        decode_layer_into(&mut layer, &blob, doc_w, 2).unwrap();
        assert_eq!(layer.pixel(5, 1), Some(Pixel::rgba(9, 9, 9, 9)));
        assert_eq!(layer.pixel(5, 0), Some(Pixel::TRANSPARENT));
    }

    #[tokio::test]
    async fn test_save_skips_when_clean_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DOCUMENT_NAME);
        let registry = RoomRegistry::new();
        registry.get_or_create(0).await;

        assert!(save_all(&registry, &path).await.unwrap());
        let first = tokio::fs::read(&path).await.unwrap();

        // Nothing mutated: the pass is a silent no-op and the document
        // stays byte-identical.
        assert!(!save_all(&registry, &path).await.unwrap());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), first);

        // All layer caches were populated by the first pass.
        let room = registry.get(0).await.unwrap();
        let state = room.lock().await;
        assert!(state.layers()[1].cached_encoding().is_some());
        assert!(!state.layers()[1].is_dirty());
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DOCUMENT_NAME);

        let registry = RoomRegistry::new();
        {
            let room = registry.get_or_create(3).await;
            let mut state = room.lock().await;
            state.add_layer(0);
            state.layers_mut()[1].write(10, 20, Pixel::rgba(1, 2, 3, 255), WriteMode::Replace);
            state.layers_mut()[2].write(30, 40, Pixel::rgba(4, 5, 6, 128), WriteMode::Replace);
        }
        assert!(save_all(&registry, &path).await.unwrap());

        let restored = RoomRegistry::new();
        assert_eq!(load_all(&restored, &path).await.unwrap(), 1);
        let room = restored.get(3).await.unwrap();
        let state = room.lock().await;
        assert_eq!(state.layer_count(), 3);
        assert_eq!(state.layers()[1].pixel(10, 20), Some(Pixel::rgba(1, 2, 3, 255)));
        assert_eq!(state.layers()[2].pixel(30, 40), Some(Pixel::rgba(4, 5, 6, 128)));
        // The paper is never persisted, always rebuilt white.
        assert_eq!(state.layers()[0].pixel(0, 0), Some(Pixel::WHITE));
    }

    #[tokio::test]
    async fn test_load_missing_document_seeds_canvas_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DOCUMENT_NAME);
        let registry = RoomRegistry::new();
        assert_eq!(load_all(&registry, &path).await.unwrap(), 0);
        assert!(registry.get(0).await.is_some());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_load_garbage_document_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DOCUMENT_NAME);
        tokio::fs::write(&path, b"not json at all").await.unwrap();
        let registry = RoomRegistry::new();
        assert_eq!(load_all(&registry, &path).await.unwrap(), 0);
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_document_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DOCUMENT_NAME);
        let registry = RoomRegistry::new();
        registry.get_or_create(7).await;
        save_all(&registry, &path).await.unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
        assert_eq!(value["version"], 2);
        assert_eq!(value["width"], CANVAS_WIDTH);
        assert_eq!(value["height"], CANVAS_HEIGHT);
        assert_eq!(value["canvases"][0]["id"], 7);
        assert_eq!(value["canvases"][0]["layer_count"], 1);
        assert_eq!(value["canvases"][0]["layers"][0]["index"], 1);
        assert!(value["canvases"][0]["layers"][0]["data"].is_string());
    }
}
