//! Layer storage: one fixed-size RGBA frame plus dirty tracking.
//!
//! Every layer in every room shares the process-wide `W×H`. The buffer is
//! row-major with R,G,B,A channel order, identical to the wire and storage
//! formats, so `LAYER_SYNC` payloads and the welcome stream are straight
//! copies of [`Layer::bytes`].
//!
//! Dirty tracking drives the persistence cache: `dirty` means the pixels
//! may differ from the last serialized form, and the cached encoding is
//! only trusted while `dirty == false`.

use crate::brush::BrushCatalog;
use crate::codec::{self, Pixel, WriteMode};
use crate::persistence;
use crate::{CANVAS_HEIGHT, CANVAS_WIDTH};

/// Byte length of one layer's pixel buffer.
pub const LAYER_BYTES: usize = CANVAS_WIDTH * CANVAS_HEIGHT * 4;

/// One `W×H` RGBA bitmap with a dirty flag and a cached serialized form.
pub struct Layer {
    data: Vec<u8>,
    dirty: bool,
    cache: Option<String>,
}

impl Layer {
    /// A fully transparent drawable layer.
    pub fn transparent() -> Self {
        Self {
            data: vec![0; LAYER_BYTES],
            dirty: true,
            cache: None,
        }
    }

    /// The opaque-white paper layer.
    pub fn white() -> Self {
        Self {
            data: vec![255; LAYER_BYTES],
            dirty: true,
            cache: None,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[cfg(test)]
    pub(crate) fn cached_encoding(&self) -> Option<&str> {
        self.cache.as_deref()
    }

    pub fn pixel(&self, x: i32, y: i32) -> Option<Pixel> {
        if x < 0 || y < 0 || x >= CANVAS_WIDTH as i32 || y >= CANVAS_HEIGHT as i32 {
            return None;
        }
        let idx = (y as usize * CANVAS_WIDTH + x as usize) * 4;
        Some(Pixel::rgba(
            self.data[idx],
            self.data[idx + 1],
            self.data[idx + 2],
            self.data[idx + 3],
        ))
    }

    /// Apply one pixel write. Out-of-range coordinates are silently
    /// dropped.
    pub fn write(&mut self, x: i32, y: i32, src: Pixel, mode: WriteMode) {
        if x < 0 || y < 0 || x >= CANVAS_WIDTH as i32 || y >= CANVAS_HEIGHT as i32 {
            return;
        }
        let idx = (y as usize * CANVAS_WIDTH + x as usize) * 4;
        let dst = Pixel::rgba(
            self.data[idx],
            self.data[idx + 1],
            self.data[idx + 2],
            self.data[idx + 3],
        );
        let out = codec::apply(mode, src, dst);
        self.data[idx] = out.r;
        self.data[idx + 1] = out.g;
        self.data[idx + 2] = out.b;
        self.data[idx + 3] = out.a;
        self.dirty = true;
    }

    /// Set a pixel directly, used when decoding stored documents.
    pub(crate) fn set_pixel(&mut self, x: usize, y: usize, px: Pixel) {
        let idx = (y * CANVAS_WIDTH + x) * 4;
        self.data[idx] = px.r;
        self.data[idx + 1] = px.g;
        self.data[idx + 2] = px.b;
        self.data[idx + 3] = px.a;
        self.dirty = true;
    }

    /// Overwrite the whole buffer. `bytes` must be exactly [`LAYER_BYTES`]
    /// long; anything else is rejected.
    pub fn replace(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() != LAYER_BYTES {
            return false;
        }
        self.data.copy_from_slice(bytes);
        self.dirty = true;
        true
    }

    /// Shift the layer content by `(dx, dy)`.
    ///
    /// Rebuilds onto a fresh transparent frame: source pixels whose
    /// destination falls outside the rectangle are discarded, uncovered
    /// destinations stay transparent.
    pub fn translate(&mut self, dx: i32, dy: i32) {
        if dx == 0 && dy == 0 {
            return;
        }
        let mut fresh = vec![0u8; LAYER_BYTES];
        for y in 0..CANVAS_HEIGHT as i32 {
            for x in 0..CANVAS_WIDTH as i32 {
                let sx = x - dx;
                let sy = y - dy;
                if sx < 0 || sy < 0 || sx >= CANVAS_WIDTH as i32 || sy >= CANVAS_HEIGHT as i32 {
                    continue;
                }
                let src = (sy as usize * CANVAS_WIDTH + sx as usize) * 4;
                let dst = (y as usize * CANVAS_WIDTH + x as usize) * 4;
                fresh[dst..dst + 4].copy_from_slice(&self.data[src..src + 4]);
            }
        }
        self.data = fresh;
        self.dirty = true;
    }

    /// Serialized form of this layer (packed words → PackBits → base64).
    ///
    /// Clean layers return the cached encoding verbatim without touching
    /// the pixel buffer; dirty layers re-encode, refresh the cache, and
    /// come out clean.
    pub fn serialize(&mut self) -> String {
        if !self.dirty {
            if let Some(cached) = &self.cache {
                return cached.clone();
            }
        }
        let encoded = persistence::encode_pixels(&self.data);
        self.cache = Some(encoded.clone());
        self.dirty = false;
        encoded
    }
}

/// Apply one brush stamp to a layer stack. The normative entry point for
/// DRAW packets: the server's room worker and a client's local echo both
/// come through here, which is what keeps the two bit-identical.
///
/// A `layer_id` outside the drawable range falls back to layer 1;
/// unknown brushes drop the stamp. Returns whether anything was applied.
#[allow(clippy::too_many_arguments)]
pub fn apply_stamp(
    layers: &mut [Layer],
    catalog: &BrushCatalog,
    brush_id: u8,
    layer_id: u8,
    x: i32,
    y: i32,
    color: Pixel,
    size: u8,
    pressure: u8,
    angle: i32,
) -> bool {
    let Some(brush) = catalog.get(brush_id) else {
        return false;
    };
    let Some(index) = clamp_drawable(layers, layer_id) else {
        return false;
    };
    let mode = brush.mode();
    let layer = &mut layers[index];
    brush.stamp(x, y, color, size, pressure, angle, &mut |px, py, p| {
        layer.write(px, py, p, mode);
    });
    true
}

/// Apply a LINE packet: Bresenham from `(x0, y0)` to `(x1, y1)`, stamping
/// at every point with the angle derived from the endpoints. Normative
/// for both sides of the wire, like [`apply_stamp`].
#[allow(clippy::too_many_arguments)]
pub fn apply_line(
    layers: &mut [Layer],
    catalog: &BrushCatalog,
    brush_id: u8,
    layer_id: u8,
    x0: i32,
    y0: i32,
    x1: i32,
    y1: i32,
    color: Pixel,
    size: u8,
    pressure: u8,
) -> bool {
    let Some(brush) = catalog.get(brush_id) else {
        return false;
    };
    let Some(index) = clamp_drawable(layers, layer_id) else {
        return false;
    };
    let mode = brush.mode();
    let angle = codec::line_angle(x0, y0, x1, y1);
    let layer = &mut layers[index];
    for (x, y) in codec::LinePoints::new(x0, y0, x1, y1) {
        brush.stamp(x, y, color, size, pressure, angle, &mut |px, py, p| {
            layer.write(px, py, p, mode);
        });
    }
    true
}

fn clamp_drawable(layers: &[Layer], layer_id: u8) -> Option<usize> {
    if layers.len() < 2 {
        return None;
    }
    let i = layer_id as usize;
    Some(if i >= 1 && i < layers.len() { i } else { 1 })
}

/// Flatten a layer stack for display or export: opaque white background,
/// then source-over of each drawable layer in index order. Returns a
/// row-major RGBA buffer.
pub fn composite(layers: &[Layer]) -> Vec<u8> {
    composite_with_opacity(layers, &[])
}

/// [`composite`] with per-layer opacity attenuation, a presentation
/// concern: `opacity[i]` scales layer `i`'s source alpha before the blend
/// and never touches the stored bitmaps. Missing entries default to fully
/// opaque.
pub fn composite_with_opacity(layers: &[Layer], opacity: &[u8]) -> Vec<u8> {
    let mut out = vec![255u8; LAYER_BYTES];
    for (i, layer) in layers.iter().enumerate().skip(1) {
        let m = opacity.get(i).copied().unwrap_or(255);
        for idx in (0..LAYER_BYTES).step_by(4) {
            let src = Pixel::rgba(
                layer.data[idx],
                layer.data[idx + 1],
                layer.data[idx + 2],
                layer.data[idx + 3],
            )
            .with_alpha_scaled(m);
            if src.a == 0 {
                continue;
            }
            let dst = Pixel::rgba(out[idx], out[idx + 1], out[idx + 2], out[idx + 3]);
            let blended = codec::source_over(src, dst);
            out[idx] = blended.r;
            out[idx + 1] = blended.g;
            out[idx + 2] = blended.b;
            out[idx + 3] = blended.a;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paper_is_opaque_white() {
        let paper = Layer::white();
        assert_eq!(paper.pixel(0, 0), Some(Pixel::WHITE));
        assert_eq!(
            paper.pixel(CANVAS_WIDTH as i32 - 1, CANVAS_HEIGHT as i32 - 1),
            Some(Pixel::WHITE)
        );
        assert!(paper.is_dirty());
    }

    #[test]
    fn test_out_of_range_writes_dropped() {
        let mut layer = Layer::transparent();
        layer.write(-1, 0, Pixel::WHITE, WriteMode::Replace);
        layer.write(0, CANVAS_HEIGHT as i32, Pixel::WHITE, WriteMode::Replace);
        layer.write(CANVAS_WIDTH as i32, 0, Pixel::WHITE, WriteMode::Replace);
        assert!(layer.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_source_over_blends() {
        let mut layer = Layer::transparent();
        layer.write(10, 10, Pixel::rgba(100, 0, 0, 255), WriteMode::SourceOver);
        assert_eq!(layer.pixel(10, 10), Some(Pixel::rgba(100, 0, 0, 255)));
    }

    #[test]
    fn test_translate_moves_and_clears() {
        let mut layer = Layer::transparent();
        let red = Pixel::rgba(255, 0, 0, 255);
        layer.write(5, 5, red, WriteMode::Replace);
        layer.translate(3, -2);
        assert_eq!(layer.pixel(8, 3), Some(red));
        assert_eq!(layer.pixel(5, 5), Some(Pixel::TRANSPARENT));
    }

    #[test]
    fn test_translate_discards_offscreen() {
        let mut layer = Layer::transparent();
        layer.write(0, 0, Pixel::WHITE, WriteMode::Replace);
        layer.translate(-1, 0);
        assert!(layer.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_serialize_caches_until_dirty() {
        let mut layer = Layer::transparent();
        let first = layer.serialize();
        assert!(!layer.is_dirty());
        assert_eq!(layer.serialize(), first);

        layer.write(0, 0, Pixel::WHITE, WriteMode::Replace);
        assert!(layer.is_dirty());
        let second = layer.serialize();
        assert_ne!(first, second);
    }

    #[test]
    fn test_cached_form_decodes_to_current_bytes() {
        let mut layer = Layer::transparent();
        layer.write(7, 3, Pixel::rgba(1, 2, 3, 4), WriteMode::Replace);
        let encoded = layer.serialize();
        let decoded = persistence::decode_pixels(&encoded).unwrap();
        assert_eq!(decoded, layer.bytes());
    }

    #[test]
    fn test_replace_rejects_wrong_length() {
        let mut layer = Layer::transparent();
        assert!(!layer.replace(&[0u8; 16]));
        assert!(layer.replace(&vec![9u8; LAYER_BYTES]));
        assert_eq!(layer.pixel(0, 0), Some(Pixel::rgba(9, 9, 9, 9)));
    }

    #[test]
    fn test_composite_white_through_transparent() {
        let layers = vec![Layer::white(), Layer::transparent()];
        let flat = composite(&layers);
        assert!(flat.iter().all(|&b| b == 255));
    }

    #[test]
    fn test_composite_respects_layer_order() {
        let mut lower = Layer::transparent();
        let mut upper = Layer::transparent();
        lower.write(0, 0, Pixel::rgba(255, 0, 0, 255), WriteMode::Replace);
        upper.write(0, 0, Pixel::rgba(0, 0, 255, 255), WriteMode::Replace);
        let layers = vec![Layer::white(), lower, upper];
        let flat = composite(&layers);
        assert_eq!(&flat[0..4], &[0, 0, 255, 255]);
    }

    #[test]
    fn test_composite_opacity_attenuates() {
        let mut ink = Layer::transparent();
        ink.write(0, 0, Pixel::rgba(0, 0, 0, 255), WriteMode::Replace);
        let layers = vec![Layer::white(), ink];
        let flat = composite_with_opacity(&layers, &[255, 128]);
        // Half-opacity black over white lands mid-gray.
        assert_eq!(flat[3], 255);
        assert!(flat[0] > 100 && flat[0] < 150);
    }
}
