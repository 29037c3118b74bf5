//! Brush catalog: parameterized stamping functions keyed by wire id.
//!
//! Each brush maps `(center, color, size, pressure, angle)` to a set of
//! pixel writes emitted through a callback, so the same implementation
//! drives both the server's layer arrays and a client's preview surface.
//! Brushes are pure: no per-stroke state lives here. The wire `brush_id`
//! is the index into [`BrushCatalog`]; erasers declare non-source-over
//! write modes and consumers branch on [`Brush::mode`], never on the id.

use crate::codec::{Pixel, WriteMode};

/// Emission callback: `(x, y, pixel)` writes, unclipped.
///
/// Callers clip to the layer rectangle; brushes may emit out-of-range
/// coordinates freely.
pub type Emit<'a> = &'a mut dyn FnMut(i32, i32, Pixel);

/// A stamping function plus its write mode.
pub trait Brush: Send + Sync {
    fn name(&self) -> &'static str;

    /// How this brush's output combines with the destination.
    fn mode(&self) -> WriteMode {
        WriteMode::SourceOver
    }

    /// Stamp once at `(x, y)`.
    ///
    /// `pressure` is `0..=255` mapping to `0.0..=1.0`; `angle` is the
    /// stroke direction in whole degrees. Brushes that ignore either
    /// simply do so.
    fn stamp(&self, x: i32, y: i32, color: Pixel, size: u8, pressure: u8, angle: i32, emit: Emit);
}

/// Filled disc of radius `size / 2`, solid color scaled by the brush
/// opacity multiplier. Radius below one pixel degenerates to a single
/// pixel.
pub struct RoundBrush {
    pub opacity: u8,
}

impl Brush for RoundBrush {
    fn name(&self) -> &'static str {
        "round"
    }

    fn stamp(&self, x: i32, y: i32, color: Pixel, size: u8, _pressure: u8, _angle: i32, emit: Emit) {
        let out = color.with_alpha_scaled(self.opacity);
        let r = size as i32 / 2;
        if r < 1 {
            emit(x, y, out);
            return;
        }
        for i in -r..=r {
            for j in -r..=r {
                if i * i + j * j <= r * r {
                    emit(x + i, y + j, out);
                }
            }
        }
    }
}

/// Filled square, solid color.
pub struct SquareBrush;

impl Brush for SquareBrush {
    fn name(&self) -> &'static str {
        "square"
    }

    fn stamp(&self, x: i32, y: i32, color: Pixel, size: u8, _pressure: u8, _angle: i32, emit: Emit) {
        let r = size as i32 / 2;
        for i in -r..=r {
            for j in -r..=r {
                emit(x + i, y + j, color);
            }
        }
    }
}

/// Writes transparent black over a square footprint. Mode is `Replace`:
/// the destination pixel is cleared outright.
pub struct HardEraserBrush;

impl Brush for HardEraserBrush {
    fn name(&self) -> &'static str {
        "hard eraser"
    }

    fn mode(&self) -> WriteMode {
        WriteMode::Replace
    }

    fn stamp(&self, x: i32, y: i32, _color: Pixel, size: u8, _pressure: u8, _angle: i32, emit: Emit) {
        let r = size as i32 / 2;
        for i in -r..=r {
            for j in -r..=r {
                emit(x + i, y + j, Pixel::TRANSPARENT);
            }
        }
    }
}

/// Cubic radial falloff scaled by pressure and opacity. The emitted alpha
/// is the erase strength only; the layer subtracts it from the destination
/// alpha.
pub struct SoftEraserBrush {
    pub opacity: u8,
}

impl Brush for SoftEraserBrush {
    fn name(&self) -> &'static str {
        "soft eraser"
    }

    fn mode(&self) -> WriteMode {
        WriteMode::EraseSubtract
    }

    fn stamp(&self, x: i32, y: i32, _color: Pixel, size: u8, pressure: u8, _angle: i32, emit: Emit) {
        let radius = size as f32 / 2.0;
        if radius < 0.5 {
            let strength = pressure as f32 / 255.0 * self.opacity as f32 / 255.0;
            emit(x, y, Pixel::rgba(0, 0, 0, (strength * 255.0).round() as u8));
            return;
        }
        let p = pressure as f32 / 255.0;
        let o = self.opacity as f32 / 255.0;
        let r = radius.ceil() as i32;
        for i in -r..=r {
            for j in -r..=r {
                let d = ((i * i + j * j) as f32).sqrt();
                if d > radius {
                    continue;
                }
                let t = 1.0 - d / radius;
                let strength = t * t * t * p * o;
                let a = (strength * 255.0).round() as u8;
                if a > 0 {
                    emit(x + i, y + j, Pixel::rgba(0, 0, 0, a));
                }
            }
        }
    }
}

/// Pressure-sensitive disc: effective diameter `size·(0.3 + 0.7p)`, a
/// 1.5-pixel feathered edge, and alpha curve `0.2 + 0.8·√p`.
pub struct PressureBrush;

impl Brush for PressureBrush {
    fn name(&self) -> &'static str {
        "pressure"
    }

    fn stamp(&self, x: i32, y: i32, color: Pixel, size: u8, pressure: u8, _angle: i32, emit: Emit) {
        let p = pressure as f32 / 255.0;
        let radius = size as f32 * (0.3 + 0.7 * p) / 2.0;
        let alpha = 0.2 + 0.8 * p.sqrt();
        if radius < 0.5 {
            emit(x, y, color.with_alpha_scaled((alpha * 255.0).round() as u8));
            return;
        }
        let r = radius.ceil() as i32;
        for i in -r..=r {
            for j in -r..=r {
                let d = ((i * i + j * j) as f32).sqrt();
                if d > radius {
                    continue;
                }
                let feather = ((radius - d) / 1.5).clamp(0.0, 1.0);
                let a = (color.a as f32 * alpha * feather).round() as u8;
                if a > 0 {
                    emit(x + i, y + j, Pixel { a, ..color });
                }
            }
        }
    }
}

/// Soft spray: radius `size·(0.5 + 0.5p)`, squared radial falloff, alpha
/// multiplier `0.15 + 0.85p`.
pub struct AirbrushBrush {
    pub opacity: u8,
}

impl Brush for AirbrushBrush {
    fn name(&self) -> &'static str {
        "airbrush"
    }

    fn stamp(&self, x: i32, y: i32, color: Pixel, size: u8, pressure: u8, _angle: i32, emit: Emit) {
        let p = pressure as f32 / 255.0;
        let radius = size as f32 * (0.5 + 0.5 * p);
        let mult = (0.15 + 0.85 * p) * self.opacity as f32 / 255.0;
        if radius < 0.5 {
            emit(x, y, color.with_alpha_scaled((mult * 255.0).round() as u8));
            return;
        }
        let r = radius.ceil() as i32;
        for i in -r..=r {
            for j in -r..=r {
                let d = ((i * i + j * j) as f32).sqrt();
                if d > radius {
                    continue;
                }
                let falloff = (1.0 - d / radius) * (1.0 - d / radius);
                let a = (color.a as f32 * falloff * mult).round() as u8;
                if a > 0 {
                    emit(x + i, y + j, Pixel { a, ..color });
                }
            }
        }
    }
}

/// Fixed per-bristle weights for the textured brush. 32 samples, hashed
/// from the bristle index so both ends of the wire agree.
const BRISTLE_PATTERN: [f32; 32] = [
    0.91, 0.34, 0.67, 0.82, 0.23, 0.55, 0.98, 0.41, 0.73, 0.29, 0.86, 0.50, 0.64, 0.95, 0.38,
    0.77, 0.45, 0.88, 0.31, 0.70, 0.59, 0.93, 0.26, 0.81, 0.48, 0.66, 0.37, 0.84, 0.53, 0.75,
    0.42, 0.89,
];

/// Bristled stroke brush: a row of single-pixel stamps laid out
/// perpendicular to the stroke direction, weighted by a fixed 32-sample
/// bristle pattern, a `√pressure` curve, and quartic falloff toward the
/// stroke edges.
pub struct TexturedBrush;

impl Brush for TexturedBrush {
    fn name(&self) -> &'static str {
        "textured"
    }

    fn stamp(&self, x: i32, y: i32, color: Pixel, size: u8, pressure: u8, angle: i32, emit: Emit) {
        let theta = (angle as f32).to_radians();
        let (perp_x, perp_y) = (-theta.sin(), theta.cos());
        let p = (pressure as f32 / 255.0).sqrt();
        let half = size as f32 / 2.0;
        for (k, weight) in BRISTLE_PATTERN.iter().enumerate() {
            let t = k as f32 / 31.0 - 0.5;
            let off = t * size as f32;
            let u = if half > 0.0 { (off.abs() / half).min(1.0) } else { 0.0 };
            let tip = 1.0 - u * u * u * u;
            let a = (color.a as f32 * weight * p * tip).round() as u8;
            if a == 0 {
                continue;
            }
            let bx = (x as f32 + perp_x * off).round() as i32;
            let by = (y as f32 + perp_y * off).round() as i32;
            emit(bx, by, Pixel { a, ..color });
        }
    }
}

/// Ordered brush registry, indexed by the wire `brush_id`.
pub struct BrushCatalog {
    brushes: Vec<Box<dyn Brush>>,
}

impl BrushCatalog {
    /// The standard catalog in wire order. Ids are positional and must not
    /// be reordered.
    pub fn standard() -> Self {
        Self {
            brushes: vec![
                Box::new(RoundBrush { opacity: 255 }),
                Box::new(SquareBrush),
                Box::new(HardEraserBrush),
                Box::new(SoftEraserBrush { opacity: 255 }),
                Box::new(PressureBrush),
                Box::new(AirbrushBrush { opacity: 255 }),
                Box::new(TexturedBrush),
            ],
        }
    }

    /// Look up a brush by wire id. Unknown ids return `None` and the
    /// datagram is dropped by the caller.
    pub fn get(&self, id: u8) -> Option<&dyn Brush> {
        self.brushes.get(id as usize).map(|b| b.as_ref())
    }

    pub fn len(&self) -> usize {
        self.brushes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.brushes.is_empty()
    }
}

impl Default for BrushCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(brush: &dyn Brush, color: Pixel, size: u8, pressure: u8, angle: i32) -> Vec<(i32, i32, Pixel)> {
        let mut out = Vec::new();
        brush.stamp(100, 100, color, size, pressure, angle, &mut |x, y, p| {
            out.push((x, y, p))
        });
        out
    }

    #[test]
    fn test_catalog_order() {
        let catalog = BrushCatalog::standard();
        assert_eq!(catalog.len(), 7);
        let names: Vec<_> = (0..7).map(|i| catalog.get(i).unwrap().name()).collect();
        assert_eq!(
            names,
            vec!["round", "square", "hard eraser", "soft eraser", "pressure", "airbrush", "textured"]
        );
        assert!(catalog.get(7).is_none());
    }

    #[test]
    fn test_round_disc_geometry() {
        let black = Pixel::rgba(0, 0, 0, 255);
        let writes = collect(&RoundBrush { opacity: 255 }, black, 5, 255, 0);
        // size 5 → radius 2: exactly the pixels with dx² + dy² ≤ 4.
        for (x, y, p) in &writes {
            let (dx, dy) = (x - 100, y - 100);
            assert!(dx * dx + dy * dy <= 4);
            assert_eq!(*p, black);
        }
        assert_eq!(writes.len(), 13);
    }

    #[test]
    fn test_round_degenerates_to_point() {
        let writes = collect(&RoundBrush { opacity: 255 }, Pixel::WHITE, 1, 255, 0);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, 100);
        assert_eq!(writes[0].1, 100);
    }

    #[test]
    fn test_round_applies_opacity() {
        let writes = collect(&RoundBrush { opacity: 128 }, Pixel::rgba(10, 10, 10, 255), 3, 255, 0);
        assert!(writes.iter().all(|(_, _, p)| p.a == 128));
    }

    #[test]
    fn test_hard_eraser_square_footprint() {
        let writes = collect(&HardEraserBrush, Pixel::rgba(255, 0, 0, 255), 10, 255, 0);
        // size 10 → half-width 5: the full 11×11 square, all transparent.
        assert_eq!(writes.len(), 121);
        for (x, y, p) in &writes {
            assert!((x - 100).abs() <= 5 && (y - 100).abs() <= 5);
            assert_eq!(*p, Pixel::TRANSPARENT);
        }
        assert_eq!(HardEraserBrush.mode(), WriteMode::Replace);
    }

    #[test]
    fn test_soft_eraser_strength_falls_off() {
        let brush = SoftEraserBrush { opacity: 255 };
        let writes = collect(&brush, Pixel::WHITE, 20, 255, 0);
        assert_eq!(brush.mode(), WriteMode::EraseSubtract);
        let center = writes.iter().find(|(x, y, _)| *x == 100 && *y == 100).unwrap();
        let edge = writes.iter().map(|(_, _, p)| p.a).min().unwrap();
        assert!(center.2.a > edge);
        // Output carries erase strength in alpha only.
        assert!(writes.iter().all(|(_, _, p)| p.r == 0 && p.g == 0 && p.b == 0));
    }

    #[test]
    fn test_soft_eraser_scales_with_pressure() {
        let brush = SoftEraserBrush { opacity: 255 };
        let hard = collect(&brush, Pixel::WHITE, 20, 255, 0);
        let light = collect(&brush, Pixel::WHITE, 20, 64, 0);
        let max = |w: &[(i32, i32, Pixel)]| w.iter().map(|(_, _, p)| p.a).max().unwrap();
        assert!(max(&hard) > max(&light));
    }

    #[test]
    fn test_pressure_brush_diameter_grows() {
        let full = collect(&PressureBrush, Pixel::rgba(0, 0, 0, 255), 20, 255, 0);
        let light = collect(&PressureBrush, Pixel::rgba(0, 0, 0, 255), 20, 25, 0);
        let extent = |w: &[(i32, i32, Pixel)]| {
            w.iter().map(|(x, _, _)| (x - 100).abs()).max().unwrap()
        };
        assert!(extent(&full) > extent(&light));
    }

    #[test]
    fn test_airbrush_alpha_below_source_at_half_pressure() {
        let writes = collect(&AirbrushBrush { opacity: 255 }, Pixel::rgba(0, 0, 0, 255), 10, 128, 0);
        assert!(writes.iter().all(|(_, _, p)| p.a < 255));
        assert!(!writes.is_empty());
    }

    #[test]
    fn test_textured_lays_bristles_perpendicular() {
        let writes = collect(&TexturedBrush, Pixel::rgba(0, 0, 0, 255), 16, 255, 0);
        // Stroke direction 0° → bristle row is vertical.
        assert!(writes.iter().all(|(x, _, _)| *x == 100));
        assert!(writes.iter().any(|(_, y, _)| *y != 100));
    }

    #[test]
    fn test_textured_pressure_curve() {
        let full = collect(&TexturedBrush, Pixel::rgba(0, 0, 0, 255), 16, 255, 90);
        let light = collect(&TexturedBrush, Pixel::rgba(0, 0, 0, 255), 16, 64, 90);
        let max = |w: &[(i32, i32, Pixel)]| w.iter().map(|(_, _, p)| p.a).max().unwrap();
        assert!(max(&full) > max(&light));
    }

    #[test]
    fn test_stamps_are_deterministic() {
        let a = collect(&TexturedBrush, Pixel::rgba(1, 2, 3, 200), 12, 180, 45);
        let b = collect(&TexturedBrush, Pixel::rgba(1, 2, 3, 200), 12, 180, 45);
        assert_eq!(a, b);
    }
}
