//! Pixel blending and line rasterization shared by server and clients.
//!
//! Everything in this module is normative for the wire: a client previewing
//! its own stroke and the server applying the same packet must produce the
//! same pixels, so both sides call these exact functions. Keep the math in
//! `f32` with the rounding spelled out here and nowhere else.

/// One RGBA pixel, straight (non-premultiplied) alpha.
///
/// Channel order is R, G, B, A both on the wire and in layer storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pixel {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Pixel {
    pub const TRANSPARENT: Pixel = Pixel { r: 0, g: 0, b: 0, a: 0 };
    pub const WHITE: Pixel = Pixel { r: 255, g: 255, b: 255, a: 255 };

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Scale the alpha channel by `m / 255`, leaving RGB untouched.
    pub fn with_alpha_scaled(self, m: u8) -> Self {
        let a = (self.a as u32 * m as u32 / 255) as u8;
        Pixel { a, ..self }
    }
}

/// How a produced pixel is combined with the destination.
///
/// Erasers do not feed ordinary source-over blending, so every brush
/// declares its mode and the layer branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Straight-alpha source-over blend.
    SourceOver,
    /// Overwrite the destination pixel unconditionally.
    Replace,
    /// Subtract the source alpha from the destination alpha, clamped at
    /// zero. RGB is untouched unless alpha reaches zero, in which case the
    /// pixel collapses to transparent black.
    EraseSubtract,
}

/// Straight-alpha source-over: `src` composited over `dst`.
///
/// `oa = sa + da·(1 − sa)`; a fully transparent result is transparent
/// black. Output alpha is `round(oa·255)`.
pub fn source_over(src: Pixel, dst: Pixel) -> Pixel {
    let sa = src.a as f32 / 255.0;
    let da = dst.a as f32 / 255.0;
    let oa = sa + da * (1.0 - sa);
    if oa == 0.0 {
        return Pixel::TRANSPARENT;
    }
    let blend = |s: u8, d: u8| -> u8 {
        ((s as f32 * sa + d as f32 * da * (1.0 - sa)) / oa).round() as u8
    };
    Pixel {
        r: blend(src.r, dst.r),
        g: blend(src.g, dst.g),
        b: blend(src.b, dst.b),
        a: (oa * 255.0).round() as u8,
    }
}

/// Apply a write mode to a destination pixel.
pub fn apply(mode: WriteMode, src: Pixel, dst: Pixel) -> Pixel {
    match mode {
        WriteMode::SourceOver => source_over(src, dst),
        WriteMode::Replace => src,
        WriteMode::EraseSubtract => {
            let a = dst.a.saturating_sub(src.a);
            if a == 0 {
                Pixel::TRANSPARENT
            } else {
                Pixel { a, ..dst }
            }
        }
    }
}

/// Integer Bresenham trajectory from `(x0, y0)` to `(x1, y1)`, endpoint
/// included.
///
/// The exact step order matters: the server stamps at every yielded point
/// and a client interpolating the same LINE packet must visit the identical
/// set, so this iterator is the single source of truth for both.
pub struct LinePoints {
    x: i32,
    y: i32,
    x1: i32,
    y1: i32,
    dx: i32,
    dy: i32,
    sx: i32,
    sy: i32,
    err: i32,
    done: bool,
}

impl LinePoints {
    pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        Self {
            x: x0,
            y: y0,
            x1,
            y1,
            dx,
            dy,
            sx: if x0 < x1 { 1 } else { -1 },
            sy: if y0 < y1 { 1 } else { -1 },
            err: dx + dy,
            done: false,
        }
    }
}

impl Iterator for LinePoints {
    type Item = (i32, i32);

    fn next(&mut self) -> Option<(i32, i32)> {
        if self.done {
            return None;
        }
        let point = (self.x, self.y);
        if self.x == self.x1 && self.y == self.y1 {
            self.done = true;
        } else {
            let e2 = 2 * self.err;
            if e2 >= self.dy {
                self.err += self.dy;
                self.x += self.sx;
            }
            if e2 <= self.dx {
                self.err += self.dx;
                self.y += self.sy;
            }
        }
        Some(point)
    }
}

/// Stroke angle in whole degrees for a line from `(x0, y0)` to `(x1, y1)`.
pub fn line_angle(x0: i32, y0: i32, x1: i32, y1: i32) -> i32 {
    ((y1 - y0) as f64).atan2((x1 - x0) as f64).to_degrees().round() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opaque_source_replaces() {
        let src = Pixel::rgba(10, 20, 30, 255);
        let dst = Pixel::rgba(200, 200, 200, 255);
        assert_eq!(source_over(src, dst), src);
    }

    #[test]
    fn test_transparent_source_keeps_destination() {
        let dst = Pixel::rgba(1, 2, 3, 200);
        assert_eq!(source_over(Pixel::TRANSPARENT, dst), dst);
    }

    #[test]
    fn test_both_transparent_is_transparent_black() {
        let src = Pixel::rgba(40, 50, 60, 0);
        let dst = Pixel::rgba(70, 80, 90, 0);
        assert_eq!(source_over(src, dst), Pixel::TRANSPARENT);
    }

    #[test]
    fn test_half_alpha_over_opaque_white() {
        let out = source_over(Pixel::rgba(0, 0, 0, 128), Pixel::WHITE);
        assert_eq!(out.a, 255);
        // 0·(128/255) + 255·1·(1 − 128/255) ≈ 127
        assert_eq!(out.r, 127);
        assert_eq!(out.g, out.r);
        assert_eq!(out.b, out.r);
    }

    #[test]
    fn test_erase_subtract_clamps_and_collapses() {
        let dst = Pixel::rgba(10, 20, 30, 100);
        let partial = apply(WriteMode::EraseSubtract, Pixel::rgba(0, 0, 0, 40), dst);
        assert_eq!(partial, Pixel::rgba(10, 20, 30, 60));
        let gone = apply(WriteMode::EraseSubtract, Pixel::rgba(0, 0, 0, 200), dst);
        assert_eq!(gone, Pixel::TRANSPARENT);
    }

    #[test]
    fn test_replace_ignores_destination() {
        let src = Pixel::rgba(9, 8, 7, 6);
        assert_eq!(apply(WriteMode::Replace, src, Pixel::WHITE), src);
    }

    #[test]
    fn test_line_single_point() {
        let pts: Vec<_> = LinePoints::new(5, 5, 5, 5).collect();
        assert_eq!(pts, vec![(5, 5)]);
    }

    #[test]
    fn test_line_includes_both_endpoints() {
        let pts: Vec<_> = LinePoints::new(0, 0, 10, 5).collect();
        assert_eq!(pts.first(), Some(&(0, 0)));
        assert_eq!(pts.last(), Some(&(10, 5)));
        assert_eq!(pts.len(), 11);
    }

    #[test]
    fn test_line_vertical_and_negative() {
        let down: Vec<_> = LinePoints::new(3, 0, 3, 3).collect();
        assert_eq!(down, vec![(3, 0), (3, 1), (3, 2), (3, 3)]);
        let back: Vec<_> = LinePoints::new(2, 2, 0, 0).collect();
        assert_eq!(back, vec![(2, 2), (1, 1), (0, 0)]);
    }

    #[test]
    fn test_line_angle_quadrants() {
        assert_eq!(line_angle(0, 0, 10, 0), 0);
        assert_eq!(line_angle(0, 0, 0, 10), 90);
        assert_eq!(line_angle(0, 0, -10, 0), 180);
        assert_eq!(line_angle(0, 0, 10, 5), 27);
    }
}
