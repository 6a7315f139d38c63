use anyhow::{Context, Result};
use image::{imageops, Rgba, RgbaImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detect::{DetectionResult, Region};

pub const DEFAULT_STROKE_WIDTH: u32 = 6;
pub const DEFAULT_COLOR: Rgba<u8> = Rgba([0x3c, 0xd1, 0x84, 0xff]);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayStyle {
    pub stroke_width: u32,
    pub color: Rgba<u8>,
    /// Mirror the finished surface about its vertical centre line.
    pub mirror: bool,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self { stroke_width: DEFAULT_STROKE_WIDTH, color: DEFAULT_COLOR, mirror: true }
    }
}

/// Parse `#rrggbb` or `#rrggbbaa`.
pub fn parse_hex_color(s: &str) -> Result<Rgba<u8>> {
    let hex = s.strip_prefix('#').unwrap_or(s);
    anyhow::ensure!(
        hex.is_ascii() && (hex.len() == 6 || hex.len() == 8),
        "color {:?} must be #rrggbb or #rrggbbaa",
        s
    );
    let byte = |i: usize| {
        u8::from_str_radix(&hex[i..i + 2], 16).with_context(|| format!("color {:?} is not hex", s))
    };
    let alpha = if hex.len() == 8 { byte(6)? } else { 0xff };
    Ok(Rgba([byte(0)?, byte(2)?, byte(4)?, alpha]))
}

/// The surface produced by one render tick.
#[derive(Debug, Clone)]
pub struct OverlayFrame {
    pub tick: u64,
    /// The region drawn this tick, in normalized-buffer coordinates.
    pub region: Option<Region>,
    pub image: RgbaImage,
}

impl OverlayFrame {
    pub fn is_blank(&self) -> bool {
        self.image.pixels().all(|p| p.0[3] == 0)
    }

    /// Inclusive bounds `(min_x, min_y, max_x, max_y)` of every non-transparent pixel.
    pub fn opaque_bounds(&self) -> Option<(u32, u32, u32, u32)> {
        self.image
            .enumerate_pixels()
            .filter(|(_, _, p)| p.0[3] != 0)
            .fold(None, |acc, (x, y, _)| match acc {
                None => Some((x, y, x, y)),
                Some((x0, y0, x1, y1)) => Some((x0.min(x), y0.min(y), x1.max(x), y1.max(y))),
            })
    }
}

#[derive(Debug, Clone)]
pub struct OverlayRenderer {
    width: u32,
    height: u32,
    style: OverlayStyle,
}

impl OverlayRenderer {
    pub fn new(width: u32, height: u32, style: OverlayStyle) -> Self {
        Self { width, height, style }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Build the surface for one tick. `None` and `Empty` both give a cleared surface.
    pub fn render(&self, tick: u64, latest: Option<DetectionResult>) -> OverlayFrame {
        let mut surface = RgbaImage::new(self.width, self.height);
        let region = latest.and_then(|r| r.region());
        if let Some(r) = region {
            draw_outline(&mut surface, r, self.style.stroke_width, self.style.color);
        }
        let image = if self.style.mirror { mirror_horizontal(&surface) } else { surface };
        OverlayFrame { tick, region, image }
    }
}

/// Stroke an unfilled rectangle whose outer edge is exactly `region`.
///
/// The stroke grows inward; anything outside the surface is clipped.
pub fn draw_outline(surface: &mut RgbaImage, region: Region, stroke_width: u32, color: Rgba<u8>) {
    let stroke = stroke_width.max(1) as i64;
    // Edges more than a stroke off-surface paint nothing, so pulling them in
    // to that margin leaves the visible pixels unchanged.
    let span = |lo: i32, hi: i32, size: u32| {
        let limit = size as i64 + stroke;
        ((lo as i64).clamp(-stroke, limit), (hi as i64).clamp(-stroke, limit))
    };
    let (left, right) = span(region.left, region.right, surface.width());
    let (top, bottom) = span(region.top, region.bottom, surface.height());

    for k in 0..stroke {
        let w = right - left - 2 * k;
        let h = bottom - top - 2 * k;
        if w <= 0 || h <= 0 {
            break;
        }
        let rect = Rect::at((left + k) as i32, (top + k) as i32).of_size(w as u32, h as u32);
        draw_hollow_rect_mut(surface, rect, color);
    }
}

/// Scale -1 on x about the surface centre: column `x` moves to `width - 1 - x`.
pub fn mirror_horizontal(surface: &RgbaImage) -> RgbaImage {
    imageops::flip_horizontal(surface)
}
