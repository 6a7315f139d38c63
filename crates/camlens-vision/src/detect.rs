use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::frame::NormalizedBuffer;

/// Axis-aligned box in normalized-buffer pixels, half-open on the right and bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Region {
    /// Returns `None` unless `left < right` and `top < bottom`.
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Option<Self> {
        (left < right && top < bottom).then_some(Self { left, top, right, bottom })
    }

    pub fn width(&self) -> i64 {
        self.right as i64 - self.left as i64
    }

    pub fn height(&self) -> i64 {
        self.bottom as i64 - self.top as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionResult {
    Empty,
    Region(Region),
}

impl DetectionResult {
    pub fn region(&self) -> Option<Region> {
        match self {
            DetectionResult::Empty => None,
            DetectionResult::Region(r) => Some(*r),
        }
    }
}

pub trait Detector: Send {
    fn name(&self) -> &'static str;

    /// Run detection on one buffer. Must not retain the buffer.
    fn detect(&mut self, model: &Path, buffer: &NormalizedBuffer) -> PipelineResult<DetectionResult>;
}

/// Parameters of the threshold model file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ThresholdModel {
    /// Intensity at or above which a pixel counts as foreground.
    pub threshold: u8,
    /// Smallest accepted box side, in pixels.
    pub min_size: u32,
    /// Fraction of the box width trimmed from each side.
    #[serde(default)]
    pub horizontal_inset: f32,
    /// Fraction of the box height added above and below.
    #[serde(default)]
    pub vertical_pad: f32,
}

impl ThresholdModel {
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::DetectorUnavailable {
            model: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let model: ThresholdModel = toml::from_str(&text)
            .map_err(|e| PipelineError::DetectorFault(format!("parse model {}: {}", path.display(), e)))?;
        if !(0.0..0.5).contains(&model.horizontal_inset) || !(0.0..=1.0).contains(&model.vertical_pad) {
            return Err(PipelineError::DetectorFault(format!(
                "model {} has out-of-range padding",
                path.display()
            )));
        }
        Ok(model)
    }
}

/// Finds the bounding box of bright pixels.
#[derive(Debug, Default)]
pub struct ThresholdDetector {
    models: HashMap<PathBuf, ThresholdModel>,
}

impl ThresholdDetector {
    pub fn new() -> Self {
        Self::default()
    }

    fn model(&mut self, path: &Path) -> PipelineResult<&ThresholdModel> {
        if !self.models.contains_key(path) {
            let model = ThresholdModel::load(path)?;
            debug!(model = %path.display(), "detector: loaded threshold model");
            self.models.insert(path.to_path_buf(), model);
        }
        self.models
            .get(path)
            .ok_or_else(|| PipelineError::DetectorFault("model cache miss".into()))
    }
}

impl Detector for ThresholdDetector {
    fn name(&self) -> &'static str {
        "threshold"
    }

    fn detect(&mut self, model: &Path, buffer: &NormalizedBuffer) -> PipelineResult<DetectionResult> {
        let model = self.model(model)?.clone();
        Ok(threshold_region(&model, buffer).map_or(DetectionResult::Empty, DetectionResult::Region))
    }
}

fn threshold_region(model: &ThresholdModel, buffer: &NormalizedBuffer) -> Option<Region> {
    let w = buffer.width();
    let h = buffer.height();
    let mut min_x = u32::MAX;
    let mut min_y = u32::MAX;
    let mut max_x = 0u32;
    let mut max_y = 0u32;
    let mut found = false;

    for (x, y, px) in buffer.image().enumerate_pixels() {
        if px.0[0] >= model.threshold {
            found = true;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    if !found {
        return None;
    }

    let box_w = max_x - min_x + 1;
    let box_h = max_y - min_y + 1;
    if box_w < model.min_size || box_h < model.min_size {
        return None;
    }

    let inset = (model.horizontal_inset * box_w as f32) as i64;
    let pad = (model.vertical_pad * box_h as f32) as i64;
    let within = |v: i64, size: u32| v.clamp(0, (size as i64).min(i32::MAX as i64)) as i32;
    Region::new(
        within(min_x as i64 + inset, w),
        within(min_y as i64 - pad, h),
        within(max_x as i64 + 1 - inset, w),
        within(max_y as i64 + 1 + pad, h),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use std::io::Write;

    fn model_file(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    fn with_square(w: u32, h: u32, l: u32, t: u32, r: u32, b: u32) -> NormalizedBuffer {
        let mut img = GrayImage::from_pixel(w, h, Luma([20]));
        for y in t..b {
            for x in l..r {
                img.put_pixel(x, y, Luma([240]));
            }
        }
        NormalizedBuffer::from_image(img)
    }

    #[test]
    fn region_requires_positive_extent() {
        assert!(Region::new(10, 10, 10, 20).is_none());
        assert!(Region::new(10, 20, 30, 5).is_none());
        let r = Region::new(10, 10, 50, 60).unwrap();
        assert_eq!((r.width(), r.height()), (40, 50));
        let wide = Region::new(i32::MIN, 0, i32::MAX, 10).unwrap();
        assert_eq!(wide.width(), u32::MAX as i64);
    }

    #[test]
    fn blank_buffer_is_empty() {
        let m = model_file("threshold = 200\nmin_size = 4\n");
        let mut det = ThresholdDetector::new();
        let buf = NormalizedBuffer::from_image(GrayImage::from_pixel(32, 32, Luma([10])));
        assert_eq!(det.detect(m.path(), &buf).unwrap(), DetectionResult::Empty);
    }

    #[test]
    fn bright_square_is_boxed() {
        let m = model_file("threshold = 200\nmin_size = 4\n");
        let mut det = ThresholdDetector::new();
        let buf = with_square(200, 100, 10, 10, 50, 60);
        assert_eq!(
            det.detect(m.path(), &buf).unwrap(),
            DetectionResult::Region(Region { left: 10, top: 10, right: 50, bottom: 60 })
        );
    }

    #[test]
    fn padding_trims_sides_and_grows_vertically() {
        let m = model_file("threshold = 200\nmin_size = 4\nhorizontal_inset = 0.1\nvertical_pad = 0.1\n");
        let mut det = ThresholdDetector::new();
        let buf = with_square(200, 100, 20, 20, 60, 70);
        let r = det.detect(m.path(), &buf).unwrap().region().unwrap();
        assert_eq!(r, Region { left: 24, top: 15, right: 56, bottom: 75 });
    }

    #[test]
    fn vertical_pad_is_clamped_to_buffer() {
        let m = model_file("threshold = 200\nmin_size = 4\nvertical_pad = 0.5\n");
        let mut det = ThresholdDetector::new();
        let buf = with_square(40, 40, 5, 2, 25, 38);
        let r = det.detect(m.path(), &buf).unwrap().region().unwrap();
        assert_eq!((r.top, r.bottom), (0, 40));
    }

    #[test]
    fn small_blob_is_rejected() {
        let m = model_file("threshold = 200\nmin_size = 16\n");
        let mut det = ThresholdDetector::new();
        let buf = with_square(64, 64, 4, 4, 10, 10);
        assert_eq!(det.detect(m.path(), &buf).unwrap(), DetectionResult::Empty);
    }

    #[test]
    fn missing_model_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut det = ThresholdDetector::new();
        let buf = with_square(8, 8, 0, 0, 4, 4);
        let err = det.detect(&dir.path().join("nope.toml"), &buf).unwrap_err();
        assert!(matches!(err, PipelineError::DetectorUnavailable { .. }));
    }

    #[test]
    fn oversized_padding_is_rejected_as_fault() {
        let m = model_file("threshold = 200\nmin_size = 1\nvertical_pad = 1e12\n");
        let mut det = ThresholdDetector::new();
        let buf = with_square(8, 8, 3, 3, 4, 4);
        assert!(matches!(det.detect(m.path(), &buf), Err(PipelineError::DetectorFault(_))));
    }

    #[test]
    fn full_padding_stays_inside_buffer() {
        let m = model_file("threshold = 200\nmin_size = 1\nvertical_pad = 1.0\n");
        let mut det = ThresholdDetector::new();
        let buf = with_square(16, 16, 4, 6, 12, 10);
        let r = det.detect(m.path(), &buf).unwrap().region().unwrap();
        assert_eq!(r, Region { left: 4, top: 2, right: 12, bottom: 14 });
    }

    #[test]
    fn malformed_model_is_fault() {
        let m = model_file("threshold = \"bright\"\n");
        let mut det = ThresholdDetector::new();
        let buf = with_square(8, 8, 0, 0, 4, 4);
        assert!(matches!(det.detect(m.path(), &buf), Err(PipelineError::DetectorFault(_))));
    }
}
