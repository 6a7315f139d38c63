use bytes::Bytes;
use image::{imageops, GrayImage};

use crate::error::{PipelineError, PipelineResult};

/// A single plane of pixel bytes.
#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Bytes,
    /// Bytes between the starts of two consecutive rows.
    pub row_stride: usize,
}

impl Plane {
    pub fn new(data: impl Into<Bytes>, row_stride: usize) -> Self {
        Self { data: data.into(), row_stride }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelLayout {
    /// Planar YUV 4:2:0; plane 0 is luma, chroma planes are ignored.
    #[default]
    Yuv420,
    /// Single packed plane, 4 bytes per pixel in B, G, R, A order.
    Bgra,
}

impl PixelLayout {
    fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Yuv420 => 1,
            PixelLayout::Bgra => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn from_degrees(degrees: u32) -> PipelineResult<Self> {
        match degrees {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            other => Err(PipelineError::invalid_frame(format!(
                "unsupported rotation {other} (expected 0, 90, 180 or 270)"
            ))),
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// The rotation that undoes this one.
    pub fn inverse(self) -> Self {
        match self {
            Rotation::Deg0 => Rotation::Deg0,
            Rotation::Deg90 => Rotation::Deg270,
            Rotation::Deg180 => Rotation::Deg180,
            Rotation::Deg270 => Rotation::Deg90,
        }
    }

    pub fn swaps_dimensions(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// One captured frame, owned by the analysis thread for a single callback.
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub rotation_degrees: u32,
    pub layout: PixelLayout,
    pub planes: Vec<Plane>,
    release: Option<ReleaseHook>,
}

impl Frame {
    pub fn new(width: u32, height: u32, rotation_degrees: u32, layout: PixelLayout, planes: Vec<Plane>) -> Self {
        Self { width, height, rotation_degrees, layout, planes, release: None }
    }

    /// Attach the hook that hands the frame's buffers back to the capture system.
    pub fn with_release(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(hook));
        self
    }

    /// Wrap an already-decoded grayscale image as a tightly packed luma frame.
    pub fn from_luma(image: &GrayImage, rotation_degrees: u32) -> Self {
        let (width, height) = image.dimensions();
        let plane = Plane::new(image.as_raw().clone(), width as usize);
        Self::new(width, height, rotation_degrees, PixelLayout::Yuv420, vec![plane])
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("rotation_degrees", &self.rotation_degrees)
            .field("layout", &self.layout)
            .field("planes", &self.planes.len())
            .finish()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Single-channel, upright, row-major intensity buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedBuffer {
    image: GrayImage,
}

impl NormalizedBuffer {
    pub fn from_image(image: GrayImage) -> Self {
        Self { image }
    }

    /// Remove a reported capture rotation.
    ///
    /// 90: transpose, then mirror columns. 180: mirror both axes.
    /// 270: transpose, then mirror rows.
    pub fn upright(gray: GrayImage, rotation: Rotation) -> Self {
        let image = match rotation {
            Rotation::Deg0 => gray,
            Rotation::Deg90 => imageops::rotate90(&gray),
            Rotation::Deg180 => imageops::rotate180(&gray),
            Rotation::Deg270 => imageops::rotate270(&gray),
        };
        Self { image }
    }

    /// Apply the same canonicalization to an existing buffer.
    pub fn rotated(&self, rotation: Rotation) -> Self {
        Self::upright(self.image.clone(), rotation)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn as_raw(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }
}

/// Convert a captured frame into the upright luma buffer the detector consumes.
///
/// The frame is consumed and released before this returns, on success or error.
pub fn normalize(frame: Frame) -> PipelineResult<NormalizedBuffer> {
    let extracted = Rotation::from_degrees(frame.rotation_degrees)
        .and_then(|rotation| extract_intensity(&frame).map(|gray| (gray, rotation)));
    drop(frame);
    let (gray, rotation) = extracted?;
    Ok(NormalizedBuffer::upright(gray, rotation))
}

fn extract_intensity(frame: &Frame) -> PipelineResult<GrayImage> {
    if frame.width == 0 || frame.height == 0 {
        return Err(PipelineError::invalid_frame(format!(
            "zero dimension {}x{}",
            frame.width, frame.height
        )));
    }
    let plane = frame
        .planes
        .first()
        .ok_or_else(|| PipelineError::invalid_frame("frame has no planes"))?;
    if plane.data.is_empty() {
        return Err(PipelineError::invalid_frame("plane 0 has no data"));
    }

    let w = frame.width as usize;
    let h = frame.height as usize;
    let bpp = frame.layout.bytes_per_pixel();
    let row_bytes = w
        .checked_mul(bpp)
        .ok_or_else(|| PipelineError::invalid_frame("row size overflow"))?;
    if plane.row_stride < row_bytes {
        return Err(PipelineError::invalid_frame(format!(
            "row stride {} shorter than row of {} bytes",
            plane.row_stride, row_bytes
        )));
    }
    // The last row may omit its stride padding.
    let needed = (h - 1)
        .checked_mul(plane.row_stride)
        .and_then(|v| v.checked_add(row_bytes))
        .ok_or_else(|| PipelineError::invalid_frame("plane size overflow"))?;
    if plane.data.len() < needed {
        return Err(PipelineError::invalid_frame(format!(
            "plane 0 holds {} bytes, {}x{} needs {}",
            plane.data.len(),
            w,
            h,
            needed
        )));
    }

    // Always read from the start of the plane, row by row.
    let src = &plane.data[..];
    let mut luma = Vec::with_capacity(w * h);
    for row in 0..h {
        let start = row * plane.row_stride;
        let line = &src[start..start + row_bytes];
        match frame.layout {
            PixelLayout::Yuv420 => luma.extend_from_slice(line),
            PixelLayout::Bgra => luma.extend(line.chunks_exact(4).map(bgra_to_luma)),
        }
    }

    GrayImage::from_raw(frame.width, frame.height, luma)
        .ok_or_else(|| PipelineError::invalid_frame("luma buffer does not match dimensions"))
}

fn bgra_to_luma(px: &[u8]) -> u8 {
    let b = px[0] as f32;
    let g = px[1] as f32;
    let r = px[2] as f32;
    (0.299 * r + 0.587 * g + 0.114 * b).round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    // 3 wide, 2 high:
    //   1 2 3
    //   4 5 6
    fn sample() -> Vec<u8> {
        vec![1, 2, 3, 4, 5, 6]
    }

    fn luma_frame(data: Vec<u8>, w: u32, h: u32, stride: usize, rotation: u32) -> Frame {
        Frame::new(w, h, rotation, PixelLayout::Yuv420, vec![Plane::new(data, stride)])
    }

    fn counted(frame: Frame, counter: &Arc<AtomicUsize>) -> Frame {
        let c = counter.clone();
        frame.with_release(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn rotation_zero_is_identity() {
        let out = normalize(luma_frame(sample(), 3, 2, 3, 0)).unwrap();
        assert_eq!((out.width(), out.height()), (3, 2));
        assert_eq!(out.as_raw(), &sample()[..]);
    }

    #[test]
    fn rotation_90_is_transpose_then_column_flip() {
        let out = normalize(luma_frame(sample(), 3, 2, 3, 90)).unwrap();
        // transpose: [1 4; 2 5; 3 6], then mirror columns
        assert_eq!((out.width(), out.height()), (2, 3));
        assert_eq!(out.as_raw(), &[4, 1, 5, 2, 6, 3]);
    }

    #[test]
    fn rotation_180_flips_both_axes() {
        let out = normalize(luma_frame(sample(), 3, 2, 3, 180)).unwrap();
        assert_eq!((out.width(), out.height()), (3, 2));
        assert_eq!(out.as_raw(), &[6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn rotation_270_is_transpose_then_row_flip() {
        let out = normalize(luma_frame(sample(), 3, 2, 3, 270)).unwrap();
        // transpose: [1 4; 2 5; 3 6], then mirror rows
        assert_eq!((out.width(), out.height()), (2, 3));
        assert_eq!(out.as_raw(), &[3, 6, 2, 5, 1, 4]);
    }

    #[test]
    fn stride_padding_is_skipped() {
        let padded = vec![1, 2, 3, 99, 99, 4, 5, 6, 99, 99];
        let out = normalize(luma_frame(padded, 3, 2, 5, 0)).unwrap();
        assert_eq!(out.as_raw(), &sample()[..]);
    }

    #[test]
    fn last_row_may_omit_padding() {
        let padded = vec![1, 2, 3, 99, 4, 5, 6];
        let out = normalize(luma_frame(padded, 3, 2, 4, 0)).unwrap();
        assert_eq!(out.as_raw(), &sample()[..]);
    }

    #[test]
    fn chroma_planes_are_ignored() {
        let planes = vec![
            Plane::new(sample(), 3),
            Plane::new(vec![200u8; 2], 2),
            Plane::new(vec![50u8; 2], 2),
        ];
        let frame = Frame::new(3, 2, 0, PixelLayout::Yuv420, planes);
        assert_eq!(normalize(frame).unwrap().as_raw(), &sample()[..]);
    }

    #[test]
    fn bgra_plane_is_converted_to_luma() {
        // white, black, pure red, pure green
        let px = vec![
            255, 255, 255, 255, 0, 0, 0, 255, //
            0, 0, 255, 255, 0, 255, 0, 255,
        ];
        let frame = Frame::new(2, 2, 0, PixelLayout::Bgra, vec![Plane::new(px, 8)]);
        let out = normalize(frame).unwrap();
        assert_eq!(out.as_raw(), &[255, 0, 76, 150]);
    }

    #[test]
    fn zero_dimensions_are_invalid() {
        let err = normalize(luma_frame(sample(), 0, 2, 3, 0)).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidFrame(_)));
    }

    #[test]
    fn missing_plane_data_is_invalid() {
        let frame = Frame::new(3, 2, 0, PixelLayout::Yuv420, vec![]);
        assert!(matches!(normalize(frame), Err(PipelineError::InvalidFrame(_))));

        let empty = luma_frame(Vec::new(), 3, 2, 3, 0);
        assert!(matches!(normalize(empty), Err(PipelineError::InvalidFrame(_))));
    }

    #[test]
    fn short_plane_is_invalid() {
        let err = normalize(luma_frame(vec![1, 2, 3, 4], 3, 2, 3, 0)).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidFrame(_)));
    }

    #[test]
    fn unknown_rotation_is_invalid() {
        let err = normalize(luma_frame(sample(), 3, 2, 3, 45)).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidFrame(_)));
    }

    #[test]
    fn release_runs_once_on_success_and_failure() {
        let released = Arc::new(AtomicUsize::new(0));
        normalize(counted(luma_frame(sample(), 3, 2, 3, 90), &released)).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let released = Arc::new(AtomicUsize::new(0));
        normalize(counted(luma_frame(Vec::new(), 3, 2, 3, 90), &released)).unwrap_err();
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let released = Arc::new(AtomicUsize::new(0));
        normalize(counted(luma_frame(sample(), 3, 2, 3, 33), &released)).unwrap_err();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn inverse_pairs() {
        for deg in [0, 90, 180, 270] {
            let r = Rotation::from_degrees(deg).unwrap();
            assert_eq!(r.inverse().inverse(), r);
            assert_eq!((r.degrees() + r.inverse().degrees()) % 360, 0);
        }
    }
}
