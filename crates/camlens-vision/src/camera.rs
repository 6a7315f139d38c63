use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use image::{GrayImage, Luma};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::analysis::FrameFeed;
use crate::frame::{Frame, NormalizedBuffer, PixelLayout, Plane, Rotation};

const BACKGROUND: u8 = 30;
const FOREGROUND: u8 = 235;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    /// Sensor rotation reported with every frame: 0, 90, 180 or 270.
    pub rotation: u32,
    pub fps: u32,
    /// Extra bytes at the end of each row.
    #[serde(default)]
    pub row_padding: usize,
    #[serde(default)]
    pub layout: PixelLayout,
}

/// Test-pattern capture source: a bright square sliding across a dark scene.
///
/// The scene is composed upright and stored in sensor orientation, so a
/// correct normalizer gets the upright scene back. The square is hidden for
/// one quarter of every 120-frame cycle.
pub struct SyntheticCamera {
    cfg: CameraConfig,
    rotation: Rotation,
    tick: u64,
    released: Arc<AtomicU64>,
}

impl SyntheticCamera {
    pub fn new(cfg: CameraConfig) -> Result<Self> {
        anyhow::ensure!(cfg.width > 0 && cfg.height > 0, "camera dimensions must be non-zero");
        anyhow::ensure!(cfg.fps > 0, "camera.fps must be > 0");
        let rotation = Rotation::from_degrees(cfg.rotation)?;
        Ok(Self { cfg, rotation, tick: 0, released: Arc::new(AtomicU64::new(0)) })
    }

    /// Dimensions of frames after normalization.
    pub fn upright_dimensions(&self) -> (u32, u32) {
        if self.rotation.swaps_dimensions() {
            (self.cfg.height, self.cfg.width)
        } else {
            (self.cfg.width, self.cfg.height)
        }
    }

    /// Number of produced frames whose buffers have been handed back.
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    /// The upright scene for a given frame number.
    pub fn scene(&self, tick: u64) -> GrayImage {
        let (w, h) = self.upright_dimensions();
        let mut img = GrayImage::from_pixel(w, h, Luma([BACKGROUND]));
        if (tick / 30) % 4 == 3 {
            return img;
        }
        let side = (w.min(h) / 4).max(1);
        let span = (w - side).max(1) as u64;
        let x0 = ((tick * 4) % span) as u32;
        let y0 = (h - side) / 2;
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                img.put_pixel(x, y, Luma([FOREGROUND]));
            }
        }
        img
    }

    pub fn next_frame(&mut self) -> Frame {
        let scene = self.scene(self.tick);
        self.tick += 1;
        let captured = NormalizedBuffer::upright(scene, self.rotation.inverse());
        let planes = match self.cfg.layout {
            PixelLayout::Yuv420 => self.yuv_planes(captured.as_raw()),
            PixelLayout::Bgra => self.bgra_planes(captured.as_raw()),
        };
        let released = self.released.clone();
        Frame::new(self.cfg.width, self.cfg.height, self.cfg.rotation, self.cfg.layout, planes).with_release(move || {
            released.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn yuv_planes(&self, luma: &[u8]) -> Vec<Plane> {
        let w = self.cfg.width as usize;
        let stride = w + self.cfg.row_padding;
        let mut y_plane = Vec::with_capacity(stride * self.cfg.height as usize);
        for row in luma.chunks_exact(w) {
            y_plane.extend_from_slice(row);
            y_plane.resize(y_plane.len() + self.cfg.row_padding, 0);
        }
        let cw = (w + 1) / 2;
        let ch = (self.cfg.height as usize + 1) / 2;
        vec![
            Plane::new(y_plane, stride),
            Plane::new(vec![128u8; cw * ch], cw),
            Plane::new(vec![128u8; cw * ch], cw),
        ]
    }

    fn bgra_planes(&self, luma: &[u8]) -> Vec<Plane> {
        let w = self.cfg.width as usize;
        let stride = w * 4 + self.cfg.row_padding;
        let mut data = Vec::with_capacity(stride * self.cfg.height as usize);
        for row in luma.chunks_exact(w) {
            for &v in row {
                data.extend_from_slice(&[v, v, v, 0xff]);
            }
            data.resize(data.len() + self.cfg.row_padding, 0);
        }
        vec![Plane::new(data, stride)]
    }

    /// Push frames into `feed` at the configured rate until shutdown.
    /// Returns the number of frames produced.
    pub fn spawn(mut self, feed: Arc<FrameFeed>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<u64> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / self.cfg.fps as f64));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut produced = 0u64;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !feed.submit(self.next_frame()) {
                            break;
                        }
                        produced += 1;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(produced, released = self.released(), "camera: stopped");
            produced
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::normalize;

    fn cfg(rotation: u32, layout: PixelLayout) -> CameraConfig {
        CameraConfig { width: 48, height: 32, rotation, fps: 30, row_padding: 5, layout }
    }

    #[test]
    fn frames_normalize_to_upright_scene() {
        for layout in [PixelLayout::Yuv420, PixelLayout::Bgra] {
            for rotation in [0, 90, 180, 270] {
                let mut cam = SyntheticCamera::new(cfg(rotation, layout)).unwrap();
                for tick in 0..3 {
                    let frame = cam.next_frame();
                    assert_eq!((frame.width, frame.height), (48, 32));
                    let upright = normalize(frame).unwrap();
                    assert_eq!(upright.image(), &cam.scene(tick), "rotation {rotation} {layout:?}");
                }
                assert_eq!(cam.released(), 3);
            }
        }
    }

    #[test]
    fn square_hides_periodically() {
        let cam = SyntheticCamera::new(cfg(0, PixelLayout::Yuv420)).unwrap();
        assert!(cam.scene(0).pixels().any(|p| p.0[0] == FOREGROUND));
        assert!(cam.scene(95).pixels().all(|p| p.0[0] == BACKGROUND));
    }

    #[test]
    fn rejects_bad_rotation() {
        assert!(SyntheticCamera::new(cfg(45, PixelLayout::Yuv420)).is_err());
    }
}
