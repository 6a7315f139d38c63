pub mod analysis;
pub mod camera;
pub mod detect;
pub mod doctor;
pub mod error;
pub mod frame;
pub mod mailbox;
pub mod model;
pub mod overlay;
pub mod render;

pub use analysis::{spawn_analysis_worker, Analyzer, AnalyzerStats, FrameAnalyzer, FrameFeed};
pub use detect::{DetectionResult, Detector, Region, ThresholdDetector, ThresholdModel};
pub use error::{PipelineError, PipelineResult};
pub use frame::{normalize, Frame, NormalizedBuffer, PixelLayout, Plane, Rotation};
pub use mailbox::{FileMailbox, Mailbox, SlotMailbox};
pub use model::ModelResource;
pub use overlay::{OverlayFrame, OverlayRenderer, OverlayStyle};
pub use render::{DisplaySlot, OverlaySink, RenderLoop, RenderState, RenderTiming};
