use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::detect::{DetectionResult, Detector};
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{normalize, Frame};
use crate::mailbox::Mailbox;

/// Callback handed to the capture side; called once per delivered frame.
pub trait FrameAnalyzer: Send {
    fn analyze(&mut self, frame: Frame);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AnalyzerStats {
    pub frames: u64,
    pub invalid: u64,
    pub detector_errors: u64,
    pub regions: u64,
    pub empty: u64,
}

/// Normalize, detect, publish. Errors stay here and drop the frame.
pub struct Analyzer {
    detector: Box<dyn Detector>,
    model: PathBuf,
    mailbox: Arc<dyn Mailbox>,
    stats: AnalyzerStats,
    prof_detect: Duration,
}

impl Analyzer {
    pub fn new(detector: Box<dyn Detector>, model: impl Into<PathBuf>, mailbox: Arc<dyn Mailbox>) -> Self {
        Self {
            detector,
            model: model.into(),
            mailbox,
            stats: AnalyzerStats::default(),
            prof_detect: Duration::ZERO,
        }
    }

    pub fn stats(&self) -> AnalyzerStats {
        self.stats
    }

    fn process(&mut self, frame: Frame) -> PipelineResult<DetectionResult> {
        let buffer = normalize(frame)?;
        let start = Instant::now();
        let result = self.detector.detect(&self.model, &buffer);
        self.prof_detect += start.elapsed();
        result
    }
}

impl FrameAnalyzer for Analyzer {
    fn analyze(&mut self, frame: Frame) {
        self.stats.frames += 1;
        match self.process(frame) {
            Ok(result) => {
                match result {
                    DetectionResult::Region(_) => self.stats.regions += 1,
                    DetectionResult::Empty => self.stats.empty += 1,
                }
                self.mailbox.publish(result);
            }
            Err(PipelineError::InvalidFrame(reason)) => {
                self.stats.invalid += 1;
                debug!("analysis: invalid frame dropped: {reason}");
            }
            Err(e) => {
                self.stats.detector_errors += 1;
                warn!(detector = self.detector.name(), "analysis: frame dropped: {e}");
            }
        }

        if self.stats.frames % 300 == 0 {
            info!(
                frames = self.stats.frames,
                regions = self.stats.regions,
                invalid = self.stats.invalid,
                detector_errors = self.stats.detector_errors,
                detect_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_detect.as_secs_f64() * 1000.0 / self.stats.frames as f64
                ),
                "analysis timings"
            );
        }
    }
}

#[derive(Default)]
struct FeedState {
    pending: Option<Frame>,
    closed: bool,
    dropped: u64,
}

/// Keep-only-latest hand-off from the capture side to the single analysis worker.
///
/// A frame submitted while another is still waiting replaces it; the
/// replaced frame is dropped unprocessed, which releases it.
#[derive(Default)]
pub struct FrameFeed {
    state: Mutex<FeedState>,
    ready: Condvar,
}

impl FrameFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false once the feed is closed; the frame is released either way.
    pub fn submit(&self, frame: Frame) -> bool {
        let (accepted, stale) = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if st.closed {
                (false, Some(frame))
            } else {
                let stale = st.pending.replace(frame);
                if stale.is_some() {
                    st.dropped += 1;
                }
                (true, stale)
            }
        };
        if accepted {
            self.ready.notify_one();
        }
        // release hooks run outside the lock
        drop(stale);
        accepted
    }

    /// Block until a frame is pending or the feed closes.
    pub fn next(&self) -> Option<Frame> {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if st.closed {
                return None;
            }
            if let Some(frame) = st.pending.take() {
                return Some(frame);
            }
            st = self.ready.wait(st).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Stop the worker and release any pending frame.
    pub fn close(&self) {
        let pending = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.closed = true;
            st.pending.take()
        };
        self.ready.notify_all();
        drop(pending);
    }

    /// Frames replaced before the worker picked them up.
    pub fn dropped(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).dropped
    }
}

/// Run `analyzer` on a dedicated blocking thread until the feed closes.
///
/// One call runs at a time, so the analyzer is never re-entered.
pub fn spawn_analysis_worker<A>(feed: Arc<FrameFeed>, mut analyzer: A) -> tokio::task::JoinHandle<A>
where
    A: FrameAnalyzer + 'static,
{
    tokio::task::spawn_blocking(move || {
        debug!("analysis: worker started");
        while let Some(frame) = feed.next() {
            analyzer.analyze(frame);
        }
        debug!("analysis: worker stopped");
        analyzer
    })
}
