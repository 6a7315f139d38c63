use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::mailbox::Mailbox;
use crate::overlay::{OverlayFrame, OverlayRenderer};

pub const DEFAULT_PERIOD: Duration = Duration::from_millis(50);
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);

/// Where finished overlays go; each call replaces the previous background.
/// Called on the render task, so it should only swap a reference.
pub trait OverlaySink: Send {
    fn present(&mut self, frame: OverlayFrame);
}

/// Holds the most recently presented overlay for the display side to read.
#[derive(Debug, Clone, Default)]
pub struct DisplaySlot {
    current: Arc<Mutex<Option<Arc<OverlayFrame>>>>,
}

impl DisplaySlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<OverlayFrame>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl OverlaySink for DisplaySlot {
    fn present(&mut self, frame: OverlayFrame) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(frame));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    Idle,
    TickRunning,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderTiming {
    pub initial_delay: Duration,
    pub period: Duration,
}

impl Default for RenderTiming {
    fn default() -> Self {
        Self { initial_delay: DEFAULT_INITIAL_DELAY, period: DEFAULT_PERIOD }
    }
}

/// Each tick is scheduled only after the previous one has finished.
pub struct RenderLoop {
    state: watch::Receiver<RenderState>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<u64>,
}

impl RenderLoop {
    /// Start ticking on the current tokio runtime.
    pub fn spawn<S>(renderer: OverlayRenderer, mailbox: Arc<dyn Mailbox>, sink: S, timing: RenderTiming) -> Self
    where
        S: OverlaySink + 'static,
    {
        let (state_tx, state) = watch::channel(RenderState::Idle);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(renderer, mailbox, sink, timing, state_tx, shutdown_rx));
        Self { state, shutdown, handle }
    }

    pub fn watch_state(&self) -> watch::Receiver<RenderState> {
        self.state.clone()
    }

    /// Stop after the tick in progress, if any. Returns the number of ticks run.
    pub async fn shutdown(self) -> Result<u64> {
        let _ = self.shutdown.send(true);
        self.handle.await.context("render loop task failed")
    }
}

async fn run<S: OverlaySink>(
    renderer: OverlayRenderer,
    mailbox: Arc<dyn Mailbox>,
    mut sink: S,
    timing: RenderTiming,
    state: watch::Sender<RenderState>,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let (w, h) = renderer.dimensions();
    debug!(width = w, height = h, period_ms = timing.period.as_millis() as u64, "render: loop started");

    let mut ticks = 0u64;
    if !wait_or_shutdown(timing.initial_delay, &mut shutdown).await {
        loop {
            state.send_replace(RenderState::TickRunning);
            match draw_tick(&renderer, &mailbox, ticks).await {
                Ok(frame) => {
                    trace!(tick = ticks, region = ?frame.region, "render: tick");
                    sink.present(frame);
                }
                Err(e) => warn!(tick = ticks, "render: tick failed: {e}"),
            }
            ticks += 1;
            state.send_replace(RenderState::Idle);

            if wait_or_shutdown(timing.period, &mut shutdown).await {
                break;
            }
        }
    }

    state.send_replace(RenderState::Stopped);
    debug!(ticks, "render: loop stopped");
    ticks
}

// mailbox I/O and rasterisation run on the blocking pool
async fn draw_tick(
    renderer: &OverlayRenderer,
    mailbox: &Arc<dyn Mailbox>,
    tick: u64,
) -> std::result::Result<OverlayFrame, tokio::task::JoinError> {
    let renderer = renderer.clone();
    let mailbox = mailbox.clone();
    tokio::task::spawn_blocking(move || renderer.render(tick, mailbox.take_latest())).await
}

/// Sleep for `delay`; true if shutdown was requested (or its sender dropped) meanwhile.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return *shutdown.borrow(),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}
