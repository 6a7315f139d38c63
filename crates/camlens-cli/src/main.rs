use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use camlens_vision::camera::{CameraConfig, SyntheticCamera};
use camlens_vision::overlay::{parse_hex_color, DEFAULT_STROKE_WIDTH};
use camlens_vision::render::{DEFAULT_INITIAL_DELAY, DEFAULT_PERIOD};
use camlens_vision::{
    doctor as vision_doctor, normalize, spawn_analysis_worker, Analyzer, Detector, DisplaySlot, FileMailbox, Frame, FrameFeed, Mailbox,
    ModelResource, OverlayRenderer, OverlayStyle, RenderLoop, RenderTiming, SlotMailbox, ThresholdDetector,
};

#[derive(Debug, Parser)]
#[command(name = "camlens", version, about = "camlens - live frame analysis with a synced overlay")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate configuration and the bundled model.
    Doctor,
    /// Run the pipeline against the synthetic camera.
    Run {
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        seconds: Option<u64>,
        /// Write the last presented overlay here on exit.
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Detect on a single image and render its overlay.
    Analyze {
        input: PathBuf,
        #[arg(long, default_value_t = 0)]
        rotation: u32,
        #[arg(long, default_value = "overlay.png")]
        out: PathBuf,
    },
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    camera: CameraConfig,
    detector: DetectorCfg,
    #[serde(default)]
    overlay: OverlayCfg,
    #[serde(default)]
    mailbox: MailboxCfg,
}

#[derive(Debug, serde::Deserialize)]
struct DetectorCfg {
    model_path: PathBuf,
    work_dir: PathBuf,
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct OverlayCfg {
    width: u32,
    height: u32,
    stroke_width: u32,
    color: String,
    period_ms: u64,
    initial_delay_ms: u64,
    mirror: bool,
}

impl Default for OverlayCfg {
    fn default() -> Self {
        Self {
            width: 720,
            height: 1280,
            stroke_width: DEFAULT_STROKE_WIDTH,
            color: "#3cd184".into(),
            period_ms: DEFAULT_PERIOD.as_millis() as u64,
            initial_delay_ms: DEFAULT_INITIAL_DELAY.as_millis() as u64,
            mirror: true,
        }
    }
}

impl OverlayCfg {
    fn style(&self) -> Result<OverlayStyle> {
        Ok(OverlayStyle {
            stroke_width: self.stroke_width,
            color: parse_hex_color(&self.color).context("overlay.color")?,
            mirror: self.mirror,
        })
    }

    fn timing(&self) -> RenderTiming {
        RenderTiming {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            period: Duration::from_millis(self.period_ms),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
enum MailboxKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Default, serde::Deserialize)]
struct MailboxCfg {
    #[serde(default)]
    kind: MailboxKind,
    path: Option<PathBuf>,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Run { seconds, snapshot } => run(&cfg, seconds, snapshot).await?,
        Command::Analyze { input, rotation, out } => analyze(&cfg, &input, rotation, &out)?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    let style = cfg.overlay.style()?;
    vision_doctor::check_overlay(cfg.overlay.width, cfg.overlay.height, &style, cfg.overlay.timing().period)?;
    vision_doctor::check_model(&cfg.detector.model_path)?;
    SyntheticCamera::new(cfg.camera.clone()).context("camera")?;

    if cfg.mailbox.kind == MailboxKind::File {
        let path = cfg.mailbox.path.as_ref().context("mailbox.path missing for kind = \"file\"")?;
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        anyhow::ensure!(dir.is_dir(), "mailbox directory {} does not exist", dir.display());
    }

    info!("doctor: OK");
    Ok(())
}

fn build_mailbox(cfg: &MailboxCfg) -> Result<Arc<dyn Mailbox>> {
    Ok(match cfg.kind {
        MailboxKind::Memory => Arc::new(SlotMailbox::new()),
        MailboxKind::File => {
            let path = cfg.path.clone().context("mailbox.path missing for kind = \"file\"")?;
            info!(path = %path.display(), "mailbox: file-backed");
            Arc::new(FileMailbox::new(path))
        }
    })
}

async fn run(cfg: &Config, seconds: Option<u64>, snapshot: Option<PathBuf>) -> Result<()> {
    info!("run: starting");

    let model = match ModelResource::stage(&cfg.detector.model_path, &cfg.detector.work_dir) {
        Ok(m) => m,
        Err(e) => {
            error!("run: model unavailable, detection cannot start: {:#}", e);
            return Err(e);
        }
    };

    let mailbox = build_mailbox(&cfg.mailbox)?;
    let renderer = OverlayRenderer::new(cfg.overlay.width, cfg.overlay.height, cfg.overlay.style()?);
    let camera = SyntheticCamera::new(cfg.camera.clone()).context("camera")?;
    let (uw, uh) = camera.upright_dimensions();
    if (uw, uh) != renderer.dimensions() {
        warn!(upright_w = uw, upright_h = uh, "run: overlay size differs from upright frame size");
    }

    let analyzer = Analyzer::new(Box::new(ThresholdDetector::new()), model.path(), mailbox.clone());
    let feed = Arc::new(FrameFeed::new());
    let worker = spawn_analysis_worker(feed.clone(), analyzer);

    let slot = DisplaySlot::new();
    let render = RenderLoop::spawn(renderer, mailbox, slot.clone(), cfg.overlay.timing());

    let (stop_tx, stop_rx) = watch::channel(false);
    let capture = camera.spawn(feed.clone(), stop_rx);

    match seconds {
        Some(s) => tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(s)) => {}
            r = tokio::signal::ctrl_c() => r.context("wait for ctrl-c")?,
        },
        None => tokio::signal::ctrl_c().await.context("wait for ctrl-c")?,
    }
    info!("run: stopping");

    let _ = stop_tx.send(true);
    let produced = capture.await.context("camera task failed")?;
    feed.close();
    let analyzer = worker.await.context("analysis worker failed")?;
    let ticks = render.shutdown().await?;

    let stats = analyzer.stats();
    info!(
        produced,
        skipped = feed.dropped(),
        analyzed = stats.frames,
        regions = stats.regions,
        detector_errors = stats.detector_errors,
        ticks,
        "run: done"
    );

    if let Some(out) = snapshot {
        match slot.current() {
            Some(frame) => {
                frame.image.save(&out).with_context(|| format!("write snapshot {}", out.display()))?;
                info!(path = %out.display(), tick = frame.tick, "run: snapshot written");
            }
            None => warn!("run: no overlay presented, snapshot skipped"),
        }
    }
    Ok(())
}

fn analyze(cfg: &Config, input: &Path, rotation: u32, out: &Path) -> Result<()> {
    let img = image::open(input).with_context(|| format!("open {}", input.display()))?.to_luma8();
    let buffer = normalize(Frame::from_luma(&img, rotation))?;

    let mut detector = ThresholdDetector::new();
    let result = detector.detect(&cfg.detector.model_path, &buffer)?;
    match result.region() {
        Some(r) => println!("region {},{},{},{}", r.left, r.top, r.right, r.bottom),
        None => println!("region none"),
    }

    let renderer = OverlayRenderer::new(buffer.width(), buffer.height(), cfg.overlay.style()?);
    let frame = renderer.render(0, Some(result));
    frame.image.save(out).with_context(|| format!("write overlay {}", out.display()))?;
    info!(path = %out.display(), "analyze: overlay written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[camera]
width = 1280
height = 720
rotation = 90
fps = 30

[detector]
model_path = "assets/bright-spot.toml"
work_dir = "/tmp/camlens"
"#;

    #[test]
    fn overlay_and_mailbox_default() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!((cfg.overlay.width, cfg.overlay.height), (720, 1280));
        assert_eq!(cfg.overlay.style().unwrap(), OverlayStyle::default());
        assert_eq!(cfg.overlay.timing().period, DEFAULT_PERIOD);
        assert_eq!(cfg.mailbox.kind, MailboxKind::Memory);
    }

    #[test]
    fn file_mailbox_needs_path() {
        let cfg = MailboxCfg { kind: MailboxKind::File, path: None };
        assert!(build_mailbox(&cfg).is_err());
        let dir = tempfile::tempdir().unwrap();
        let cfg = MailboxCfg { kind: MailboxKind::File, path: Some(dir.path().join("face.txt")) };
        assert!(build_mailbox(&cfg).is_ok());
    }

    #[test]
    fn shipped_config_parses() {
        let text = include_str!("../../../configs/camlens.toml");
        let cfg: Config = toml::from_str(text).unwrap();
        assert_eq!(cfg.camera.rotation, 90);
    }
}
