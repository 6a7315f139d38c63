use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use crate::detect::ThresholdModel;
use crate::overlay::OverlayStyle;

pub fn check_overlay(width: u32, height: u32, style: &OverlayStyle, period: Duration) -> Result<()> {
    anyhow::ensure!(width > 0 && height > 0, "overlay dimensions must be non-zero");
    anyhow::ensure!(style.stroke_width >= 1, "overlay.stroke_width must be >= 1");
    anyhow::ensure!(
        style.stroke_width * 2 < width.min(height),
        "overlay.stroke_width too large for {}x{}",
        width,
        height
    );
    anyhow::ensure!(style.color.0[3] > 0, "overlay.color is fully transparent");
    anyhow::ensure!(
        period >= Duration::from_millis(5) && period <= Duration::from_secs(1),
        "overlay.period_ms should be 5..1000"
    );
    Ok(())
}

/// The bundled model must exist and parse.
pub fn check_model(path: &Path) -> Result<()> {
    let model = ThresholdModel::load(path)?;
    anyhow::ensure!(model.min_size >= 1, "model.min_size must be >= 1");
    Ok(())
}
