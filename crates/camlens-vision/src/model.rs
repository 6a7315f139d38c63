use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

/// A model file copied into a writable working directory at startup.
///
/// The detector only ever sees the staged path, which stays fixed for the
/// life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResource {
    path: PathBuf,
}

impl ModelResource {
    pub fn stage(bundled: &Path, work_dir: &Path) -> Result<Self> {
        anyhow::ensure!(bundled.is_file(), "model resource {} not found", bundled.display());
        let name = bundled
            .file_name()
            .with_context(|| format!("model path {} has no file name", bundled.display()))?;
        fs::create_dir_all(work_dir).with_context(|| format!("create work dir {}", work_dir.display()))?;

        let path = work_dir.join(name);
        fs::copy(bundled, &path)
            .with_context(|| format!("stage model {} -> {}", bundled.display(), path.display()))?;
        info!(model = %path.display(), "model: staged");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
