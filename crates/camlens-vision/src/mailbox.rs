use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::detect::{DetectionResult, Region};
use crate::error::{PipelineError, PipelineResult};

pub trait Mailbox: Send + Sync {
    /// Replace any unread result. Never blocks on the reader and never fails.
    fn publish(&self, result: DetectionResult);

    /// Read and clear the slot.
    fn try_take(&self) -> PipelineResult<Option<DetectionResult>>;

    /// Read and clear the slot; a corrupt entry is discarded and reads as absent.
    fn take_latest(&self) -> Option<DetectionResult> {
        match self.try_take() {
            Ok(v) => v,
            Err(e) => {
                warn!("mailbox: discarding entry: {e}");
                None
            }
        }
    }
}

/// In-process slot guarded by a mutex held only for a swap.
#[derive(Debug, Default)]
pub struct SlotMailbox {
    slot: Mutex<Option<DetectionResult>>,
}

impl SlotMailbox {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Mailbox for SlotMailbox {
    fn publish(&self, result: DetectionResult) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(result);
    }

    fn try_take(&self) -> PipelineResult<Option<DetectionResult>> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        Ok(slot.take())
    }
}

/// Text record on disk: `left,top,right,bottom`, or an empty record for no region.
///
/// Writers stage into a sibling file and rename it over the record, readers
/// rename the record away before reading it, so neither side ever sees a
/// partial write.
#[derive(Debug)]
pub struct FileMailbox {
    path: PathBuf,
    staging: PathBuf,
    taken: PathBuf,
}

impl FileMailbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let staging = sibling(&path, "staging");
        let taken = sibling(&path, "taken");
        Self { path, staging, taken }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(&self, result: &DetectionResult) -> std::io::Result<()> {
        let mut f = fs::File::create(&self.staging)?;
        f.write_all(encode_record(result).as_bytes())?;
        f.flush()?;
        drop(f);
        fs::rename(&self.staging, &self.path)
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

impl Mailbox for FileMailbox {
    fn publish(&self, result: DetectionResult) {
        if let Err(e) = self.write_record(&result) {
            warn!(path = %self.path.display(), "mailbox: write failed: {e}");
        }
    }

    fn try_take(&self) -> PipelineResult<Option<DetectionResult>> {
        match fs::rename(&self.path, &self.taken) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let text = fs::read_to_string(&self.taken);
        let _ = fs::remove_file(&self.taken);
        decode_record(&text?).map(Some)
    }
}

pub fn encode_record(result: &DetectionResult) -> String {
    match result {
        DetectionResult::Empty => String::new(),
        DetectionResult::Region(r) => format!("{},{},{},{}\n", r.left, r.top, r.right, r.bottom),
    }
}

pub fn decode_record(text: &str) -> PipelineResult<DetectionResult> {
    let line = text.trim();
    if line.is_empty() {
        return Ok(DetectionResult::Empty);
    }
    let fields = line
        .split(',')
        .map(|f| f.trim().parse::<i32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PipelineError::MailboxCorrupt(format!("{line:?}: {e}")))?;
    let &[left, top, right, bottom] = fields.as_slice() else {
        return Err(PipelineError::MailboxCorrupt(format!(
            "{line:?}: expected 4 fields, found {}",
            fields.len()
        )));
    };
    Region::new(left, top, right, bottom)
        .map(DetectionResult::Region)
        .ok_or_else(|| PipelineError::MailboxCorrupt(format!("{line:?}: degenerate region")))
}
