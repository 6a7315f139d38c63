use thiserror::Error;

/// Errors raised inside the frame pipeline.
///
/// None of these are fatal: the analysis flow drops the current frame and
/// the render flow treats a corrupt mailbox as empty.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("detector unavailable (model {model}): {reason}")]
    DetectorUnavailable { model: String, reason: String },

    #[error("detector fault: {0}")]
    DetectorFault(String),

    #[error("mailbox corrupt: {0}")]
    MailboxCorrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub(crate) fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::InvalidFrame(msg.into())
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
