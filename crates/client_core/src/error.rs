//! Error taxonomy for the submission workflow.

use shared::domain::{Mode, ProtocolId, SlotId};
use thiserror::Error;

use crate::session::Step;

/// A session transition the reducer refused. The session is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("{action} is not allowed while the session is {step}")]
    NotAllowed { action: &'static str, step: Step },
    #[error("missing image for {}", join_slots(.slots))]
    MissingImage { slots: Vec<SlotId> },
    #[error("slot '{slot}' is not declared by protocol {protocol}")]
    UndeclaredSlot { protocol: ProtocolId, slot: SlotId },
    #[error("protocol {protocol} cannot be selected in {mode:?} mode")]
    ProtocolModeMismatch { protocol: ProtocolId, mode: Mode },
    #[error("stale submission attempt {actual}; session expects {expected}")]
    StaleAttempt { expected: u64, actual: u64 },
}

fn join_slots(slots: &[SlotId]) -> String {
    slots
        .iter()
        .map(SlotId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("malformed image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },
    #[error("unsupported image reference scheme '{scheme}'")]
    UnsupportedScheme { scheme: String },
    #[error("failed to read image {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("invalid inline image data: {0}")]
    InlineData(#[from] base64::DecodeError),
    #[error("image worker failed: {0}")]
    Worker(String),
}

/// Every per-image failure of one pipeline run, reported together.
#[derive(Debug, Error)]
#[error("failed to prepare {} image(s): {}", .failures.len(), describe_failures(.failures))]
pub struct NormalizationError {
    pub failures: Vec<(SlotId, MediaError)>,
}

fn describe_failures(failures: &[(SlotId, MediaError)]) -> String {
    failures
        .iter()
        .map(|(slot, err)| format!("{slot}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum SubmissionError {
    /// A required slot is empty. Not retried.
    #[error("missing image: {0}")]
    Validation(String),
    /// The session is not accepting a new submission.
    #[error("submission refused: {0}")]
    Busy(TransitionError),
    /// Usage limit reached. Not retried.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    /// Retry budget exhausted; the caller may retry manually from zero.
    #[error("analysis failed after {attempts} attempt(s): {message}")]
    Terminal { message: String, attempts: u32 },
    /// The session moved on (reset or a newer attempt) before this attempt finished.
    #[error("submission superseded by a newer session state")]
    Superseded,
}

impl SubmissionError {
    pub fn offers_manual_retry(&self) -> bool {
        matches!(self, SubmissionError::Terminal { .. })
    }
}
