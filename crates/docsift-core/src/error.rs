//! Error taxonomy shared by every stage of document processing.
//!
//! Each component has its own narrow error type so that its failure
//! contract is visible in its signature. [`ProcessError`] is the
//! request-level error the orchestrator returns; note that it has no
//! index variant, because an unavailable duplicate index degrades the
//! response instead of failing it.

use std::time::Duration;

use thiserror::Error;

/// Failure of the feature extractor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractError {
    /// The bytes are not a decodable PNG or JPEG image.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The image decodes to more pixels than the extractor will process.
    #[error("image too large: {0}")]
    ImageTooLarge(String),

    /// The extractor itself failed (for example a panicking codec).
    #[error("extraction failed: {0}")]
    Internal(String),
}

/// Failure of the classifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    /// The classifier model could not be loaded at start-up.
    #[error("classification unavailable: {0}")]
    ClassificationUnavailable(String),
}

/// Failure of the duplicate index backing store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("duplicate index unavailable: {0}")]
    Unavailable(String),
}

/// Request-level failure returned by the processing pipeline.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("image too large: {0}")]
    ImageTooLarge(String),

    #[error("classification unavailable: {0}")]
    ClassificationUnavailable(String),

    #[error("processing timed out after {0:?}")]
    Timeout(Duration),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProcessError {
    /// Whether the caller may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProcessError::ClassificationUnavailable(_) | ProcessError::Timeout(_)
        )
    }
}

impl From<ExtractError> for ProcessError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::UnsupportedFormat(msg) => ProcessError::UnsupportedFormat(msg),
            ExtractError::ImageTooLarge(msg) => ProcessError::ImageTooLarge(msg),
            ExtractError::Internal(msg) => ProcessError::Internal(msg),
        }
    }
}

impl From<ClassifyError> for ProcessError {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::ClassificationUnavailable(msg) => {
                ProcessError::ClassificationUnavailable(msg)
            }
        }
    }
}
