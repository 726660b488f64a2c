use thiserror::Error;

use crate::models::{ErrorKind, Failure};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Source too large: {0}")]
    SourceTooLarge(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Fetch failed: {message}")]
    FetchFailed { message: String, transient: bool },

    #[error("Fetch timed out: {0}")]
    FetchTimeout(String),

    #[error("OCR failed: {message}")]
    OcrFailed { message: String, transient: bool },

    #[error("Translation failed: {message}")]
    TranslationFailed { message: String, transient: bool },

    #[error("Compose failed: {0}")]
    ComposeFailed(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// The failure kind recorded on jobs and pages for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::SourceTooLarge(_) => ErrorKind::SourceTooLarge,
            PipelineError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            PipelineError::FetchFailed { .. } => ErrorKind::FetchFailed,
            PipelineError::FetchTimeout(_) => ErrorKind::FetchTimeout,
            PipelineError::OcrFailed { .. } => ErrorKind::OcrFailed,
            PipelineError::TranslationFailed { .. } => ErrorKind::TranslationFailed,
            PipelineError::ComposeFailed(_) => ErrorKind::ComposeFailed,
            PipelineError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            PipelineError::Cancelled(_) => ErrorKind::Cancelled,
            PipelineError::NotFound(_)
            | PipelineError::NotReady(_)
            | PipelineError::Validation(_)
            | PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::FetchFailed { transient, .. }
            | PipelineError::OcrFailed { transient, .. }
            | PipelineError::TranslationFailed { transient, .. } => *transient,
            PipelineError::FetchTimeout(_) | PipelineError::StorageUnavailable(_) => true,
            _ => false,
        }
    }

    pub fn failure(&self) -> Failure {
        Failure::new(self.kind(), self.to_string()).with_transient(self.is_transient())
    }

    /// Recover a `PipelineError` from an `anyhow` chain returned by a store.
    /// Anything that is not already a pipeline error is a storage fault.
    pub fn from_store(err: anyhow::Error) -> Self {
        match err.downcast::<PipelineError>() {
            Ok(e) => e,
            Err(other) => PipelineError::StorageUnavailable(format!("{:#}", other)),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::StorageUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Internal(err.to_string())
    }
}

impl From<uuid::Error> for PipelineError {
    fn from(err: uuid::Error) -> Self {
        PipelineError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_source_too_large_display() {
        let err = PipelineError::SourceTooLarge("page-01.png is 60 MB".to_string());
        assert_eq!(err.to_string(), "Source too large: page-01.png is 60 MB");
    }

    #[test]
    fn test_ocr_failed_display() {
        let err = PipelineError::OcrFailed {
            message: "HTTP 503".to_string(),
            transient: true,
        };
        assert_eq!(err.to_string(), "OCR failed: HTTP 503");
    }

    #[test]
    fn test_not_ready_display() {
        let err = PipelineError::NotReady("page 3 is translating".to_string());
        assert_eq!(err.to_string(), "Not ready: page 3 is translating");
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            PipelineError::FetchTimeout("x".into()).kind(),
            ErrorKind::FetchTimeout
        );
        assert_eq!(
            PipelineError::TranslationFailed {
                message: "x".into(),
                transient: false
            }
            .kind(),
            ErrorKind::TranslationFailed
        );
        assert_eq!(
            PipelineError::Validation("x".into()).kind(),
            ErrorKind::Internal
        );
        assert_eq!(
            PipelineError::Cancelled("x".into()).kind(),
            ErrorKind::Cancelled
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(PipelineError::FetchTimeout("slow".into()).is_transient());
        assert!(PipelineError::StorageUnavailable("disk".into()).is_transient());
        assert!(PipelineError::OcrFailed {
            message: "503".into(),
            transient: true
        }
        .is_transient());
        assert!(!PipelineError::OcrFailed {
            message: "400".into(),
            transient: false
        }
        .is_transient());
        assert!(!PipelineError::UnsupportedFormat("txt".into()).is_transient());
        assert!(!PipelineError::Cancelled("user".into()).is_transient());
    }

    #[test]
    fn test_failure_carries_kind_and_message() {
        let failure = PipelineError::ComposeFailed("no fonts".into()).failure();
        assert_eq!(failure.kind, ErrorKind::ComposeFailed);
        assert_eq!(failure.message, "Compose failed: no fonts");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: PipelineError = io_err.into();
        assert!(matches!(err, PipelineError::StorageUnavailable(_)));
    }

    #[test]
    fn test_from_uuid_error() {
        let uuid_err = uuid::Uuid::parse_str("not-a-uuid").unwrap_err();
        let err: PipelineError = uuid_err.into();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_from_store_preserves_pipeline_errors() {
        let wrapped: anyhow::Error = PipelineError::NotFound("job".into()).into();
        assert!(matches!(
            PipelineError::from_store(wrapped),
            PipelineError::NotFound(_)
        ));

        let io: anyhow::Result<()> =
            Err(std::io::Error::other("disk full")).context("Failed to write jobs file");
        let err = PipelineError::from_store(io.unwrap_err());
        match err {
            PipelineError::StorageUnavailable(msg) => {
                assert!(msg.contains("Failed to write jobs file"));
                assert!(msg.contains("disk full"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
