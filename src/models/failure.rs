use serde::{Deserialize, Serialize};

/// Failure taxonomy surfaced on failed jobs and pages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SourceTooLarge,
    UnsupportedFormat,
    FetchFailed,
    FetchTimeout,
    #[serde(rename = "OCRFailed")]
    OcrFailed,
    TranslationFailed,
    ComposeFailed,
    StorageUnavailable,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SourceTooLarge => "SourceTooLarge",
            ErrorKind::UnsupportedFormat => "UnsupportedFormat",
            ErrorKind::FetchFailed => "FetchFailed",
            ErrorKind::FetchTimeout => "FetchTimeout",
            ErrorKind::OcrFailed => "OCRFailed",
            ErrorKind::TranslationFailed => "TranslationFailed",
            ErrorKind::ComposeFailed => "ComposeFailed",
            ErrorKind::StorageUnavailable => "StorageUnavailable",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error information attached to a `Failed` job or page. The message is never
/// empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub transient: bool,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            kind.as_str().to_string()
        } else {
            message
        };
        Self {
            kind,
            message,
            transient: false,
        }
    }

    pub fn with_transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}
