use thiserror::Error;

/// Failures reported by the OCR service client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OcrError {
    #[error("OCR service rate limited the request")]
    RateLimited,

    #[error("OCR service rejected the credentials")]
    Unauthorized,

    #[error("OCR request timed out")]
    Timeout,

    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("OCR request failed: {0}")]
    Unknown(String),
}

impl OcrError {
    /// Transient failures worth retrying under the backoff policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OcrError::RateLimited | OcrError::Timeout)
    }
}

/// Failures reported by the structuring (LLM) client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StructuringError {
    #[error("Structuring service rejected the response schema: {0}")]
    SchemaRejected(String),

    #[error("Structuring service rate limited the request")]
    RateLimited,

    #[error("Structuring request timed out")]
    Timeout,

    #[error("Structuring service rejected the credentials")]
    Unauthorized,

    #[error("Structuring service returned unparseable output: {0}")]
    MalformedResponse(String),

    #[error("Structuring request failed: {0}")]
    Unknown(String),
}

impl StructuringError {
    /// Transient failures worth retrying under the backoff policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StructuringError::RateLimited | StructuringError::Timeout
        )
    }
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("OCR stage failed: {0}")]
    Ocr(#[from] OcrError),

    #[error("Structuring stage failed: {0}")]
    Structuring(#[from] StructuringError),

    #[error("Unknown statement import: {0}")]
    UnknownImport(String),

    #[error("Import {id} is in state {state}, cannot {action}")]
    InvalidState {
        id: String,
        state: String,
        action: String,
    },

    #[error("Illegal status transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Store operation failed: {0}")]
    Store(String),

    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ImportError>;

/// Machine-readable failure category persisted on a failed import.
///
/// The category decides the generic user-facing message; the raw diagnostic
/// stays in logs and import metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimited,
    Unauthorized,
    Timeout,
    UnsupportedFormat,
    SchemaRejected,
    Unknown,
}

impl ErrorCategory {
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimited => {
                "The statement service is busy right now. Please try again in a few minutes."
            }
            ErrorCategory::Unauthorized => {
                "Statement processing is misconfigured. Please contact support."
            }
            ErrorCategory::Timeout => {
                "Processing this statement took too long. Please try again."
            }
            ErrorCategory::UnsupportedFormat => {
                "This file type is not supported. Please upload a PDF or an image of your statement."
            }
            ErrorCategory::SchemaRejected => {
                "We could not read this statement. Please try a clearer copy."
            }
            ErrorCategory::Unknown => {
                "Something went wrong while processing this statement. Please try again."
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::Unauthorized => "unauthorized",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::UnsupportedFormat => "unsupported_format",
            ErrorCategory::SchemaRejected => "schema_rejected",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl From<&OcrError> for ErrorCategory {
    fn from(err: &OcrError) -> Self {
        match err {
            OcrError::RateLimited => ErrorCategory::RateLimited,
            OcrError::Unauthorized => ErrorCategory::Unauthorized,
            OcrError::Timeout => ErrorCategory::Timeout,
            OcrError::UnsupportedFormat(_) => ErrorCategory::UnsupportedFormat,
            OcrError::Unknown(_) => ErrorCategory::Unknown,
        }
    }
}

impl From<&StructuringError> for ErrorCategory {
    fn from(err: &StructuringError) -> Self {
        match err {
            StructuringError::SchemaRejected(_) => ErrorCategory::SchemaRejected,
            StructuringError::RateLimited => ErrorCategory::RateLimited,
            StructuringError::Timeout => ErrorCategory::Timeout,
            StructuringError::Unauthorized => ErrorCategory::Unauthorized,
            StructuringError::MalformedResponse(_) => ErrorCategory::Unknown,
            StructuringError::Unknown(_) => ErrorCategory::Unknown,
        }
    }
}
