//! Upload error types.
//!
//! Every variant maps to one entry of the engine's error taxonomy.  The
//! enum carries enough context for logging, while [`ErrorKind`] is the
//! small copyable classification stored on part state and returned to
//! callers in [`crate::engine::UploadFailure`].

use serde::Serialize;
use thiserror::Error;

/// Convenience alias used across the engine.
pub type Result<T, E = UploadError> = std::result::Result<T, E>;

/// Classification of an upload failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Local file read failure.
    IoError,
    /// Timeout, connection reset, throttling or server 5xx.
    TransientNetworkError,
    /// Credential or permission rejection.
    AuthError,
    /// The server has no record of the multipart session.
    SessionExpired,
    /// `complete` was attempted before every part had an ETag.
    IncompleteUpload,
    /// Zero-length source.
    EmptyInput,
    /// The server rejected a body whose digest did not match.
    ChecksumMismatch,
    /// The server rejected the part list handed to `complete`.
    CompleteRejected,
    /// Any other non-retryable rejection.
    Rejected,
    /// The caller cancelled the transfer.
    Cancelled,
    /// Configuration failed validation.
    InvalidConfig,
    /// Unexpected internal failure.
    Internal,
}

impl ErrorKind {
    /// Return the stable string code for this kind.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::IoError => "IOError",
            ErrorKind::TransientNetworkError => "TransientNetworkError",
            ErrorKind::AuthError => "AuthError",
            ErrorKind::SessionExpired => "SessionExpired",
            ErrorKind::IncompleteUpload => "IncompleteUpload",
            ErrorKind::EmptyInput => "EmptyInput",
            ErrorKind::ChecksumMismatch => "ChecksumMismatch",
            ErrorKind::CompleteRejected => "CompleteRejected",
            ErrorKind::Rejected => "Rejected",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::InvalidConfig => "InvalidConfig",
            ErrorKind::Internal => "Internal",
        }
    }

    /// Session-level kinds terminate the whole transfer rather than a
    /// single part.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, ErrorKind::AuthError | ErrorKind::SessionExpired)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Upload engine errors.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Reading the source file failed.
    #[error("failed to read source file: {0}")]
    Io(#[from] std::io::Error),

    /// A network call failed in a way that may succeed on retry.
    #[error("{operation} failed transiently: {message}")]
    Transient {
        operation: &'static str,
        message: String,
    },

    /// Credentials or permissions were rejected.
    #[error("{operation} was not authorized: {message}")]
    Auth {
        operation: &'static str,
        message: String,
    },

    /// The multipart session is gone (expired, aborted, or never existed).
    #[error("multipart session {session_id} does not exist or has expired")]
    SessionExpired { session_id: String },

    /// `complete` was called with parts still missing an ETag.
    #[error("cannot complete upload: parts {missing:?} have not been acknowledged")]
    IncompleteUpload { missing: Vec<u32> },

    /// The source has zero length.
    #[error("refusing to upload an empty source")]
    EmptyInput,

    /// The server computed a different digest than the one sent.
    #[error("{operation} rejected the body digest: {message}")]
    ChecksumMismatch {
        operation: &'static str,
        message: String,
    },

    /// The server refused the part list handed to `complete`.
    #[error("complete rejected for session {session_id}: {message}")]
    CompleteRejected { session_id: String, message: String },

    /// Any other non-retryable service rejection.
    #[error("{operation} rejected: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },

    /// The transfer was cancelled by the caller or a deadline.
    #[error("upload cancelled")]
    Cancelled,

    /// A configuration value is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl UploadError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::Io(_) => ErrorKind::IoError,
            UploadError::Transient { .. } => ErrorKind::TransientNetworkError,
            UploadError::Auth { .. } => ErrorKind::AuthError,
            UploadError::SessionExpired { .. } => ErrorKind::SessionExpired,
            UploadError::IncompleteUpload { .. } => ErrorKind::IncompleteUpload,
            UploadError::EmptyInput => ErrorKind::EmptyInput,
            UploadError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            UploadError::CompleteRejected { .. } => ErrorKind::CompleteRejected,
            UploadError::Rejected { .. } => ErrorKind::Rejected,
            UploadError::Cancelled => ErrorKind::Cancelled,
            UploadError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            UploadError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a network call that produced this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Transient { .. })
    }

    /// Shorthand for a transient failure.
    pub fn transient(operation: &'static str, message: impl Into<String>) -> Self {
        UploadError::Transient {
            operation,
            message: message.into(),
        }
    }
}

/// Classify a service error by its S3 error code and HTTP status.
///
/// `session_id` is the multipart upload id the failing call targeted, if
/// any; a 404 on such a call means the session is gone.
pub fn classify_service_error(
    operation: &'static str,
    code: Option<&str>,
    status: Option<u16>,
    message: String,
    session_id: Option<&str>,
) -> UploadError {
    match code {
        Some("AccessDenied")
        | Some("InvalidAccessKeyId")
        | Some("SignatureDoesNotMatch")
        | Some("ExpiredToken")
        | Some("InvalidToken") => return UploadError::Auth { operation, message },
        Some("NoSuchUpload") => {
            return UploadError::SessionExpired {
                session_id: session_id.unwrap_or_default().to_string(),
            }
        }
        Some("BadDigest") | Some("InvalidDigest") => {
            return UploadError::ChecksumMismatch { operation, message }
        }
        Some("InvalidPart") | Some("InvalidPartOrder") => {
            return UploadError::CompleteRejected {
                session_id: session_id.unwrap_or_default().to_string(),
                message,
            }
        }
        Some("SlowDown")
        | Some("RequestTimeout")
        | Some("RequestTimeTooSkewed")
        | Some("InternalError")
        | Some("ServiceUnavailable")
        | Some("Throttling") => return UploadError::Transient { operation, message },
        _ => {}
    }

    match status {
        Some(401) | Some(403) => UploadError::Auth { operation, message },
        Some(404) if session_id.is_some() => UploadError::SessionExpired {
            session_id: session_id.unwrap_or_default().to_string(),
        },
        Some(408) | Some(429) => UploadError::Transient { operation, message },
        Some(s) if s >= 500 => UploadError::Transient { operation, message },
        _ => UploadError::Rejected { operation, message },
    }
}

// -- Tests -------------------------------------------------------------------
