//! Error types for irp-client
//!
//! `ClientError` is the per-operation taxonomy; `BatchError` aggregates the
//! per-file outcome of an upload batch; `RealtimeError` covers the realtime
//! transport.

use crate::models::UploadedFile;
use thiserror::Error;

/// Per-operation error
///
/// Backend-supplied messages are carried verbatim so they can be shown to
/// the user unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Local pre-flight validation failed (never sent to the backend)
    #[error("{}", .0.join(", "))]
    Validation(Vec<String>),

    /// Upload token request was refused or could not be made
    #[error("{0}")]
    TokenRequest(String),

    /// Transient transport failure
    #[error("Network error: {0}")]
    Network(String),

    /// Caller-supplied deadline exceeded
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Upload token expired before the transfer finished
    #[error("Upload token has expired")]
    TokenExpired,

    /// Backend refused the request; message from the backend
    #[error("{0}")]
    ServerRejected(String),

    /// Cancelled by the caller
    #[error("Cancelled")]
    Cancelled,

    /// Backend answered 401; the caller must re-authenticate
    #[error("Authentication required")]
    Authentication,

    /// Operation not allowed in the current session state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Backend answered with a payload that could not be decoded
    #[error("Unexpected response: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Eligible for a bounded retry at the caller
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Network(_) | ClientError::Timeout(_))
    }

    /// Short machine-readable kind for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::Validation(_) => "validation",
            ClientError::TokenRequest(_) => "token_request",
            ClientError::Network(_) => "network",
            ClientError::Timeout(_) => "timeout",
            ClientError::TokenExpired => "token_expired",
            ClientError::ServerRejected(_) => "server_rejected",
            ClientError::Cancelled => "cancelled",
            ClientError::Authentication => "authentication",
            ClientError::InvalidState(_) => "invalid_state",
            ClientError::Protocol(_) => "protocol",
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout(err.to_string())
        } else if err.is_decode() {
            ClientError::Protocol(err.to_string())
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

impl From<irp_common::Error> for ClientError {
    fn from(err: irp_common::Error) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// A file rejected by pre-flight validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidFile {
    pub filename: String,
    pub errors: Vec<String>,
}

/// A file whose upload ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedUpload {
    pub file_index: usize,
    pub filename: String,
    pub error: ClientError,
}

/// Aggregate outcome of a rejected upload batch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    /// At least one file failed validation; nothing was uploaded
    #[error("File validation failed:\n{}", format_invalid(.0))]
    Validation(Vec<InvalidFile>),

    /// At least one task failed; completed uploads are kept (not rolled back)
    #[error("Upload failed:\n{}", format_failed(.failures))]
    Failed {
        failures: Vec<FailedUpload>,
        completed: Vec<UploadedFile>,
    },
}

impl BatchError {
    /// Error message for a given file, if that file failed
    pub fn message_for(&self, filename: &str) -> Option<String> {
        match self {
            BatchError::Validation(files) => files
                .iter()
                .find(|f| f.filename == filename)
                .map(|f| f.errors.join(", ")),
            BatchError::Failed { failures, .. } => failures
                .iter()
                .find(|f| f.filename == filename)
                .map(|f| f.error.to_string()),
        }
    }

    /// True when any failure was an authentication failure
    pub fn requires_reauthentication(&self) -> bool {
        match self {
            BatchError::Failed { failures, .. } => failures
                .iter()
                .any(|f| f.error == ClientError::Authentication),
            BatchError::Validation(_) => false,
        }
    }
}

/// Collapse a batch outcome into one error for callers that handle a single
/// failure (the conversation controller)
impl From<BatchError> for ClientError {
    fn from(err: BatchError) -> Self {
        match &err {
            BatchError::Validation(files) => ClientError::Validation(
                files
                    .iter()
                    .map(|f| format!("{}: {}", f.filename, f.errors.join(", ")))
                    .collect(),
            ),
            BatchError::Failed { .. } if err.requires_reauthentication() => {
                ClientError::Authentication
            }
            BatchError::Failed { failures, .. }
                if failures.iter().all(|f| f.error == ClientError::Cancelled) =>
            {
                ClientError::Cancelled
            }
            BatchError::Failed { failures, .. } if failures.len() == 1 => failures[0].error.clone(),
            BatchError::Failed { .. } => ClientError::ServerRejected(err.to_string()),
        }
    }
}

fn format_invalid(files: &[InvalidFile]) -> String {
    files
        .iter()
        .map(|f| format!("{}: {}", f.filename, f.errors.join(", ")))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_failed(failures: &[FailedUpload]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.filename, f.error))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Realtime transport errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    #[error("Realtime connect failed: {0}")]
    Connect(String),

    #[error("Realtime send failed: {0}")]
    Send(String),

    #[error("Realtime receive failed: {0}")]
    Receive(String),

    #[error("Realtime configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ClientError::Network("reset".into()).is_transient());
        assert!(ClientError::Timeout("5m".into()).is_transient());
        assert!(!ClientError::TokenExpired.is_transient());
        assert!(!ClientError::ServerRejected("no".into()).is_transient());
        assert!(!ClientError::Cancelled.is_transient());
        assert!(!ClientError::Authentication.is_transient());
    }

    #[test]
    fn test_backend_messages_display_verbatim() {
        assert_eq!(
            ClientError::TokenRequest("quota exceeded".into()).to_string(),
            "quota exceeded"
        );
        assert_eq!(
            ClientError::ServerRejected("blob rejected".into()).to_string(),
            "blob rejected"
        );
    }

    #[test]
    fn test_validation_batch_error_lists_every_file() {
        let err = BatchError::Validation(vec![
            InvalidFile {
                filename: "a.txt".into(),
                errors: vec!["bad format".into()],
            },
            InvalidFile {
                filename: "b.exe".into(),
                errors: vec!["too large".into(), "bad format".into()],
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("a.txt: bad format"));
        assert!(text.contains("b.exe: too large, bad format"));
        assert_eq!(err.message_for("b.exe").unwrap(), "too large, bad format");
    }

    fn failed(errors: Vec<ClientError>) -> BatchError {
        BatchError::Failed {
            failures: errors
                .into_iter()
                .enumerate()
                .map(|(i, error)| FailedUpload {
                    file_index: i,
                    filename: format!("f{}.pdf", i),
                    error,
                })
                .collect(),
            completed: Vec::new(),
        }
    }

    #[test]
    fn test_batch_error_collapses_to_client_error() {
        assert_eq!(
            ClientError::from(failed(vec![ClientError::TokenRequest("quota exceeded".into())])),
            ClientError::TokenRequest("quota exceeded".into())
        );
        assert_eq!(
            ClientError::from(failed(vec![ClientError::Cancelled, ClientError::Cancelled])),
            ClientError::Cancelled
        );
        assert_eq!(
            ClientError::from(failed(vec![
                ClientError::Network("reset".into()),
                ClientError::Authentication
            ])),
            ClientError::Authentication
        );
        assert!(matches!(
            ClientError::from(failed(vec![
                ClientError::Network("reset".into()),
                ClientError::ServerRejected("no".into())
            ])),
            ClientError::ServerRejected(_)
        ));
    }
}
