//! Error types for bulksend
//!
//! [`Error`] is what every fallible engine operation returns. [`ApiError`]
//! is the serialized response shape an embedding HTTP layer hands to
//! clients, with status codes mapped through [`ToHttpStatus`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportError;
use crate::types::AccountId;

/// Result type alias for bulksend operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for bulksend
///
/// Variants carry enough context (account ids, field names, attempt counts)
/// that callers can act on a failure without parsing message strings.
#[derive(Debug, Error)]
pub enum Error {
    /// Submission rejected before a task was created
    #[error("validation error: {message}")]
    Validation {
        /// Human-readable error message describing the rejected input
        message: String,
        /// The request field that caused the rejection (e.g., "messages")
        field: Option<String>,
    },

    /// Ownership mismatch on a task or account operation
    #[error("forbidden: {resource} belongs to a different owner")]
    Forbidden {
        /// The resource that was addressed (e.g., "task 42")
        resource: String,
    },

    /// Task or account evicted or never existed
    #[error("not found: {0}")]
    NotFound(String),

    /// Send attempted while the account has no live connection
    #[error("account {account} is not connected")]
    NotConnected {
        /// The account whose connection is down
        account: AccountId,
    },

    /// Underlying transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Account session invalidated; re-pairing required
    #[error("account {account} authentication failed")]
    AuthFailed {
        /// The account whose session is invalid
        account: AccountId,
    },

    /// Reconnect supervisor exhausted its attempt budget
    #[error("connection to {account} permanently lost after {attempts} attempts")]
    ConnectionLost {
        /// The account whose connection was given up on
        account: AccountId,
        /// Consecutive reconnect attempts made before giving up
        attempts: u32,
    },

    /// Shutdown in progress - not accepting new tasks
    #[error("shutdown in progress: not accepting new tasks")]
    ShuttingDown,
}

/// Serialized error response for embedding API layers
///
/// Everything nests under an `error` key so success and failure bodies can
/// never be confused:
///
/// ```json
/// {
///   "error": {
///     "code": "not_found",
///     "message": "task 123 not found",
///     "details": {
///       "task_id": 123
///     }
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// The error body
    pub error: ErrorDetail,
}

/// Body of an [`ApiError`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable machine-readable code, e.g. "not_found"
    pub code: String,

    /// Human-readable description of what went wrong
    pub message: String,

    /// Extra context (ids, field names, attempt counts) when the error
    /// carries any; omitted from the wire shape otherwise
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Response with the given code and message, no details
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Response with attached context details
    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: Some(details),
            },
        }
    }

    /// Not-found response for `resource`
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new("not_found", format!("{} not found", resource.into()))
    }

    /// Rejected-input response
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("validation_error", message)
    }

    /// Ownership-mismatch response
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("forbidden", message)
    }

    /// Resource-state-conflict response
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    /// Unexpected-failure response
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }

    /// Draining-or-unavailable response
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new("service_unavailable", message)
    }
}

/// Mapping from domain errors to HTTP responses
///
/// Implemented on [`Error`] so an embedding API layer never match-arms over
/// variants itself.
pub trait ToHttpStatus {
    /// HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Stable machine-readable code for this error
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - rejected input
            Error::Validation { .. } => 400,

            // 403 Forbidden - Ownership mismatch
            Error::Forbidden { .. } => 403,

            // 404 Not Found
            Error::NotFound(_) => 404,

            // 409 Conflict - Resource in a state that refuses the operation
            Error::NotConnected { .. } => 409,
            Error::AuthFailed { .. } => 409,

            // 502 Bad Gateway - failures on the messaging-service side
            Error::Transport(_) => 502,
            Error::ConnectionLost { .. } => 502,

            // 503 Service Unavailable
            Error::ShuttingDown => 503,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Validation { .. } => "validation_error",
            Error::Forbidden { .. } => "forbidden",
            Error::NotFound(_) => "not_found",
            Error::NotConnected { .. } => "not_connected",
            Error::Transport(TransportError::Recoverable(_)) => "transport_error",
            Error::Transport(TransportError::Fatal(_)) => "auth_invalidated",
            Error::AuthFailed { .. } => "auth_failed",
            Error::ConnectionLost { .. } => "connection_lost",
            Error::ShuttingDown => "shutting_down",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        let message = error.to_string();

        // Variants with structured fields surface them as details
        let details = match &error {
            Error::Validation {
                field: Some(field), ..
            } => Some(serde_json::json!({
                "field": field,
            })),
            Error::NotConnected { account } => Some(serde_json::json!({
                "account_id": account,
            })),
            Error::AuthFailed { account } => Some(serde_json::json!({
                "account_id": account,
            })),
            Error::ConnectionLost { account, attempts } => Some(serde_json::json!({
                "account_id": account,
                "attempts": attempts,
            })),
            _ => None,
        };

        ApiError {
            error: ErrorDetail {
                code,
                message,
                details,
            },
        }
    }
}
