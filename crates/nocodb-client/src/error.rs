//! Error types for the NocoDB client.
//!
//! Remote failures are classified exactly once into an [`ErrorKind`]; the
//! executor then wraps the final kind in [`ClientError::Api`] together with
//! the [`ErrorContext`] of the request that produced it.

use crate::retry::RetryPolicy;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Semantic classification of a failed request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ErrorKind {
    /// Connection could not be established or was dropped (DNS, refused, reset)
    #[error("Connection failed: {message}")]
    Connection { message: String },

    /// A single attempt exceeded its timeout
    #[error("Request timed out: {message}")]
    Timeout { message: String },

    /// Authentication failed (401)
    #[error("Authentication failed: {message}")]
    Auth {
        message: String,
        details: Option<Value>,
    },

    /// Permission denied (403)
    #[error("Permission denied: {message}")]
    Permission {
        message: String,
        details: Option<Value>,
    },

    /// Resource not found (404)
    #[error("Resource not found: {message}")]
    NotFound {
        message: String,
        details: Option<Value>,
    },

    /// Rate limited (429)
    #[error("Rate limited, retry after {retry_after:?}: {message}")]
    RateLimit {
        /// Wait requested by the server (60s when the header is absent or invalid)
        retry_after: Duration,
        message: String,
        details: Option<Value>,
    },

    /// Request rejected as invalid (other 4xx), or a local validation failure
    #[error("Validation failed{}: {message}", status_suffix(.status))]
    Validation {
        /// HTTP status, `None` when raised locally
        status: Option<u16>,
        message: String,
        details: Option<Value>,
    },

    /// Server-side failure (5xx)
    #[error("Server error ({status}): {message}")]
    Server {
        status: u16,
        message: String,
        details: Option<Value>,
    },

    /// Successful status, but the body was not valid JSON
    #[error(
        "Invalid response (content-type: {}): {message}; preview: '{preview}'",
        .content_type.as_deref().unwrap_or("unknown")
    )]
    ResponseParse {
        message: String,
        content_type: Option<String>,
        /// First 500 characters of the body
        preview: String,
    },

    /// Anything that fits none of the above
    #[error("Unexpected failure{}: {message}", status_suffix(.status))]
    Unclassified {
        status: Option<u16>,
        message: String,
        details: Option<Value>,
    },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

impl ErrorKind {
    /// HTTP status associated with this failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ErrorKind::Connection { .. }
            | ErrorKind::Timeout { .. }
            | ErrorKind::ResponseParse { .. } => None,
            ErrorKind::Auth { .. } => Some(401),
            ErrorKind::Permission { .. } => Some(403),
            ErrorKind::NotFound { .. } => Some(404),
            ErrorKind::RateLimit { .. } => Some(429),
            ErrorKind::Validation { status, .. } | ErrorKind::Unclassified { status, .. } => {
                *status
            }
            ErrorKind::Server { status, .. } => Some(*status),
        }
    }

    /// Human-readable message.
    pub fn message(&self) -> &str {
        match self {
            ErrorKind::Connection { message }
            | ErrorKind::Timeout { message }
            | ErrorKind::Auth { message, .. }
            | ErrorKind::Permission { message, .. }
            | ErrorKind::NotFound { message, .. }
            | ErrorKind::RateLimit { message, .. }
            | ErrorKind::Validation { message, .. }
            | ErrorKind::Server { message, .. }
            | ErrorKind::ResponseParse { message, .. }
            | ErrorKind::Unclassified { message, .. } => message,
        }
    }

    /// Structured payload returned by the server, if any.
    pub fn details(&self) -> Option<&Value> {
        match self {
            ErrorKind::Auth { details, .. }
            | ErrorKind::Permission { details, .. }
            | ErrorKind::NotFound { details, .. }
            | ErrorKind::RateLimit { details, .. }
            | ErrorKind::Validation { details, .. }
            | ErrorKind::Server { details, .. }
            | ErrorKind::Unclassified { details, .. } => details.as_ref(),
            ErrorKind::Connection { .. }
            | ErrorKind::Timeout { .. }
            | ErrorKind::ResponseParse { .. } => None,
        }
    }

    /// Returns true if this kind is transient under `policy`.
    ///
    /// Timeouts and connection failures are always transient; everything
    /// else is transient only when its status is in the retryable set.
    /// Whether a rate limit is actually retried also depends on the remaining
    /// attempt and time budget, which the executor checks.
    pub fn is_retryable(&self, policy: &RetryPolicy) -> bool {
        match self {
            ErrorKind::Connection { .. } | ErrorKind::Timeout { .. } => true,
            ErrorKind::Auth { .. }
            | ErrorKind::Permission { .. }
            | ErrorKind::NotFound { .. }
            | ErrorKind::ResponseParse { .. } => false,
            other => other
                .status()
                .is_some_and(|status| policy.is_retryable_status(status)),
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Connection { .. } => "connection",
            ErrorKind::Timeout { .. } => "timeout",
            ErrorKind::Auth { .. } => "auth",
            ErrorKind::Permission { .. } => "permission",
            ErrorKind::NotFound { .. } => "not_found",
            ErrorKind::RateLimit { .. } => "rate_limit",
            ErrorKind::Validation { .. } => "validation",
            ErrorKind::Server { .. } => "server",
            ErrorKind::ResponseParse { .. } => "response_parse",
            ErrorKind::Unclassified { .. } => "unclassified",
        }
    }
}

/// Diagnostics for a request that ultimately failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorContext {
    /// HTTP method
    pub method: String,
    /// Endpoint path (relative to the base URL)
    pub endpoint: String,
    /// Attempts actually made
    pub attempts: u32,
    /// Wall-clock time from the first attempt to the final failure
    pub elapsed: Duration,
    /// Status of the last response, if one was received
    pub last_status: Option<u16>,
    /// Headers of the last response
    pub headers: BTreeMap<String, String>,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}, attempts={}, elapsed={:?}",
            self.method, self.endpoint, self.attempts, self.elapsed
        )?;
        if let Some(status) = self.last_status {
            write!(f, ", last_status={}", status)?;
        }
        Ok(())
    }
}

/// Errors that can occur when using the NocoDB client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Classified failure, with request diagnostics when raised by the executor
    #[error("{kind}{}", .context.as_ref().map(|c| format!(" [{}]", c)).unwrap_or_default())]
    Api {
        kind: ErrorKind,
        context: Option<Box<ErrorContext>>,
    },

    /// Caller passed an unusable argument (empty id, empty payload, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<ErrorKind> for ClientError {
    fn from(kind: ErrorKind) -> Self {
        ClientError::Api {
            kind,
            context: None,
        }
    }
}

impl ClientError {
    /// Local Validation-class error (no HTTP status).
    pub fn validation(message: impl Into<String>, details: Option<Value>) -> Self {
        ErrorKind::Validation {
            status: None,
            message: message.into(),
            details,
        }
        .into()
    }

    /// The classified kind, for `Api` errors.
    pub fn kind(&self) -> Option<&ErrorKind> {
        match self {
            ClientError::Api { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// The request diagnostics, when the error came from the executor.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            ClientError::Api { context, .. } => context.as_deref(),
            _ => None,
        }
    }

    /// HTTP status of the failure, if any.
    pub fn status(&self) -> Option<u16> {
        self.kind().and_then(ErrorKind::status)
    }

    /// Returns true if this error is transient under `policy`.
    pub fn is_retryable(&self, policy: &RetryPolicy) -> bool {
        self.kind().is_some_and(|kind| kind.is_retryable(policy))
    }

    /// Returns true for a 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self.kind(), Some(ErrorKind::NotFound { .. }))
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
