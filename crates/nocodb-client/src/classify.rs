//! Error classification.
//!
//! Turns a raw HTTP outcome into either the parsed JSON body or a single
//! [`ErrorKind`]. The first matching rule wins:
//!
//! | Outcome                             | Kind            |
//! |-------------------------------------|-----------------|
//! | transport timeout                   | `Timeout`       |
//! | DNS / refused / reset               | `Connection`    |
//! | 401 / 403 / 404                     | `Auth` / `Permission` / `NotFound` |
//! | 429                                 | `RateLimit`     |
//! | other 4xx                           | `Validation`    |
//! | 5xx                                 | `Server`        |
//! | 2xx with a body that is not JSON    | `ResponseParse` |
//! | anything else                       | `Unclassified`  |

use crate::error::ErrorKind;
use crate::retry_after::{parse_retry_after, DEFAULT_RETRY_AFTER_SECS};
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

/// Maximum number of body characters kept in a `ResponseParse` error.
pub const PREVIEW_CHARS: usize = 500;

/// Classify a failure raised by the transport before a usable response
/// arrived.
pub fn classify_transport(error: &reqwest::Error) -> ErrorKind {
    let kind = if error.is_timeout() {
        ErrorKind::Timeout {
            message: error.to_string(),
        }
    } else if error.is_connect() || error.is_request() || error.is_body() {
        ErrorKind::Connection {
            message: error.to_string(),
        }
    } else {
        ErrorKind::Unclassified {
            status: error.status().map(|s| s.as_u16()),
            message: error.to_string(),
            details: None,
        }
    };

    tracing::debug!(kind = kind.label(), error = %error, "Classified transport failure");
    kind
}

/// Classify a complete response.
///
/// Returns the parsed JSON body for a successful status. An empty successful
/// body parses as `Value::Null`.
pub fn classify_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Value, ErrorKind> {
    if status.is_success() {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        return serde_json::from_slice(body).map_err(|e| ErrorKind::ResponseParse {
            message: format!("JSON parse error: {}", e),
            content_type: header_str(headers, CONTENT_TYPE.as_str()).map(String::from),
            preview: preview(body),
        });
    }

    let kind = classify_status(status, headers, body);
    tracing::debug!(
        status = status.as_u16(),
        kind = kind.label(),
        "Classified error response"
    );
    Err(kind)
}

fn classify_status(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> ErrorKind {
    let text = String::from_utf8_lossy(body).into_owned();
    let payload: Option<Value> = serde_json::from_slice(body).ok();
    let code = status.as_u16();

    match status {
        StatusCode::UNAUTHORIZED => ErrorKind::Auth {
            message: format!("Authentication failed ({}): {}", code, text),
            details: payload,
        },
        StatusCode::FORBIDDEN => ErrorKind::Permission {
            message: format!("Permission denied ({}): {}", code, text),
            details: payload,
        },
        StatusCode::NOT_FOUND => ErrorKind::NotFound {
            message: format!("Resource not found ({}): {}", code, text),
            details: payload,
        },
        StatusCode::TOO_MANY_REQUESTS => {
            let seconds = parse_retry_after(
                header_str(headers, RETRY_AFTER.as_str()),
                DEFAULT_RETRY_AFTER_SECS,
            );
            let shown = payload
                .as_ref()
                .map(Value::to_string)
                .unwrap_or_else(|| text.clone());
            ErrorKind::RateLimit {
                retry_after: Duration::from_secs(seconds),
                message: format!(
                    "Rate limit exceeded ({}), retry after {}s. Details: {}",
                    code, seconds, shown
                ),
                details: payload,
            }
        }
        s if s.is_client_error() => ErrorKind::Validation {
            status: Some(code),
            message: detail_message(payload.as_ref(), &text),
            details: payload,
        },
        s if s.is_server_error() => ErrorKind::Server {
            status: code,
            message: detail_message(payload.as_ref(), &text),
            details: payload,
        },
        _ => ErrorKind::Unclassified {
            status: Some(code),
            message: format!(
                "Unexpected status ({}): {}",
                code,
                detail_message(payload.as_ref(), &text)
            ),
            details: payload,
        },
    }
}

/// Prefer a JSON `message` or `error` field, then the whole JSON body, then
/// the raw text.
fn detail_message(payload: Option<&Value>, text: &str) -> String {
    let Some(payload) = payload else {
        return text.to_string();
    };

    ["message", "msg", "error"]
        .iter()
        .find_map(|field| payload.get(field).and_then(Value::as_str))
        .map(String::from)
        .unwrap_or_else(|| payload.to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// First [`PREVIEW_CHARS`] characters of the body, marked when truncated.
fn preview(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
