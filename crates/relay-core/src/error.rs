use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message shown when a failure carries no usable text of its own.
pub const GENERIC_USER_MESSAGE: &str = "Something went wrong. Please try again.";

const UNAUTHORIZED_MARKER: &str = "unauthorized";

/// Normalized failure kind used for retry decisions and user-facing handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The per-attempt deadline fired, or the call was cancelled.
    Timeout,
    /// Response headers did not arrive within the header deadline.
    HeaderTimeout,
    /// Credentials are no longer valid. Triggers session teardown.
    Unauthorized,
    /// Backend answered with a 5xx status.
    ServerError,
    /// Backend rejected the request with a 4xx status that is not an auth signal.
    ClientError,
    /// Transport failed before a response was received.
    NetworkError,
    /// Every attempt failed without a decisive response.
    ExhaustedRetries,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::HeaderTimeout => "header_timeout",
            Self::Unauthorized => "unauthorized",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::NetworkError => "network_error",
            Self::ExhaustedRetries => "exhausted_retries",
        }
    }

    /// Whether an attempt that failed with this kind may be retried by the transport.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::HeaderTimeout | Self::ServerError | Self::NetworkError
        )
    }

    /// Whether the caller should present this failure as a "try again" condition.
    pub fn is_retryable_by_user(self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::HeaderTimeout
                | Self::ServerError
                | Self::NetworkError
                | Self::ExhaustedRetries
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only failure shape handed to callers of the request layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ErrorDescriptor {
    /// HTTP status when the failure came from a response.
    pub status: Option<u16>,
    /// Human-readable message, possibly taken from the response body.
    pub message: String,
    /// Normalized failure kind.
    pub kind: ErrorKind,
    /// Optional server retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl ErrorDescriptor {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            kind,
            retry_after_ms: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Classify a non-2xx response from its status and raw body.
    ///
    /// The body may be a JSON error object or plain text; `data` is never read.
    pub fn from_response(status: u16, body: &str) -> Self {
        let message = message_from_body(body).unwrap_or_else(|| format!("HTTP {status}"));
        let kind = classify_http_status(status, &message);
        Self::new(kind, message).with_status(status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.kind == ErrorKind::Unauthorized
    }

    /// Message suitable for display, falling back to a generic one.
    pub fn user_message(&self) -> &str {
        let trimmed = self.message.trim();
        if trimmed.is_empty() {
            GENERIC_USER_MESSAGE
        } else {
            trimmed
        }
    }
}

/// Whether a response signals that the session is no longer valid.
///
/// 401 always does. The backend also reports some authorization failures as
/// 400 with "unauthorized" somewhere in the message, so that text is matched
/// case-insensitively. Keep every caller on this predicate so the heuristic
/// can be replaced by a structured error code in one place.
pub fn is_unauthorized_signal(status: u16, message: &str) -> bool {
    match status {
        401 => true,
        400 => message.to_ascii_lowercase().contains(UNAUTHORIZED_MARKER),
        _ => false,
    }
}

/// Map a non-2xx status (and its message) to an error kind.
pub fn classify_http_status(status: u16, message: &str) -> ErrorKind {
    if is_unauthorized_signal(status, message) {
        return ErrorKind::Unauthorized;
    }
    match status {
        500.. => ErrorKind::ServerError,
        _ => ErrorKind::ClientError,
    }
}

fn message_from_body(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(trimmed)
    {
        return ["message", "error"]
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(|value| match value {
                serde_json::Value::String(text) if !text.trim().is_empty() => {
                    Some(text.trim().to_owned())
                }
                serde_json::Value::Object(nested) => nested
                    .get("message")
                    .and_then(|inner| inner.as_str())
                    .map(str::to_owned),
                _ => None,
            });
    }

    Some(trimmed.to_owned())
}
