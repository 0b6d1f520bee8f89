//! Classification of failures that never produced an HTTP status.

use std::time::Duration;

use relay_core::{ErrorDescriptor, ErrorKind};

/// Why an attempt stopped before a decisive response arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interruption {
    /// The per-attempt deadline fired.
    Deadline(Duration),
    /// Response headers did not arrive in time.
    HeaderDeadline(Duration),
    /// The caller cancelled the call.
    Cancelled,
}

pub(crate) fn interrupted(reason: Interruption) -> ErrorDescriptor {
    match reason {
        Interruption::Deadline(timeout) => ErrorDescriptor::new(
            ErrorKind::Timeout,
            format!("request timed out after {} ms", timeout.as_millis()),
        ),
        Interruption::HeaderDeadline(timeout) => ErrorDescriptor::new(
            ErrorKind::HeaderTimeout,
            format!(
                "response headers not received within {} ms",
                timeout.as_millis()
            ),
        ),
        Interruption::Cancelled => ErrorDescriptor::new(ErrorKind::Timeout, "request cancelled"),
    }
}

/// Map a transport failure to a descriptor. Raw `reqwest` errors stop here.
pub(crate) fn transport_failure(err: &reqwest::Error) -> ErrorDescriptor {
    if err.is_timeout() {
        return ErrorDescriptor::new(ErrorKind::Timeout, format!("request timed out: {err}"));
    }
    if err.is_decode() {
        return decode_failure(err);
    }
    if err.is_builder() {
        return ErrorDescriptor::new(ErrorKind::ClientError, format!("invalid request: {err}"));
    }
    let detail = if err.is_connect() {
        "connection failed"
    } else if err.is_request() {
        "request could not be sent"
    } else if err.is_body() {
        "response body interrupted"
    } else {
        "network failure"
    };
    ErrorDescriptor::new(ErrorKind::NetworkError, format!("{detail}: {err}"))
}

/// A 2xx body that could not be decoded into the expected envelope.
pub(crate) fn decode_failure(err: impl std::fmt::Display) -> ErrorDescriptor {
    ErrorDescriptor::new(
        ErrorKind::NetworkError,
        format!("failed to decode response: {err}"),
    )
}

/// Parse a `Retry-After` header given in seconds.
pub(crate) fn retry_after_hint(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn interruptions_map_to_timeout_kinds() {
        let deadline = interrupted(Interruption::Deadline(Duration::from_millis(150)));
        assert_eq!(deadline.kind, ErrorKind::Timeout);
        assert!(deadline.message.contains("150 ms"));

        let header = interrupted(Interruption::HeaderDeadline(Duration::from_secs(1)));
        assert_eq!(header.kind, ErrorKind::HeaderTimeout);

        let cancelled = interrupted(Interruption::Cancelled);
        assert_eq!(cancelled.kind, ErrorKind::Timeout);
        assert_eq!(cancelled.status, None);
    }

    #[test]
    fn decode_failure_is_network_error() {
        let err = serde_json::from_str::<serde_json::Value>("{oops").expect_err("invalid json");
        let descriptor = decode_failure(err);
        assert_eq!(descriptor.kind, ErrorKind::NetworkError);
        assert!(descriptor.message.starts_with("failed to decode response"));
    }

    #[test]
    fn retry_after_accepts_seconds_only() {
        let seconds = HeaderValue::from_static("3");
        assert_eq!(retry_after_hint(Some(&seconds)), Some(Duration::from_secs(3)));

        let date = HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(retry_after_hint(Some(&date)), None);
        assert_eq!(retry_after_hint(None), None);
    }

    #[tokio::test]
    async fn refused_connection_is_network_error() {
        let client = reqwest::Client::new();
        let err = client
            .get("http://127.0.0.1:9/unreachable")
            .send()
            .await
            .expect_err("nothing listens on the discard port");
        let descriptor = transport_failure(&err);
        assert_eq!(descriptor.kind, ErrorKind::NetworkError);
    }
}
