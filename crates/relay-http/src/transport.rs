//! One logical outbound call: per-attempt deadline, bounded retries and
//! classification of every failure into an [`ErrorDescriptor`].

use std::{sync::Arc, time::Duration};

use relay_core::{
    ErrorDescriptor, ErrorKind, FormData, FormValue, Method, RequestBody, RequestDescriptor,
    RetryPolicy,
};
use relay_platform::SessionCookieJar;
use reqwest::header::{CACHE_CONTROL, HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::{
    classify::{self, Interruption},
    config::ClientConfig,
};

#[derive(Debug, Error)]
pub enum TransportBuildError {
    #[error("failed to build http client: {0}")]
    Http(String),
}

/// Response with a status the transport considered decisive.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON. Failure is reported as a network error.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ErrorDescriptor> {
        serde_json::from_str(&self.body).map_err(classify::decode_failure)
    }
}

/// Outbound HTTP transport. Knows nothing about credentials.
#[derive(Debug, Clone)]
pub struct Transport {
    http: reqwest::Client,
    base_url: Url,
    header_timeout: Duration,
}

enum AttemptFailure {
    Failed(ErrorDescriptor),
    Cancelled,
}

impl From<ErrorDescriptor> for AttemptFailure {
    fn from(err: ErrorDescriptor) -> Self {
        Self::Failed(err)
    }
}

/// Cancels the attempt token when the per-attempt deadline passes.
///
/// The timer task is aborted when the guard drops, so a finished attempt
/// leaves nothing armed.
struct AttemptDeadline {
    timer: JoinHandle<()>,
}

impl AttemptDeadline {
    fn arm(token: CancellationToken, timeout: Duration) -> Self {
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            token.cancel();
        });
        Self { timer }
    }
}

impl Drop for AttemptDeadline {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

impl Transport {
    pub fn new(config: &ClientConfig, cookies: SessionCookieJar) -> Result<Self, TransportBuildError> {
        let http = reqwest::Client::builder()
            .cookie_provider(Arc::new(cookies))
            .build()
            .map_err(|err| TransportBuildError::Http(err.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            header_timeout: config.header_timeout,
        })
    }

    /// Issue `request`, retrying transient failures within `policy`.
    ///
    /// 2xx responses are returned. Non-2xx responses and transport failures
    /// come back as descriptors; 4xx is never retried. Cancelling `parent`
    /// stops the call with [`ErrorKind::Timeout`].
    pub async fn execute(
        &self,
        request: &RequestDescriptor,
        policy: &RetryPolicy,
        parent: Option<&CancellationToken>,
    ) -> Result<RawResponse, ErrorDescriptor> {
        let url = self.url_for(&request.path)?;
        let max_attempts = policy.max_attempts();
        let mut attempt = 0_u32;

        loop {
            debug!(
                method = %request.method,
                path = %request.path,
                attempt = attempt + 1,
                max_attempts,
                "sending request"
            );

            let error = match self.attempt(&url, request, parent).await {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) => {
                    let mut error = ErrorDescriptor::from_response(response.status, &response.body);
                    if error.kind == ErrorKind::ServerError
                        && let Some(hint) =
                            classify::retry_after_hint(response.headers.get(RETRY_AFTER))
                    {
                        error = error.with_retry_after(hint);
                    }
                    error
                }
                Err(AttemptFailure::Cancelled) => {
                    debug!(path = %request.path, attempt = attempt + 1, "request cancelled by caller");
                    return Err(classify::interrupted(Interruption::Cancelled));
                }
                Err(AttemptFailure::Failed(error)) => error,
            };

            if !policy.should_retry(attempt, error.kind) {
                return Err(exhausted(error, attempt + 1));
            }

            let delay = policy.delay_for_attempt(attempt, error.retry_after_ms);
            warn!(
                method = %request.method,
                path = %request.path,
                attempt = attempt + 1,
                status = ?error.status,
                kind = %error.kind,
                delay_ms = delay.as_millis() as u64,
                "request failed; retrying"
            );

            match parent {
                Some(parent) => {
                    tokio::select! {
                        _ = parent.cancelled() => {
                            return Err(classify::interrupted(Interruption::Cancelled));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        url: &Url,
        request: &RequestDescriptor,
        parent: Option<&CancellationToken>,
    ) -> Result<RawResponse, AttemptFailure> {
        let token = parent
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let _deadline = AttemptDeadline::arm(token.clone(), request.timeout);
        let builder = self.build(url, request)?;
        let header_timeout = self.header_timeout;

        let exchange = async move {
            let response = match tokio::time::timeout(header_timeout, builder.send()).await {
                Err(_) => {
                    return Err(classify::interrupted(Interruption::HeaderDeadline(
                        header_timeout,
                    )));
                }
                Ok(Err(err)) => return Err(classify::transport_failure(&err)),
                Ok(Ok(response)) => response,
            };
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response
                .text()
                .await
                .map_err(|err| classify::transport_failure(&err))?;
            Ok(RawResponse {
                status,
                headers,
                body,
            })
        };

        tokio::select! {
            biased;
            result = exchange => result.map_err(AttemptFailure::Failed),
            _ = token.cancelled() => {
                if parent.is_some_and(CancellationToken::is_cancelled) {
                    Err(AttemptFailure::Cancelled)
                } else {
                    Err(classify::interrupted(Interruption::Deadline(request.timeout)).into())
                }
            }
        }
    }

    fn url_for(&self, path: &str) -> Result<Url, ErrorDescriptor> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| {
                ErrorDescriptor::new(ErrorKind::ClientError, format!("invalid path '{path}': {err}"))
            })
    }

    fn build(
        &self,
        url: &Url,
        request: &RequestDescriptor,
    ) -> Result<reqwest::RequestBuilder, ErrorDescriptor> {
        let mut builder = self.http.request(to_reqwest_method(request.method), url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(directive) = request.cache.mode.header_value() {
            builder = builder.header(CACHE_CONTROL, directive);
        }
        match &request.body {
            None => {}
            Some(RequestBody::Json(value)) => builder = builder.json(value),
            Some(RequestBody::Form(form)) => builder = builder.multipart(to_multipart(form)?),
        }
        Ok(builder)
    }
}

/// A connection-level failure that persisted across several attempts has no
/// decisive result of its own.
fn exhausted(error: ErrorDescriptor, attempts: u32) -> ErrorDescriptor {
    if error.kind == ErrorKind::NetworkError && attempts > 1 {
        return ErrorDescriptor {
            kind: ErrorKind::ExhaustedRetries,
            message: format!("gave up after {attempts} attempts: {}", error.message),
            ..error
        };
    }
    error
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

// Multipart bodies are streams, so every attempt gets a fresh form.
fn to_multipart(form: &FormData) -> Result<reqwest::multipart::Form, ErrorDescriptor> {
    let mut multipart = reqwest::multipart::Form::new();
    for part in form.parts() {
        multipart = match &part.value {
            FormValue::Text(text) => multipart.text(part.name.clone(), text.clone()),
            FormValue::File {
                bytes,
                file_name,
                mime,
            } => {
                let mut file = reqwest::multipart::Part::bytes(bytes.to_vec())
                    .file_name(file_name.clone());
                if let Some(mime) = mime {
                    file = file.mime_str(mime).map_err(|err| {
                        ErrorDescriptor::new(
                            ErrorKind::ClientError,
                            format!("invalid content type '{mime}' for '{}': {err}", part.name),
                        )
                    })?;
                }
                multipart.part(part.name.clone(), file)
            }
        };
    }
    Ok(multipart)
}
