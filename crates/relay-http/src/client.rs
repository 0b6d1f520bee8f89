//! Client façade: the verbs every data-fetching and data-mutating operation
//! goes through.

use std::{sync::Arc, time::Duration};

use relay_core::{
    CacheDirectives, CacheMode, ErrorDescriptor, ErrorKind, FormData, Method, RequestBody,
    RequestDescriptor, ResponseCache, ResponseEnvelope, RetryPolicy, Revalidator, TagSet,
};
use reqwest::header::AUTHORIZATION;
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    classify, config::ClientConfig, session::SessionInvalidator, transport::Transport,
};

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub cache: CacheDirectives,
    /// Tags to revalidate after a successful mutation.
    pub invalidates: TagSet,
    pub headers: Vec<(String, String)>,
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache.mode = mode;
        self
    }

    pub fn revalidate_after(mut self, max_age: Duration) -> Self {
        self.cache = self.cache.revalidate_after(max_age);
        self
    }

    pub fn tags(mut self, tags: impl Into<TagSet>) -> Self {
        self.cache = self.cache.tags(tags);
        self
    }

    pub fn invalidates(mut self, tags: impl Into<TagSet>) -> Self {
        self.invalidates = tags.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn cancel_with(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// State shared by both clients.
#[derive(Clone)]
struct Dispatcher {
    transport: Transport,
    retry: RetryPolicy,
    timeout: Duration,
    upload_timeout: Duration,
    idempotency_keys: bool,
    cache: Option<ResponseCache>,
    revalidators: Vec<Arc<dyn Revalidator>>,
    invalidator: Option<SessionInvalidator>,
}

struct Call<'a> {
    method: Method,
    path: &'a str,
    credential: Option<&'a str>,
    body: Option<RequestBody>,
    timeout: Duration,
}

impl Dispatcher {
    fn new(transport: Transport, config: &ClientConfig) -> Self {
        Self {
            transport,
            retry: config.retry,
            timeout: config.timeout,
            upload_timeout: config.upload_timeout,
            idempotency_keys: config.idempotency_keys,
            cache: None,
            revalidators: Vec::new(),
            invalidator: None,
        }
    }

    fn attach_cache(&mut self, cache: ResponseCache) {
        self.revalidators.insert(0, Arc::new(cache.clone()));
        self.cache = Some(cache);
    }

    fn describe(&self, call: &mut Call<'_>, options: &RequestOptions) -> RequestDescriptor {
        let mut request =
            RequestDescriptor::new(call.method, call.path, call.timeout).cache(options.cache.clone());
        for (name, value) in &options.headers {
            request = request.header(name.clone(), value.clone());
        }
        if let Some(credential) = call.credential {
            request = request.header(AUTHORIZATION.as_str(), format!("Bearer {credential}"));
        }
        // One key per logical call; every retry of it reuses the same one.
        if self.idempotency_keys
            && call.method.is_mutating()
            && request.header_value(IDEMPOTENCY_KEY_HEADER).is_none()
        {
            request = request.header(IDEMPOTENCY_KEY_HEADER, Uuid::new_v4().to_string());
        }
        if let Some(body) = call.body.take() {
            request = request.body(body);
        }
        request
    }

    async fn send<T: DeserializeOwned>(
        &self,
        mut call: Call<'_>,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope<T>, ErrorDescriptor> {
        let request = self.describe(&mut call, &options);

        let cache = self.cache.as_ref().filter(|_| request.method == Method::Get);
        let cache_key = cache.map(|_| ResponseCache::key_for(request.method, &request.path, call.credential));
        if let (Some(cache), Some(key)) = (cache, cache_key.as_deref())
            && request.cache.allows_cached_read()
            && let Some(cached) = cache.get(key)
        {
            match serde_json::from_value::<ResponseEnvelope<T>>(cached) {
                Ok(envelope) => {
                    debug!(path = %request.path, "served from response cache");
                    return Ok(envelope);
                }
                Err(err) => debug!(path = %request.path, error = %err, "cached body no longer decodes"),
            }
        }
        let fetched_at_epoch = cache.map(ResponseCache::epoch).unwrap_or(0);

        let response = match self
            .transport
            .execute(&request, &self.retry, options.cancel.as_ref())
            .await
        {
            Ok(response) => response,
            Err(err) => return Err(self.on_failure(&request, err)),
        };

        let body = response.json::<serde_json::Value>();
        let rejected = body.as_ref().is_ok_and(|body| envelope_flag(body) == Some(false));

        // The write already happened unless the backend said otherwise, even
        // when the body does not decode into the caller's type.
        if request.method.is_mutating() && !options.invalidates.is_empty() && !rejected {
            relay_core::revalidate(&self.revalidators, &options.invalidates).await;
        }

        let body = body?;
        if rejected {
            let err = ErrorDescriptor::from_response(response.status, &response.body);
            let err = ErrorDescriptor {
                kind: ErrorKind::ClientError,
                ..err
            };
            return Err(self.on_failure(&request, err));
        }
        let envelope = serde_json::from_value::<ResponseEnvelope<T>>(body.clone())
            .map_err(classify::decode_failure)?;

        if let (Some(cache), Some(key)) = (cache, cache_key.as_deref())
            && request.cache.allows_store()
            && envelope_flag(&body) == Some(true)
        {
            cache.insert(
                key,
                body,
                request.cache.tags.clone(),
                request.cache.revalidate_after,
                fetched_at_epoch,
            );
        }
        Ok(envelope)
    }

    fn on_failure(&self, request: &RequestDescriptor, err: ErrorDescriptor) -> ErrorDescriptor {
        if err.is_unauthorized() {
            match &self.invalidator {
                Some(invalidator) => {
                    warn!(
                        method = %request.method,
                        path = %request.path,
                        status = ?err.status,
                        "credentials rejected; invalidating session"
                    );
                    // Not awaited: the caller gets its error right away.
                    drop(invalidator.spawn_invalidate());
                }
                None => debug!(path = %request.path, "unauthorized without a session to invalidate"),
            }
        } else {
            debug!(
                method = %request.method,
                path = %request.path,
                kind = %err.kind,
                status = ?err.status,
                "request failed"
            );
        }
        err
    }
}

/// The envelope's `success` field, when present.
fn envelope_flag(body: &serde_json::Value) -> Option<bool> {
    body.get("success").and_then(serde_json::Value::as_bool)
}

fn encode_body<B: Serialize + ?Sized>(body: &B) -> Result<RequestBody, ErrorDescriptor> {
    serde_json::to_value(body).map(RequestBody::Json).map_err(|err| {
        ErrorDescriptor::new(
            ErrorKind::ClientError,
            format!("failed to encode request body: {err}"),
        )
    })
}

/// Client for endpoints that need no credential.
#[derive(Clone)]
pub struct PublicClient {
    dispatcher: Dispatcher,
}

impl PublicClient {
    pub fn new(transport: Transport, config: &ClientConfig) -> Self {
        Self {
            dispatcher: Dispatcher::new(transport, config),
        }
    }

    /// Serve and store GET results through `cache`. The cache is also
    /// revalidated after mutations that declare tags.
    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.dispatcher.attach_cache(cache);
        self
    }

    pub fn with_revalidator(mut self, revalidator: Arc<dyn Revalidator>) -> Self {
        self.dispatcher.revalidators.push(revalidator);
        self
    }

    /// Public endpoints can still report a stale session cookie.
    pub fn with_invalidator(mut self, invalidator: SessionInvalidator) -> Self {
        self.dispatcher.invalidator = Some(invalidator);
        self
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope<T>, ErrorDescriptor> {
        self.json_call(Method::Get, path, None, options).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope<T>, ErrorDescriptor> {
        self.json_call(Method::Post, path, Some(encode_body(body)?), options)
            .await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope<T>, ErrorDescriptor> {
        self.json_call(Method::Put, path, Some(encode_body(body)?), options)
            .await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope<T>, ErrorDescriptor> {
        self.json_call(Method::Patch, path, Some(encode_body(body)?), options)
            .await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope<T>, ErrorDescriptor> {
        self.json_call(Method::Delete, path, None, options).await
    }

    /// POST a multipart form within the normal budget.
    pub async fn form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: FormData,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope<T>, ErrorDescriptor> {
        self.json_call(Method::Post, path, Some(RequestBody::Form(form)), options)
            .await
    }

    async fn json_call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<RequestBody>,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope<T>, ErrorDescriptor> {
        let call = Call {
            method,
            path,
            credential: None,
            body,
            timeout: self.dispatcher.timeout,
        };
        self.dispatcher.send(call, options).await
    }
}

/// Client for endpoints that need the caller's bearer credential.
///
/// The credential is passed on every call and never stored.
#[derive(Clone)]
pub struct AuthedClient {
    dispatcher: Dispatcher,
}

impl AuthedClient {
    pub fn new(transport: Transport, config: &ClientConfig, invalidator: SessionInvalidator) -> Self {
        let mut dispatcher = Dispatcher::new(transport, config);
        dispatcher.invalidator = Some(invalidator);
        Self { dispatcher }
    }

    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.dispatcher.attach_cache(cache);
        self
    }

    pub fn with_revalidator(mut self, revalidator: Arc<dyn Revalidator>) -> Self {
        self.dispatcher.revalidators.push(revalidator);
        self
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        credential: &str,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope<T>, ErrorDescriptor> {
        self.call(Method::Get, path, credential, None, false, options)
            .await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        credential: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope<T>, ErrorDescriptor> {
        let body = encode_body(body)?;
        self.call(Method::Post, path, credential, Some(body), false, options)
            .await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        credential: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope<T>, ErrorDescriptor> {
        let body = encode_body(body)?;
        self.call(Method::Put, path, credential, Some(body), false, options)
            .await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        credential: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope<T>, ErrorDescriptor> {
        let body = encode_body(body)?;
        self.call(Method::Patch, path, credential, Some(body), false, options)
            .await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
        credential: &str,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope<T>, ErrorDescriptor> {
        self.call(Method::Delete, path, credential, None, false, options)
            .await
    }

    /// POST a multipart form within the normal budget.
    pub async fn form<T: DeserializeOwned>(
        &self,
        path: &str,
        credential: &str,
        form: FormData,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope<T>, ErrorDescriptor> {
        let body = RequestBody::Form(form);
        self.call(Method::Post, path, credential, Some(body), false, options)
            .await
    }

    /// Send a multipart form with the long upload budget per attempt.
    pub async fn upload<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        credential: &str,
        form: FormData,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope<T>, ErrorDescriptor> {
        debug!(%method, path, payload_bytes = form.payload_bytes(), "starting upload");
        let body = RequestBody::Form(form);
        self.call(method, path, credential, Some(body), true, options)
            .await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        credential: &str,
        body: Option<RequestBody>,
        upload: bool,
        options: RequestOptions,
    ) -> Result<ResponseEnvelope<T>, ErrorDescriptor> {
        let timeout = if upload {
            self.dispatcher.upload_timeout
        } else {
            self.dispatcher.timeout
        };
        let call = Call {
            method,
            path,
            credential: Some(credential),
            body,
            timeout,
        };
        self.dispatcher.send(call, options).await
    }
}
