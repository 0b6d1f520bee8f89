//! Session teardown: clears every piece of client-held session state once the
//! backend reports the credential invalid, then asks the embedding
//! application to navigate to sign-in.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use relay_core::{
    ErrorDescriptor, Method, RequestDescriptor, ResponseCache, RetryPolicy, RevalidateError,
    SessionEvent, SessionEventStream, SessionEvents, TeardownGuard, TeardownState,
};
use relay_platform::{
    IdentityError, IdentityStore, OAuthSessionStore, SecretStore, SecretStoreError,
    SessionCookieJar,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::transport::Transport;

const SIGN_OUT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Secrets(#[from] SecretStoreError),
    #[error(transparent)]
    Cache(#[from] RevalidateError),
    #[error("server sign-out failed: {0}")]
    SignOut(#[from] ErrorDescriptor),
    #[error("sink panicked: {0}")]
    Panicked(String),
}

/// One backing store of session state that teardown must clear.
#[async_trait]
pub trait SessionSink: Send + Sync {
    /// Short name used in logs and events.
    fn name(&self) -> &str;

    async fn clear(&self) -> Result<(), SinkError>;
}

/// Clears the persisted identity record.
#[derive(Debug, Clone)]
pub struct IdentitySink {
    store: IdentityStore,
}

impl IdentitySink {
    pub fn new(store: IdentityStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SessionSink for IdentitySink {
    fn name(&self) -> &str {
        "identity"
    }

    async fn clear(&self) -> Result<(), SinkError> {
        self.store.clear()?;
        Ok(())
    }
}

/// Revokes the third-party OAuth session, if one is active.
pub struct OAuthSink<S: SecretStore> {
    store: OAuthSessionStore<S>,
}

impl<S: SecretStore> OAuthSink<S> {
    pub fn new(store: OAuthSessionStore<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: SecretStore> SessionSink for OAuthSink<S> {
    fn name(&self) -> &str {
        "oauth"
    }

    async fn clear(&self) -> Result<(), SinkError> {
        let revoked = self.store.revoke()?;
        debug!(revoked, "oauth session cleared");
        Ok(())
    }
}

/// Expires authentication cookies under every configured path prefix.
#[derive(Debug, Clone)]
pub struct CookieSink {
    jar: SessionCookieJar,
    names: Vec<String>,
    path_prefixes: Vec<String>,
}

impl CookieSink {
    /// `names` empty means every cookie under the prefixes.
    pub fn new(jar: SessionCookieJar, names: Vec<String>, path_prefixes: Vec<String>) -> Self {
        Self {
            jar,
            names,
            path_prefixes,
        }
    }
}

#[async_trait]
impl SessionSink for CookieSink {
    fn name(&self) -> &str {
        "cookies"
    }

    async fn clear(&self) -> Result<(), SinkError> {
        self.jar.expire(&self.names, &self.path_prefixes);
        Ok(())
    }
}

/// Drops every cached response so nothing read under the old session is served.
#[derive(Debug, Clone)]
pub struct ResponseCacheSink {
    cache: ResponseCache,
}

impl ResponseCacheSink {
    pub fn new(cache: ResponseCache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl SessionSink for ResponseCacheSink {
    fn name(&self) -> &str {
        "response-cache"
    }

    async fn clear(&self) -> Result<(), SinkError> {
        let dropped = self.cache.clear()?;
        debug!(dropped, "response cache cleared");
        Ok(())
    }
}

/// Ends the server-side session with a single sign-out call.
#[derive(Debug, Clone)]
pub struct ServerSignOutSink {
    transport: Transport,
    url: Url,
}

impl ServerSignOutSink {
    pub fn new(transport: Transport, url: Url) -> Self {
        Self { transport, url }
    }
}

#[async_trait]
impl SessionSink for ServerSignOutSink {
    fn name(&self) -> &str {
        "server-sign-out"
    }

    async fn clear(&self) -> Result<(), SinkError> {
        let request = RequestDescriptor::new(Method::Post, self.url.as_str(), SIGN_OUT_TIMEOUT);
        self.transport
            .execute(&request, &RetryPolicy::no_retry(), None)
            .await?;
        Ok(())
    }
}

/// Result of one [`SessionInvalidator::invalidate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// This call ran the full sequence.
    Completed { failed_sinks: usize },
    /// Another teardown was already running.
    Skipped,
}

struct InvalidatorInner {
    guard: TeardownGuard,
    sinks: Vec<Arc<dyn SessionSink>>,
    events: SessionEvents,
    sign_in_path: String,
}

/// Process-wide session teardown. Clones share the same guard.
#[derive(Clone)]
pub struct SessionInvalidator {
    inner: Arc<InvalidatorInner>,
}

impl SessionInvalidator {
    pub fn builder(sign_in_path: impl Into<String>) -> SessionInvalidatorBuilder {
        SessionInvalidatorBuilder {
            sign_in_path: sign_in_path.into(),
            sinks: Vec::new(),
            events: None,
        }
    }

    pub fn subscribe(&self) -> SessionEventStream {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> TeardownState {
        self.inner.guard.state()
    }

    pub fn sign_in_path(&self) -> &str {
        &self.inner.sign_in_path
    }

    /// Clear every registered sink in order, then emit the sign-in redirect.
    ///
    /// A call made while another teardown is running returns
    /// [`TeardownOutcome::Skipped`] without touching any sink. Sink failures
    /// and panics are logged and reported as events; the sequence always
    /// reaches the redirect.
    pub async fn invalidate(&self) -> TeardownOutcome {
        let Some(ticket) = self.inner.guard.try_begin() else {
            debug!("session teardown already running; skipping");
            return TeardownOutcome::Skipped;
        };

        info!(sinks = self.inner.sinks.len(), "tearing down client session");
        self.inner.events.emit(SessionEvent::TeardownStarted);

        let mut failed_sinks = 0;
        for sink in &self.inner.sinks {
            let name = sink.name().to_owned();
            let task = {
                let sink = Arc::clone(sink);
                tokio::spawn(async move { sink.clear().await })
            };
            let result = match task.await {
                Ok(result) => result,
                Err(join_err) => Err(SinkError::Panicked(join_err.to_string())),
            };
            match result {
                Ok(()) => debug!(sink = %name, "session sink cleared"),
                Err(err) => {
                    failed_sinks += 1;
                    warn!(sink = %name, error = %err, "session sink failed to clear");
                    self.inner.events.emit(SessionEvent::SinkFailed {
                        sink: name,
                        message: err.to_string(),
                    });
                }
            }
        }

        self.inner.events.emit(SessionEvent::RedirectToSignIn {
            path: self.inner.sign_in_path.clone(),
        });
        drop(ticket);
        self.inner
            .events
            .emit(SessionEvent::TeardownFinished { failed_sinks });
        info!(failed_sinks, "client session torn down");

        TeardownOutcome::Completed { failed_sinks }
    }

    /// Run [`SessionInvalidator::invalidate`] in the background.
    pub fn spawn_invalidate(&self) -> JoinHandle<TeardownOutcome> {
        let invalidator = self.clone();
        tokio::spawn(async move { invalidator.invalidate().await })
    }
}

pub struct SessionInvalidatorBuilder {
    sign_in_path: String,
    sinks: Vec<Arc<dyn SessionSink>>,
    events: Option<SessionEvents>,
}

impl SessionInvalidatorBuilder {
    /// Register a sink. Sinks are cleared in registration order.
    pub fn sink(mut self, sink: impl SessionSink + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    pub fn events(mut self, events: SessionEvents) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> SessionInvalidator {
        SessionInvalidator {
            inner: Arc::new(InvalidatorInner {
                guard: TeardownGuard::new(),
                sinks: self.sinks,
                events: self.events.unwrap_or_default(),
                sign_in_path: self.sign_in_path,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::recv_event;
    use relay_platform::{IdentityRecord, InMemorySecretStore, OAuthSession, UserProfile};
    use std::{
        env,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::{SystemTime, UNIX_EPOCH},
    };
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use crate::config::ClientConfig;

    struct RecordingSink {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl SessionSink for RecordingSink {
        fn name(&self) -> &str {
            self.name
        }

        async fn clear(&self) -> Result<(), SinkError> {
            if let Ok(mut log) = self.log.lock() {
                log.push(self.name);
            }
            if self.fail {
                return Err(SinkError::Secrets(SecretStoreError::Unavailable(
                    "keychain locked".to_owned(),
                )));
            }
            Ok(())
        }
    }

    struct PanickingSink;

    #[async_trait]
    impl SessionSink for PanickingSink {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn clear(&self) -> Result<(), SinkError> {
            panic!("sink exploded");
        }
    }

    struct SlowCountingSink {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SessionSink for SlowCountingSink {
        fn name(&self) -> &str {
            "slow"
        }

        async fn clear(&self) -> Result<(), SinkError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }
    }

    fn recording(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    ) -> RecordingSink {
        RecordingSink {
            name,
            log: Arc::clone(log),
            fail,
        }
    }

    async fn drain(events: &mut SessionEventStream) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        while let Some(event) = recv_event(events).await {
            let finished = matches!(event, SessionEvent::TeardownFinished { .. });
            seen.push(event);
            if finished {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn clears_sinks_in_order_then_redirects() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let invalidator = SessionInvalidator::builder("/login")
            .sink(recording("identity", &log, false))
            .sink(recording("oauth", &log, false))
            .sink(recording("cookies", &log, false))
            .build();
        let mut events = invalidator.subscribe();

        let outcome = invalidator.invalidate().await;

        assert_eq!(outcome, TeardownOutcome::Completed { failed_sinks: 0 });
        assert_eq!(
            *log.lock().expect("log lock"),
            vec!["identity", "oauth", "cookies"]
        );
        assert_eq!(
            drain(&mut events).await,
            vec![
                SessionEvent::TeardownStarted,
                SessionEvent::RedirectToSignIn {
                    path: "/login".to_owned()
                },
                SessionEvent::TeardownFinished { failed_sinks: 0 },
            ]
        );
        assert_eq!(invalidator.state(), TeardownState::Idle);
    }

    #[tokio::test]
    async fn failing_sink_does_not_stop_later_sinks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let invalidator = SessionInvalidator::builder("/login")
            .sink(recording("identity", &log, false))
            .sink(recording("oauth", &log, true))
            .sink(recording("cookies", &log, false))
            .build();
        let mut events = invalidator.subscribe();

        let outcome = invalidator.invalidate().await;

        assert_eq!(outcome, TeardownOutcome::Completed { failed_sinks: 1 });
        assert_eq!(
            *log.lock().expect("log lock"),
            vec!["identity", "oauth", "cookies"]
        );
        let seen = drain(&mut events).await;
        assert!(seen.iter().any(|event| matches!(
            event,
            SessionEvent::SinkFailed { sink, .. } if sink == "oauth"
        )));
        assert!(seen.contains(&SessionEvent::RedirectToSignIn {
            path: "/login".to_owned()
        }));
        assert_eq!(invalidator.state(), TeardownState::Idle);
    }

    #[tokio::test]
    async fn panicking_sink_is_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let invalidator = SessionInvalidator::builder("/login")
            .sink(PanickingSink)
            .sink(recording("cookies", &log, false))
            .build();

        let outcome = invalidator.invalidate().await;

        assert_eq!(outcome, TeardownOutcome::Completed { failed_sinks: 1 });
        assert_eq!(*log.lock().expect("log lock"), vec!["cookies"]);
        assert_eq!(invalidator.state(), TeardownState::Idle);
    }

    #[tokio::test]
    async fn concurrent_invalidations_run_one_teardown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let invalidator = SessionInvalidator::builder("/login")
            .sink(SlowCountingSink {
                runs: Arc::clone(&runs),
            })
            .build();

        let handles = (0..8)
            .map(|_| invalidator.spawn_invalidate())
            .collect::<Vec<_>>();
        let mut completed = 0;
        for handle in handles {
            if let TeardownOutcome::Completed { .. } = handle.await.expect("join") {
                completed += 1;
            }
        }

        assert_eq!(completed, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(invalidator.state(), TeardownState::Idle);
    }

    #[tokio::test]
    async fn standard_sinks_clear_platform_state() {
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let identity_path = env::temp_dir().join(format!("relay-session-{now_nanos}.json"));
        let identity = IdentityStore::open(&identity_path).expect("open identity");
        identity
            .set(IdentityRecord {
                user: UserProfile {
                    id: "99".to_owned(),
                    email: "alice@example.org".to_owned(),
                    name: None,
                    role: None,
                },
                credential: "jwt".to_owned(),
            })
            .expect("seed identity");

        let oauth = OAuthSessionStore::new(InMemorySecretStore::default(), "relay");
        oauth
            .save(&OAuthSession {
                provider: "google".to_owned(),
                access_token: "token".to_owned(),
                refresh_token: None,
                expires_at: None,
            })
            .expect("seed oauth");

        let jar = SessionCookieJar::new();
        let origin = Url::parse("https://app.example.org/").expect("url");
        jar.add_cookie_str("session=abc; Path=/", &origin);
        jar.add_cookie_str("session=def; Path=/dashboard", &origin);
        jar.add_cookie_str("locale=en; Path=/", &origin);

        let invalidator = SessionInvalidator::builder("/login")
            .sink(IdentitySink::new(identity.clone()))
            .sink(OAuthSink::new(oauth.clone()))
            .sink(CookieSink::new(
                jar.clone(),
                vec!["session".to_owned()],
                vec!["/".to_owned(), "/dashboard".to_owned()],
            ))
            .build();

        let outcome = invalidator.invalidate().await;

        assert_eq!(outcome, TeardownOutcome::Completed { failed_sinks: 0 });
        assert_eq!(identity.current(), None);
        assert!(!identity_path.exists());
        assert_eq!(oauth.load().expect("load oauth"), None);
        assert!(!jar.contains("session"));
        assert!(jar.contains("locale"));
    }

    #[tokio::test]
    async fn cache_sink_drops_responses_from_the_old_session() {
        let cache = ResponseCache::new();
        let key = ResponseCache::key_for(Method::Get, "/loans", Some("jwt"));
        cache.insert(
            &key,
            serde_json::json!({"success": true, "data": [1, 2]}),
            relay_core::TagSet::new(),
            None,
            cache.epoch(),
        );
        let inflight_epoch = cache.epoch();

        let invalidator = SessionInvalidator::builder("/login")
            .sink(ResponseCacheSink::new(cache.clone()))
            .build();
        let outcome = invalidator.invalidate().await;

        assert_eq!(outcome, TeardownOutcome::Completed { failed_sinks: 0 });
        assert!(cache.is_empty());
        cache.insert(
            &key,
            serde_json::json!({"success": true, "data": [3]}),
            relay_core::TagSet::new(),
            None,
            inflight_epoch,
        );
        assert_eq!(cache.get(&key), None);
    }

    #[tokio::test]
    async fn server_sign_out_failure_is_tolerated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/signout"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let base = Url::parse(&server.uri()).expect("base url");
        let transport = Transport::new(&ClientConfig::new(base.clone()), SessionCookieJar::new())
            .expect("transport");
        let sign_out = base.join("api/auth/signout").expect("sign-out url");
        let log = Arc::new(Mutex::new(Vec::new()));
        let invalidator = SessionInvalidator::builder("/login")
            .sink(ServerSignOutSink::new(transport, sign_out))
            .sink(recording("after", &log, false))
            .build();

        let outcome = invalidator.invalidate().await;

        assert_eq!(outcome, TeardownOutcome::Completed { failed_sinks: 1 });
        assert_eq!(*log.lock().expect("log lock"), vec!["after"]);
    }
}
