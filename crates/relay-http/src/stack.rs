//! Assembly of a transport, session teardown and both clients from
//! [`ClientConfig`].

use std::sync::Arc;

use relay_core::{ResponseCache, SessionEventStream};
use relay_platform::{IdentityError, IdentityStore, OAuthSessionStore, SecretStore, SessionCookieJar};
use thiserror::Error;
use tracing::info;

use crate::{
    client::{AuthedClient, PublicClient},
    config::ClientConfig,
    revalidate::RemoteRevalidator,
    session::{
        CookieSink, IdentitySink, OAuthSink, ResponseCacheSink, ServerSignOutSink,
        SessionInvalidator,
    },
    transport::{Transport, TransportBuildError},
};

#[derive(Debug, Error)]
pub enum StackError {
    #[error(transparent)]
    Transport(#[from] TransportBuildError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Everything an application needs to talk to the backend.
#[derive(Clone)]
pub struct RelayStack {
    pub config: ClientConfig,
    pub cookies: SessionCookieJar,
    pub identity: IdentityStore,
    pub cache: ResponseCache,
    pub invalidator: SessionInvalidator,
    pub public: PublicClient,
    pub authed: AuthedClient,
}

impl RelayStack {
    /// Build the stack. Sinks are registered as identity, OAuth session,
    /// cookies, response cache, then server sign-out when a sign-out URL is
    /// configured.
    pub fn from_config<S>(config: ClientConfig, secrets: S) -> Result<Self, StackError>
    where
        S: SecretStore + 'static,
    {
        let cookies = SessionCookieJar::new();
        let transport = Transport::new(&config, cookies.clone())?;
        let identity = IdentityStore::open(config.identity_path())?;
        let cache = ResponseCache::new();

        let mut builder = SessionInvalidator::builder(config.sign_in_path.clone())
            .sink(IdentitySink::new(identity.clone()))
            .sink(OAuthSink::new(OAuthSessionStore::new(
                secrets,
                config.oauth_service.clone(),
            )))
            .sink(CookieSink::new(
                cookies.clone(),
                config.auth_cookie_names.clone(),
                config.cookie_paths.clone(),
            ))
            .sink(ResponseCacheSink::new(cache.clone()));
        if let Some(sign_out_url) = config.sign_out_url.clone() {
            builder = builder.sink(ServerSignOutSink::new(transport.clone(), sign_out_url));
        }
        let invalidator = builder.build();

        let mut public = PublicClient::new(transport.clone(), &config)
            .with_cache(cache.clone())
            .with_invalidator(invalidator.clone());
        let mut authed = AuthedClient::new(transport, &config, invalidator.clone())
            .with_cache(cache.clone());
        if let Some(remote) = RemoteRevalidator::from_config(&config)? {
            let remote = Arc::new(remote);
            public = public.with_revalidator(remote.clone());
            authed = authed.with_revalidator(remote);
        }

        info!(
            base_url = %config.base_url,
            identity_path = %config.identity_path().display(),
            signed_in = identity.current().is_some(),
            "relay stack ready"
        );

        Ok(Self {
            config,
            cookies,
            identity,
            cache,
            invalidator,
            public,
            authed,
        })
    }

    pub fn subscribe(&self) -> SessionEventStream {
        self.invalidator.subscribe()
    }

    /// Credential of the persisted identity, if someone is signed in.
    pub fn credential(&self) -> Option<String> {
        self.identity.credential()
    }
}
