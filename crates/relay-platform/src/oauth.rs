//! Third-party OAuth session kept in a secret store.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const OAUTH_SESSION_ACCOUNT: &str = "oauth-session";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecretStoreError {
    #[error("secret not found")]
    NotFound,
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
    #[error("secret store backend failure: {0}")]
    Backend(String),
    #[error("stored oauth session is not valid json: {0}")]
    Corrupt(String),
}

/// Backing storage for secrets, addressed by service and account.
pub trait SecretStore: Send + Sync {
    fn set_secret(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), SecretStoreError>;

    fn get_secret(&self, service: &str, account: &str) -> Result<String, SecretStoreError>;

    fn delete_secret(&self, service: &str, account: &str) -> Result<(), SecretStoreError>;
}

/// Process-local secret store, used in tests and headless runs.
#[derive(Clone, Default)]
pub struct InMemorySecretStore {
    data: Arc<RwLock<HashMap<(String, String), String>>>,
}

impl SecretStore for InMemorySecretStore {
    fn set_secret(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), SecretStoreError> {
        self.data
            .write()
            .map_err(|_| SecretStoreError::Backend("poisoned lock".to_owned()))?
            .insert((service.to_owned(), account.to_owned()), secret.to_owned());
        Ok(())
    }

    fn get_secret(&self, service: &str, account: &str) -> Result<String, SecretStoreError> {
        self.data
            .read()
            .map_err(|_| SecretStoreError::Backend("poisoned lock".to_owned()))?
            .get(&(service.to_owned(), account.to_owned()))
            .cloned()
            .ok_or(SecretStoreError::NotFound)
    }

    fn delete_secret(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        self.data
            .write()
            .map_err(|_| SecretStoreError::Backend("poisoned lock".to_owned()))?
            .remove(&(service.to_owned(), account.to_owned()))
            .map(|_| ())
            .ok_or(SecretStoreError::NotFound)
    }
}

/// Secret store backed by the OS keychain.
#[cfg(feature = "os-keyring")]
#[derive(Default, Clone, Copy)]
pub struct OsKeyringSecretStore;

#[cfg(feature = "os-keyring")]
impl SecretStore for OsKeyringSecretStore {
    fn set_secret(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), SecretStoreError> {
        keyring_entry(service, account)?
            .set_password(secret)
            .map_err(|err| SecretStoreError::Backend(err.to_string()))
    }

    fn get_secret(&self, service: &str, account: &str) -> Result<String, SecretStoreError> {
        keyring_entry(service, account)?
            .get_password()
            .map_err(map_keyring_error)
    }

    fn delete_secret(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        keyring_entry(service, account)?
            .delete_credential()
            .map_err(map_keyring_error)
    }
}

#[cfg(feature = "os-keyring")]
fn keyring_entry(service: &str, account: &str) -> Result<keyring::Entry, SecretStoreError> {
    keyring::Entry::new(service, account).map_err(|err| SecretStoreError::Backend(err.to_string()))
}

#[cfg(feature = "os-keyring")]
fn map_keyring_error(err: keyring::Error) -> SecretStoreError {
    match err {
        keyring::Error::NoEntry => SecretStoreError::NotFound,
        keyring::Error::NoStorageAccess(inner) => SecretStoreError::Unavailable(inner.to_string()),
        other => SecretStoreError::Backend(other.to_string()),
    }
}

/// Tokens issued by the third-party identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthSession {
    /// Provider name, for example `google`.
    pub provider: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix timestamp in seconds when the access token expires.
    pub expires_at: Option<i64>,
}

/// OAuth session persisted under one service name.
#[derive(Clone)]
pub struct OAuthSessionStore<S: SecretStore> {
    inner: S,
    service: String,
}

impl<S: SecretStore> OAuthSessionStore<S> {
    pub fn new(inner: S, service: impl Into<String>) -> Self {
        Self {
            inner,
            service: service.into(),
        }
    }

    pub fn save(&self, session: &OAuthSession) -> Result<(), SecretStoreError> {
        let encoded = serde_json::to_string(session)
            .map_err(|err| SecretStoreError::Corrupt(err.to_string()))?;
        self.inner
            .set_secret(&self.service, OAUTH_SESSION_ACCOUNT, &encoded)
    }

    /// Active session, or `None` when nobody signed in through the provider.
    pub fn load(&self) -> Result<Option<OAuthSession>, SecretStoreError> {
        let raw = match self.inner.get_secret(&self.service, OAUTH_SESSION_ACCOUNT) {
            Ok(raw) => raw,
            Err(SecretStoreError::NotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| SecretStoreError::Corrupt(err.to_string()))
    }

    /// Remove the session. Returns whether one was active.
    pub fn revoke(&self) -> Result<bool, SecretStoreError> {
        match self.inner.delete_secret(&self.service, OAUTH_SESSION_ACCOUNT) {
            Ok(()) => Ok(true),
            Err(SecretStoreError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn google_session() -> OAuthSession {
        OAuthSession {
            provider: "google".to_owned(),
            access_token: "ya29.token".to_owned(),
            refresh_token: Some("refresh".to_owned()),
            expires_at: Some(1_707_825_600),
        }
    }

    #[test]
    fn session_save_load_revoke() {
        let store = OAuthSessionStore::new(InMemorySecretStore::default(), "relay");
        assert_eq!(store.load().expect("load empty"), None);

        store.save(&google_session()).expect("save should work");
        assert_eq!(store.load().expect("load"), Some(google_session()));

        assert!(store.revoke().expect("revoke active session"));
        assert_eq!(store.load().expect("load after revoke"), None);
        assert!(!store.revoke().expect("revoke without session"));
    }

    #[test]
    fn stores_are_isolated_by_service() {
        let base = InMemorySecretStore::default();
        let web = OAuthSessionStore::new(base.clone(), "relay-web");
        let admin = OAuthSessionStore::new(base, "relay-admin");

        web.save(&google_session()).expect("save web");
        assert_eq!(admin.load().expect("load admin"), None);
        assert!(!admin.revoke().expect("revoke admin"));
        assert!(web.load().expect("load web").is_some());
    }

    #[test]
    fn corrupt_secret_is_reported() {
        let base = InMemorySecretStore::default();
        base.set_secret("relay", OAUTH_SESSION_ACCOUNT, "not json")
            .expect("seed");
        let store = OAuthSessionStore::new(base, "relay");
        assert!(matches!(store.load(), Err(SecretStoreError::Corrupt(_))));
    }

    #[derive(Default)]
    struct FailingStore;

    impl SecretStore for FailingStore {
        fn set_secret(
            &self,
            _service: &str,
            _account: &str,
            _secret: &str,
        ) -> Result<(), SecretStoreError> {
            Err(SecretStoreError::Unavailable("mock outage".to_owned()))
        }

        fn get_secret(&self, _service: &str, _account: &str) -> Result<String, SecretStoreError> {
            Err(SecretStoreError::Unavailable("mock outage".to_owned()))
        }

        fn delete_secret(&self, _service: &str, _account: &str) -> Result<(), SecretStoreError> {
            Err(SecretStoreError::Unavailable("mock outage".to_owned()))
        }
    }

    #[test]
    fn backend_outage_propagates_through_revoke() {
        let store = OAuthSessionStore::new(FailingStore, "relay");
        let err = store.revoke().expect_err("revoke must fail");
        assert_eq!(err, SecretStoreError::Unavailable("mock outage".to_owned()));
    }
}
