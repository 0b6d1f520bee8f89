//! Client-held session state the request layer may tear down: the persisted
//! identity record, the third-party OAuth session and the cookie jar.

pub mod cookies;
pub mod identity;
pub mod oauth;

pub use cookies::SessionCookieJar;
pub use identity::{IdentityError, IdentityRecord, IdentityStore, UserProfile};
#[cfg(feature = "os-keyring")]
pub use oauth::OsKeyringSecretStore;
pub use oauth::{InMemorySecretStore, OAuthSession, OAuthSessionStore, SecretStore, SecretStoreError};
