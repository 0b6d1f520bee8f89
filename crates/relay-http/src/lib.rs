//! `reqwest`-backed request layer: retrying transport, session teardown on
//! rejected credentials, the public and authenticated client façades, and
//! remote cache revalidation.

mod classify;
pub mod client;
pub mod config;
pub mod revalidate;
pub mod session;
pub mod stack;
pub mod transport;

pub use client::{AuthedClient, IDEMPOTENCY_KEY_HEADER, PublicClient, RequestOptions};
pub use config::{ClientConfig, ConfigError};
pub use revalidate::{REVALIDATE_SECRET_HEADER, RemoteRevalidator};
pub use session::{
    CookieSink, IdentitySink, OAuthSink, ResponseCacheSink, ServerSignOutSink, SessionInvalidator,
    SessionInvalidatorBuilder, SessionSink, SinkError, TeardownOutcome,
};
pub use stack::{RelayStack, StackError};
pub use transport::{RawResponse, Transport, TransportBuildError};
