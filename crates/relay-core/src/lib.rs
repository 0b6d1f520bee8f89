//! Core contract of the outbound request layer.
//!
//! This crate defines the error taxonomy and response classifier, the retry
//! budget, request/response shapes, the session teardown guard and event
//! channel, and the cache-tag revalidation contract.

/// Tag-aware response cache and the revalidation contract.
pub mod cache;
/// Session event channel primitives.
pub mod channel;
/// Error descriptors and HTTP response classification.
pub mod error;
/// Retry budget and backoff used by the transport.
pub mod retry;
/// Session teardown guard.
pub mod state_machine;
/// Typed cache tag builders.
pub mod tags;
/// Request descriptors, payloads and response envelopes.
pub mod types;

pub use cache::{ResponseCache, RevalidateError, Revalidator, revalidate};
pub use channel::{SessionEvent, SessionEventStream, SessionEvents, recv_event};
pub use error::{
    ErrorDescriptor, ErrorKind, GENERIC_USER_MESSAGE, classify_http_status,
    is_unauthorized_signal,
};
pub use retry::{DEFAULT_MAX_RETRIES, RetryPolicy};
pub use state_machine::{TeardownGuard, TeardownState, TeardownTicket};
pub use tags::{CacheTag, TagSet};
pub use types::{
    CacheDirectives, CacheMode, FormData, FormPart, FormValue, Method, RequestBody,
    RequestDescriptor, ResponseEnvelope,
};
