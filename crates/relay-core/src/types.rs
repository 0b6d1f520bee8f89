use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::tags::TagSet;

/// HTTP verbs supported by the request layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Whether the verb changes server state.
    pub fn is_mutating(self) -> bool {
        !matches!(self, Self::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache behavior requested for a call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Always go to the network; the result may still be tagged and stored.
    #[default]
    NoCache,
    /// Always go to the network and never store the result.
    NoStore,
    /// Serve a fresh cached result when one exists.
    ForceCache,
    /// Serve a cached result while it is younger than `revalidate_after`.
    Default,
}

impl CacheMode {
    /// `Cache-Control` request header value for this mode, if any.
    pub fn header_value(self) -> Option<&'static str> {
        match self {
            Self::NoCache => Some("no-cache"),
            Self::NoStore => Some("no-store"),
            Self::ForceCache | Self::Default => None,
        }
    }
}

/// Cache directives supplied by a caller alongside a read.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheDirectives {
    pub mode: CacheMode,
    /// Maximum age of a cached result before it must be refetched.
    pub revalidate_after: Option<Duration>,
    /// Tags the cached result is stored under.
    pub tags: TagSet,
}

impl CacheDirectives {
    pub fn new(mode: CacheMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn revalidate_after(mut self, max_age: Duration) -> Self {
        self.revalidate_after = Some(max_age);
        self
    }

    pub fn tags(mut self, tags: impl Into<TagSet>) -> Self {
        self.tags = tags.into();
        self
    }

    /// Whether a cached result may be served instead of calling the backend.
    pub fn allows_cached_read(&self) -> bool {
        match self.mode {
            CacheMode::ForceCache => true,
            CacheMode::Default => self.revalidate_after.is_some(),
            CacheMode::NoCache | CacheMode::NoStore => false,
        }
    }

    /// Whether a fetched result should be stored in the response cache.
    pub fn allows_store(&self) -> bool {
        match self.mode {
            CacheMode::NoStore => false,
            CacheMode::NoCache => !self.tags.is_empty(),
            CacheMode::ForceCache | CacheMode::Default => true,
        }
    }
}

/// A single multipart field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormValue {
    Text(String),
    File {
        bytes: Arc<[u8]>,
        file_name: String,
        mime: Option<String>,
    },
}

/// Named multipart field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPart {
    pub name: String,
    pub value: FormValue,
}

/// Multipart payload that can be rebuilt for every attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FormData {
    parts: Vec<FormPart>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(FormPart {
            name: name.into(),
            value: FormValue::Text(value.into()),
        });
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
        mime: Option<&str>,
    ) -> Self {
        self.parts.push(FormPart {
            name: name.into(),
            value: FormValue::File {
                bytes: bytes.into(),
                file_name: file_name.into(),
                mime: mime.map(str::to_owned),
            },
        });
        self
    }

    pub fn parts(&self) -> &[FormPart] {
        &self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Sum of file payload sizes, used for upload logging.
    pub fn payload_bytes(&self) -> usize {
        self.parts
            .iter()
            .map(|part| match &part.value {
                FormValue::Text(text) => text.len(),
                FormValue::File { bytes, .. } => bytes.len(),
            })
            .sum()
    }
}

/// Request payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(serde_json::Value),
    Form(FormData),
}

/// Everything the transport needs to issue one logical call.
///
/// Built fresh by the client for every invocation and never mutated after.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub path: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    pub cache: CacheDirectives,
    /// Per-attempt deadline.
    pub timeout: Duration,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            method,
            headers: Vec::new(),
            body: None,
            cache: CacheDirectives::default(),
            timeout,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn cache(mut self, cache: CacheDirectives) -> Self {
        self.cache = cache;
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Successful JSON body returned by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseEnvelope<T> {
    pub success: bool,
    pub data: T,
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::CacheTag;

    #[test]
    fn only_get_is_non_mutating() {
        assert!(!Method::Get.is_mutating());
        assert!(Method::Post.is_mutating());
        assert!(Method::Delete.is_mutating());
    }

    #[test]
    fn cache_modes_gate_reads_and_stores() {
        let no_cache = CacheDirectives::default();
        assert!(!no_cache.allows_cached_read());
        assert!(!no_cache.allows_store());

        let tagged = CacheDirectives::default().tags(CacheTag::list("properties"));
        assert!(!tagged.allows_cached_read());
        assert!(tagged.allows_store());

        let default_without_age = CacheDirectives::new(CacheMode::Default);
        assert!(!default_without_age.allows_cached_read());

        let default_with_age =
            CacheDirectives::new(CacheMode::Default).revalidate_after(Duration::from_secs(60));
        assert!(default_with_age.allows_cached_read());

        let no_store = CacheDirectives::new(CacheMode::NoStore).tags(CacheTag::list("loans"));
        assert!(!no_store.allows_store());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let descriptor = RequestDescriptor::new(Method::Get, "/users/me", Duration::from_secs(30))
            .header("Authorization", "Bearer abc");
        assert_eq!(descriptor.header_value("authorization"), Some("Bearer abc"));
        assert_eq!(descriptor.header_value("x-missing"), None);
    }

    #[test]
    fn form_reports_payload_size() {
        let form = FormData::new()
            .text("title", "Flat")
            .file("image", "a.png", vec![0_u8; 10], Some("image/png"));
        assert_eq!(form.parts().len(), 2);
        assert_eq!(form.payload_bytes(), 14);
    }

    #[test]
    fn envelope_message_defaults_to_empty() {
        let envelope: ResponseEnvelope<Option<u32>> =
            serde_json::from_str(r#"{"success":true,"data":7}"#).expect("envelope should parse");
        assert_eq!(envelope.data, Some(7));
        assert!(envelope.message.is_empty());
    }
}
