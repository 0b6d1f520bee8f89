//! Cookie jar shared with the HTTP client so session cookies can be expired
//! during teardown.

use std::sync::{Arc, RwLock};

use reqwest::{Url, cookie::CookieStore, header::HeaderValue};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredCookie {
    name: String,
    value: String,
    host: String,
    path: String,
}

impl StoredCookie {
    fn matches(&self, url: &Url) -> bool {
        url.host_str() == Some(self.host.as_str()) && path_matches(url.path(), &self.path)
    }
}

/// Cookie store backing the reqwest client.
#[derive(Debug, Clone, Default)]
pub struct SessionCookieJar {
    cookies: Arc<RwLock<Vec<StoredCookie>>>,
}

impl SessionCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a `Set-Cookie` header value as if `url` had returned it.
    pub fn add_cookie_str(&self, set_cookie: &str, url: &Url) {
        let Ok(mut cookies) = self.cookies.write() else {
            return;
        };
        apply_set_cookie(&mut cookies, set_cookie, url);
    }

    pub fn len(&self) -> usize {
        self.cookies.read().map(|cookies| cookies.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.cookies
            .read()
            .map(|cookies| cookies.iter().any(|cookie| cookie.name == name))
            .unwrap_or(false)
    }

    /// Expire cookies under any of `path_prefixes`.
    ///
    /// When `names` is empty every cookie under those paths is expired;
    /// otherwise only cookies with one of the given names. Returns how many
    /// cookies were removed.
    pub fn expire(&self, names: &[String], path_prefixes: &[String]) -> usize {
        let Ok(mut cookies) = self.cookies.write() else {
            return 0;
        };
        let before = cookies.len();
        cookies.retain(|cookie| {
            let name_selected = names.is_empty() || names.iter().any(|name| *name == cookie.name);
            let path_selected = path_prefixes
                .iter()
                .any(|prefix| path_matches(&cookie.path, prefix));
            !(name_selected && path_selected)
        });
        let removed = before - cookies.len();
        debug!(removed, "expired session cookies");
        removed
    }
}

impl CookieStore for SessionCookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let Ok(mut cookies) = self.cookies.write() else {
            return;
        };
        for header in cookie_headers {
            if let Ok(raw) = header.to_str() {
                apply_set_cookie(&mut cookies, raw, url);
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let cookies = self.cookies.read().ok()?;
        let rendered = cookies
            .iter()
            .filter(|cookie| cookie.matches(url))
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect::<Vec<_>>()
            .join("; ");
        if rendered.is_empty() {
            return None;
        }
        HeaderValue::from_str(&rendered).ok()
    }
}

fn apply_set_cookie(cookies: &mut Vec<StoredCookie>, set_cookie: &str, url: &Url) {
    let mut segments = set_cookie.split(';');
    let Some((name, value)) = segments
        .next()
        .and_then(|pair| pair.split_once('='))
        .map(|(name, value)| (name.trim(), value.trim()))
    else {
        return;
    };
    if name.is_empty() {
        return;
    }
    let Some(host) = url.host_str() else {
        return;
    };

    let mut path = default_path(url.path());
    let mut expired = false;
    for attribute in segments {
        let (key, attr_value) = attribute
            .split_once('=')
            .map(|(key, value)| (key.trim(), value.trim()))
            .unwrap_or((attribute.trim(), ""));
        if key.eq_ignore_ascii_case("path") && attr_value.starts_with('/') {
            path = attr_value.to_owned();
        } else if key.eq_ignore_ascii_case("max-age") {
            expired = attr_value.parse::<i64>().is_ok_and(|seconds| seconds <= 0);
        }
    }

    cookies.retain(|cookie| !(cookie.name == name && cookie.host == host && cookie.path == path));
    if !expired {
        cookies.push(StoredCookie {
            name: name.to_owned(),
            value: value.to_owned(),
            host: host.to_owned(),
            path,
        });
    }
}

fn default_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(index) => request_path[..index].to_owned(),
    }
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if cookie_path == "/" || request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}
