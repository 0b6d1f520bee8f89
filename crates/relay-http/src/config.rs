//! Environment-backed configuration for the request layer.

use std::{env, path::PathBuf, time::Duration};

use relay_core::RetryPolicy;
use thiserror::Error;
use url::Url;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_UPLOAD_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_HEADER_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 250;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 2_000;
const DEFAULT_SIGN_IN_PATH: &str = "/login";
const DEFAULT_DATA_DIR: &str = "./.relay-store";
const IDENTITY_FILENAME: &str = "identity.json";
const DEFAULT_OAUTH_SERVICE: &str = "relay";

/// Runtime configuration for the clients and the session teardown.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Backend base URL every request path is joined onto.
    pub base_url: Url,
    /// Per-attempt deadline for normal calls.
    pub timeout: Duration,
    /// Per-attempt deadline for multipart uploads.
    pub upload_timeout: Duration,
    /// Deadline for receiving response headers.
    pub header_timeout: Duration,
    /// Retry budget shared by every verb.
    pub retry: RetryPolicy,
    /// Where the embedding application sends users after teardown.
    pub sign_in_path: String,
    /// Server-side sign-out endpoint, if the deployment has one.
    pub sign_out_url: Option<Url>,
    /// Every cookie path prefix the application uses.
    pub cookie_paths: Vec<String>,
    /// Names of authentication cookies; empty expires every cookie.
    pub auth_cookie_names: Vec<String>,
    /// Send an `Idempotency-Key` header on mutating verbs.
    pub idempotency_keys: bool,
    /// Directory holding the persisted identity record.
    pub data_dir: PathBuf,
    /// Service name under which the OAuth session is stored.
    pub oauth_service: String,
    /// Trusted endpoint that accepts cache tag invalidations.
    pub revalidate_url: Option<Url>,
    /// Shared secret sent to the revalidation endpoint.
    pub revalidate_secret: Option<String>,
}

impl ClientConfig {
    /// Defaults for the given backend.
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            upload_timeout: Duration::from_millis(DEFAULT_UPLOAD_TIMEOUT_MS),
            header_timeout: Duration::from_millis(DEFAULT_HEADER_TIMEOUT_MS),
            retry: RetryPolicy::default(),
            sign_in_path: DEFAULT_SIGN_IN_PATH.to_owned(),
            sign_out_url: None,
            cookie_paths: vec!["/".to_owned()],
            auth_cookie_names: Vec::new(),
            idempotency_keys: true,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            oauth_service: DEFAULT_OAUTH_SERVICE.to_owned(),
            revalidate_url: None,
            revalidate_secret: None,
        }
    }

    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let base_url = optional_trimmed_env("RELAY_BASE_URL", &mut lookup)
            .ok_or(ConfigError::Missing {
                key: "RELAY_BASE_URL",
            })
            .and_then(|value| parse_base_url("RELAY_BASE_URL", value))?;

        let mut config = Self::new(base_url);

        config.timeout = parse_duration_ms("RELAY_TIMEOUT_MS", DEFAULT_TIMEOUT_MS, &mut lookup)?;
        config.upload_timeout = parse_duration_ms(
            "RELAY_UPLOAD_TIMEOUT_MS",
            DEFAULT_UPLOAD_TIMEOUT_MS,
            &mut lookup,
        )?;
        config.header_timeout = parse_duration_ms(
            "RELAY_HEADER_TIMEOUT_MS",
            DEFAULT_HEADER_TIMEOUT_MS,
            &mut lookup,
        )?;

        let max_retries = parse_u64_with_default(
            "RELAY_MAX_RETRIES",
            u64::from(relay_core::DEFAULT_MAX_RETRIES),
            &mut lookup,
        )?;
        let max_retries = u32::try_from(max_retries).map_err(|err| ConfigError::InvalidValue {
            key: "RELAY_MAX_RETRIES",
            value: max_retries.to_string(),
            reason: err.to_string(),
        })?;
        let base_delay_ms = parse_u64_with_default(
            "RELAY_RETRY_BASE_DELAY_MS",
            DEFAULT_RETRY_BASE_DELAY_MS,
            &mut lookup,
        )?;
        let max_delay_ms = parse_u64_with_default(
            "RELAY_RETRY_MAX_DELAY_MS",
            DEFAULT_RETRY_MAX_DELAY_MS,
            &mut lookup,
        )?;
        config.retry = RetryPolicy::new(max_retries, base_delay_ms, max_delay_ms);

        if let Some(path) = optional_trimmed_env("RELAY_SIGN_IN_PATH", &mut lookup) {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidValue {
                    key: "RELAY_SIGN_IN_PATH",
                    value: path,
                    reason: "must start with '/'".to_owned(),
                });
            }
            config.sign_in_path = path;
        }

        config.sign_out_url = optional_trimmed_env("RELAY_SIGN_OUT_URL", &mut lookup)
            .map(|value| parse_url("RELAY_SIGN_OUT_URL", value))
            .transpose()?;
        config.revalidate_url = optional_trimmed_env("RELAY_REVALIDATE_URL", &mut lookup)
            .map(|value| parse_url("RELAY_REVALIDATE_URL", value))
            .transpose()?;
        config.revalidate_secret = optional_trimmed_env("RELAY_REVALIDATE_SECRET", &mut lookup);

        if let Some(paths) = optional_trimmed_env("RELAY_COOKIE_PATHS", &mut lookup) {
            let paths = split_list(&paths);
            if let Some(bad) = paths.iter().find(|path| !path.starts_with('/')) {
                return Err(ConfigError::InvalidValue {
                    key: "RELAY_COOKIE_PATHS",
                    value: bad.clone(),
                    reason: "every path must start with '/'".to_owned(),
                });
            }
            config.cookie_paths = paths;
        }
        if let Some(names) = optional_trimmed_env("RELAY_AUTH_COOKIES", &mut lookup) {
            config.auth_cookie_names = split_list(&names);
        }

        config.idempotency_keys =
            parse_bool_with_default("RELAY_IDEMPOTENCY_KEYS", true, &mut lookup)?;

        if let Some(data_dir) = optional_trimmed_env("RELAY_DATA_DIR", &mut lookup) {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Some(service) = optional_trimmed_env("RELAY_OAUTH_SERVICE", &mut lookup) {
            config.oauth_service = service;
        }

        Ok(config)
    }

    /// Location of the persisted identity record.
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join(IDENTITY_FILENAME)
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required {key}")]
    Missing { key: &'static str },
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_url(key: &'static str, value: String) -> Result<Url, ConfigError> {
    Url::parse(&value).map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

// Request paths are joined onto the base, so it must end in '/'.
fn parse_base_url(key: &'static str, value: String) -> Result<Url, ConfigError> {
    if value.ends_with('/') {
        parse_url(key, value)
    } else {
        parse_url(key, format!("{value}/"))
    }
}

fn parse_u64_with_default<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_duration_ms<F>(
    key: &'static str,
    default_ms: u64,
    lookup: &mut F,
) -> Result<Duration, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let millis = parse_u64_with_default(key, default_ms, lookup)?;
    if millis == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(Duration::from_millis(millis))
}

fn parse_bool_with_default<F>(
    key: &'static str,
    default: bool,
    lookup: &mut F,
) -> Result<bool, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected a boolean".to_owned(),
        }),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<ClientConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        ClientConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn parses_base_url_and_defaults() {
        let cfg = config_from_pairs(&[("RELAY_BASE_URL", "https://api.example.org/v1")])
            .expect("config should parse");

        assert_eq!(cfg.base_url.as_str(), "https://api.example.org/v1/");
        assert_eq!(cfg.timeout, Duration::from_secs(30));
        assert_eq!(cfg.upload_timeout, Duration::from_secs(300));
        assert_eq!(cfg.retry.max_retries(), 2);
        assert_eq!(cfg.sign_in_path, "/login");
        assert_eq!(cfg.cookie_paths, vec!["/".to_owned()]);
        assert!(cfg.idempotency_keys);
        assert!(cfg.sign_out_url.is_none());
    }

    #[test]
    fn base_url_is_required() {
        let err = config_from_pairs(&[]).expect_err("missing base url must fail");
        assert_eq!(
            err,
            ConfigError::Missing {
                key: "RELAY_BASE_URL"
            }
        );
    }

    #[test]
    fn parses_overrides() {
        let cfg = config_from_pairs(&[
            ("RELAY_BASE_URL", "https://api.example.org"),
            ("RELAY_TIMEOUT_MS", "5000"),
            ("RELAY_UPLOAD_TIMEOUT_MS", "600000"),
            ("RELAY_MAX_RETRIES", "4"),
            ("RELAY_SIGN_IN_PATH", "/auth/sign-in"),
            ("RELAY_SIGN_OUT_URL", "https://app.example.org/api/auth/signout"),
            ("RELAY_COOKIE_PATHS", "/, /dashboard ,/admin"),
            ("RELAY_AUTH_COOKIES", "session,refresh"),
            ("RELAY_IDEMPOTENCY_KEYS", "off"),
            ("RELAY_DATA_DIR", "/tmp/relay"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.timeout, Duration::from_secs(5));
        assert_eq!(cfg.upload_timeout, Duration::from_secs(600));
        assert_eq!(cfg.retry.max_attempts(), 5);
        assert_eq!(cfg.sign_in_path, "/auth/sign-in");
        assert_eq!(
            cfg.sign_out_url.as_ref().map(Url::as_str),
            Some("https://app.example.org/api/auth/signout")
        );
        assert_eq!(cfg.cookie_paths, vec!["/", "/dashboard", "/admin"]);
        assert_eq!(cfg.auth_cookie_names, vec!["session", "refresh"]);
        assert!(!cfg.idempotency_keys);
        assert_eq!(cfg.identity_path(), PathBuf::from("/tmp/relay/identity.json"));
    }

    #[test]
    fn rejects_invalid_values() {
        let err = config_from_pairs(&[
            ("RELAY_BASE_URL", "https://api.example.org"),
            ("RELAY_TIMEOUT_MS", "abc"),
        ])
        .expect_err("invalid timeout must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "RELAY_TIMEOUT_MS",
                ..
            }
        ));

        let err = config_from_pairs(&[
            ("RELAY_BASE_URL", "https://api.example.org"),
            ("RELAY_UPLOAD_TIMEOUT_MS", "0"),
        ])
        .expect_err("zero timeout must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "RELAY_UPLOAD_TIMEOUT_MS",
                ..
            }
        ));

        let err = config_from_pairs(&[
            ("RELAY_BASE_URL", "https://api.example.org"),
            ("RELAY_COOKIE_PATHS", "/,dashboard"),
        ])
        .expect_err("relative cookie path must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "RELAY_COOKIE_PATHS",
                ..
            }
        ));
    }
}
