//! Tracing bootstrap for the smoke binary.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,relay_smoke=debug,relay_http=debug";
const FILTER_KEYS: [&str; 3] = ["RUST_LOG", "RELAY_SMOKE_LOG", "RELAY_LOG"];

/// Install the global subscriber.
///
/// Filter precedence: `RUST_LOG`, then `RELAY_SMOKE_LOG`, then `RELAY_LOG`,
/// then the built-in default. Unparseable values fall through to the next.
pub fn init() {
    let env_filter = filter_from_lookup(|key| env::var(key).ok());
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_env_filter(env_filter)
        .try_init();
}

fn filter_from_lookup<F>(lookup: F) -> EnvFilter
where
    F: Fn(&str) -> Option<String>,
{
    FILTER_KEYS
        .iter()
        .filter_map(|key| lookup(key).filter(|value| !value.trim().is_empty()))
        .find_map(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_variable_beats_general_one() {
        let filter = filter_from_lookup(|key| match key {
            "RELAY_SMOKE_LOG" => Some("warn".to_owned()),
            "RELAY_LOG" => Some("trace".to_owned()),
            _ => None,
        });
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    fn blank_and_invalid_values_fall_through() {
        let filter = filter_from_lookup(|key| match key {
            "RUST_LOG" => Some("   ".to_owned()),
            "RELAY_SMOKE_LOG" => Some("relay_http=notalevel".to_owned()),
            "RELAY_LOG" => Some("error".to_owned()),
            _ => None,
        });
        assert_eq!(filter.to_string(), "error");
    }

    #[test]
    fn defaults_without_any_variable() {
        let filter = filter_from_lookup(|_| None);
        assert!(filter.to_string().contains("relay_http=debug"));
    }
}
