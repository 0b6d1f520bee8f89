mod logging;

use std::env;

use relay_core::ResponseEnvelope;
use relay_http::{ClientConfig, RelayStack, RequestOptions};
use relay_platform::InMemorySecretStore;
use tracing::info;

const DEFAULT_SMOKE_PATH: &str = "/health";

#[tokio::main]
async fn main() {
    logging::init();

    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            eprintln!("Required: RELAY_BASE_URL");
            std::process::exit(1);
        }
    };
    let smoke_path = env::var("RELAY_SMOKE_PATH")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SMOKE_PATH.to_owned());

    let stack = match RelayStack::from_config(config, InMemorySecretStore::default()) {
        Ok(stack) => stack,
        Err(err) => {
            eprintln!("Failed to initialize request layer: {err}");
            std::process::exit(1);
        }
    };

    let credential = env::var("RELAY_SMOKE_CREDENTIAL")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .or_else(|| stack.credential());
    info!(path = %smoke_path, authenticated = credential.is_some(), "running smoke request");

    let result: Result<ResponseEnvelope<serde_json::Value>, _> = match credential.as_deref() {
        Some(credential) => {
            stack
                .authed
                .get(&smoke_path, credential, RequestOptions::new())
                .await
        }
        None => stack.public.get(&smoke_path, RequestOptions::new()).await,
    };

    match result {
        Ok(envelope) => {
            let rendered = serde_json::to_string_pretty(&envelope)
                .unwrap_or_else(|_| format!("{:?}", envelope.data));
            println!("{rendered}");
        }
        Err(err) => {
            eprintln!("Request failed ({}): {}", err.kind, err.user_message());
            if err.kind.is_retryable_by_user() {
                eprintln!("The failure looks transient; try again.");
            }
            std::process::exit(1);
        }
    }
}
