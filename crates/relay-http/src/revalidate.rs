//! Revalidation through a trusted remote endpoint.

use std::time::Duration;

use async_trait::async_trait;
use relay_core::{RevalidateError, Revalidator, TagSet};
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::{config::ClientConfig, transport::TransportBuildError};

pub const REVALIDATE_SECRET_HEADER: &str = "x-revalidate-secret";
const REVALIDATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct RevalidateRequest<'a> {
    tags: &'a [String],
}

/// POSTs invalidated tags to a revalidation endpoint, for example the
/// rendering tier that owns a shared cache.
#[derive(Debug, Clone)]
pub struct RemoteRevalidator {
    http: reqwest::Client,
    url: Url,
    secret: Option<String>,
}

impl RemoteRevalidator {
    pub fn new(url: Url, secret: Option<String>) -> Result<Self, TransportBuildError> {
        let http = reqwest::Client::builder()
            .timeout(REVALIDATE_TIMEOUT)
            .build()
            .map_err(|err| TransportBuildError::Http(err.to_string()))?;
        Ok(Self { http, url, secret })
    }

    /// Revalidator for the configured endpoint, if there is one.
    pub fn from_config(config: &ClientConfig) -> Result<Option<Self>, TransportBuildError> {
        config
            .revalidate_url
            .clone()
            .map(|url| Self::new(url, config.revalidate_secret.clone()))
            .transpose()
    }
}

#[async_trait]
impl Revalidator for RemoteRevalidator {
    fn name(&self) -> &str {
        "remote"
    }

    async fn revalidate(&self, tags: &TagSet) -> Result<(), RevalidateError> {
        let names = tags.names();
        let mut request = self
            .http
            .post(self.url.clone())
            .json(&RevalidateRequest { tags: &names });
        if let Some(secret) = &self.secret {
            request = request.header(REVALIDATE_SECRET_HEADER, secret);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_connect() {
                RevalidateError::Unavailable(err.to_string())
            } else {
                RevalidateError::Transport(err.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RevalidateError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        debug!(url = %self.url, tags = ?names, "remote revalidation accepted");
        Ok(())
    }
}
