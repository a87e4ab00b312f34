//! HTTP collaborator for fetching directory pages.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use crate::error::{BotError, Result};

/// Fetch collaborator the gateway talks to. A 404 from the site must be
/// reported as `PageNotFound` so callers can distinguish a deleted handle
/// from a transient failure.
#[async_trait]
pub trait HtmlFetcher: Send + Sync {
    async fn fetch_html(&self, url: &str) -> Result<String>;
}

/// reqwest-backed fetcher used in production.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("verifybot/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HtmlFetcher for HttpFetcher {
    async fn fetch_html(&self, url: &str) -> Result<String> {
        debug!("Fetching {}", url);
        let response = self.client.get(url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(BotError::PageNotFound {
                url: url.to_string(),
            });
        }

        let response = response.error_for_status()?;
        Ok(response.text().await?)
    }
}
