//! HTTP client against one Newznab backend.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client as HttpClient;

use crate::newznab::SearchParams;
use crate::newznab::wire::{RssFeed, WireError};

/// User agent presented to upstream indexers.
pub const USER_AGENT: &str = concat!("newznab-client/", env!("CARGO_PKG_VERSION"));

/// Default connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("decode error: {0}")]
    Decode(#[from] WireError),
}

/// The upstream capability set: search, RSS poll, raw NZB download.
/// The aggregator and the poller fleet depend on this seam so they can be
/// exercised against fakes.
#[async_trait]
pub trait NewznabBackend: Send + Sync {
    async fn search(&self, params: &SearchParams) -> Result<RssFeed, ClientError>;

    async fn poll_rss(
        &self,
        path: &str,
        query_params: &[(String, String)],
    ) -> Result<RssFeed, ClientError>;

    async fn get_nzb(&self, url: &str) -> Result<Bytes, ClientError>;
}

/// Concrete client for one configured backend.
#[derive(Debug, Clone)]
pub struct Client {
    http: HttpClient,
    base_url: String,
    api_key: String,
}

impl Client {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let http = HttpClient::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to build HTTP client with custom config; using defaults");
                HttpClient::new()
            });
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    async fn fetch_feed(&self, request: reqwest::RequestBuilder) -> Result<RssFeed, ClientError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        Ok(RssFeed::parse(&body)?)
    }
}

#[async_trait]
impl NewznabBackend for Client {
    async fn search(&self, params: &SearchParams) -> Result<RssFeed, ClientError> {
        let mut pairs = vec![
            ("t", "search".to_string()),
            ("apikey", self.api_key.clone()),
        ];
        pairs.extend(params.query_pairs());

        let request = self
            .http
            .get(format!("{}/api", self.base_url))
            .query(&pairs);
        self.fetch_feed(request).await
    }

    async fn poll_rss(
        &self,
        path: &str,
        query_params: &[(String, String)],
    ) -> Result<RssFeed, ClientError> {
        let request = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(query_params);
        self.fetch_feed(request).await
    }

    async fn get_nzb(&self, url: &str) -> Result<Bytes, ClientError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status(status.as_u16()));
        }
        Ok(response.bytes().await?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
