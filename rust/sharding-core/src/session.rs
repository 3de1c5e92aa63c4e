//! Session metadata fetch.
//!
//! When the shard count is `auto`, the manager asks the upstream service how
//! many shards it recommends via `GET {api_base}/v{version}/gateway/bot`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{ShardingConfig, UpstreamConfig};
use crate::error::{Result, ShardingError};

/// Session-start budget reported with the recommendation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    /// Milliseconds until `remaining` resets.
    pub reset_after: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

fn default_max_concurrency() -> u32 {
    1
}

/// Upstream response to a session metadata request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionObject {
    pub url: String,
    /// Recommended shard count.
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

/// Source of session metadata.
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn fetch_session(&self) -> Result<SessionObject>;
}

/// Strip a leading `Bot` marker (case-insensitive) from a credential.
pub fn normalize_token(token: &str) -> &str {
    let token = token.trim();
    match token.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bot") => {
            let rest = &token[3..];
            if rest.starts_with(char::is_whitespace) {
                rest.trim_start()
            } else {
                token
            }
        }
        _ => token,
    }
}

/// `reqwest` implementation against the real endpoint.
pub struct HttpSessionSource {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpSessionSource {
    pub fn new(upstream: &UpstreamConfig, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(upstream.request_timeout_ms))
            .build()
            .map_err(|e| ShardingError::upstream_with_source("failed to build HTTP client", e))?;

        let url = format!(
            "{}/v{}/gateway/bot",
            upstream.api_base.trim_end_matches('/'),
            upstream.api_version
        );

        Ok(Self { client, url, token })
    }

    pub fn from_config(config: &ShardingConfig) -> Result<Self> {
        Self::new(&config.upstream, config.token.clone())
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SessionSource for HttpSessionSource {
    async fn fetch_session(&self) -> Result<SessionObject> {
        let token = self
            .token
            .as_deref()
            .map(normalize_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ShardingError::config("a token is required to resolve the shard count automatically")
            })?;

        tracing::debug!(url = %self.url, "Fetching session metadata");

        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::AUTHORIZATION, format!("Bot {}", token))
            .send()
            .await
            .map_err(|e| ShardingError::upstream_with_source("session request failed", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ShardingError::upstream_status(status.as_u16(), body));
        }

        response
            .json::<SessionObject>()
            .await
            .map_err(|e| ShardingError::upstream_with_source("malformed session object", e))
    }
}
