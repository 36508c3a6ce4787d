use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::constants::{DEEP_RESEARCH_RESULTS, QUICK_SEARCH_RESULTS};
use crate::privacy::NetworkGuard;

/// Source of external context for prompt augmentation
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// `Ok(None)` means nothing useful was found
    async fn search(&self, query: &str) -> Result<Option<String>>;

    fn name(&self) -> &'static str;
}

/// How much material a search should gather
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchDepth {
    Quick,
    Deep,
}

impl SearchDepth {
    pub fn default_results(&self) -> usize {
        match self {
            Self::Quick => QUICK_SEARCH_RESULTS,
            Self::Deep => DEEP_RESEARCH_RESULTS,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default, alias = "content", alias = "description")]
    snippet: String,
}

/// Provider backed by a JSON search endpoint (`GET endpoint?q=..&limit=..`)
pub struct WebSearch {
    client: Client,
    endpoint: Url,
    depth: SearchDepth,
    max_results: usize,
    host_check: Option<Arc<NetworkGuard>>,
}

impl WebSearch {
    pub fn new(endpoint: &str, depth: SearchDepth, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("Invalid search endpoint: {}", endpoint))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build search HTTP client")?;
        Ok(Self {
            client,
            endpoint,
            depth,
            max_results: depth.default_results(),
            host_check: None,
        })
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    /// Check the endpoint host against `guard` before every request
    pub fn with_host_check(mut self, guard: Arc<NetworkGuard>) -> Self {
        self.host_check = Some(guard);
        self
    }
}

#[async_trait]
impl SearchProvider for WebSearch {
    async fn search(&self, query: &str) -> Result<Option<String>> {
        if let Some(guard) = &self.host_check {
            let host = self.endpoint.host_str().unwrap_or_default();
            if !guard.validate_host(host) {
                bail!("Search host '{}' is not on the allowed hosts list", host);
            }
        }

        debug!(endpoint = %self.endpoint, depth = ?self.depth, "searching");

        let limit = self.max_results.to_string();
        let response = self
            .client
            .get(self.endpoint.clone())
            .query(&[("q", query), ("limit", limit.as_str())])
            .send()
            .await
            .with_context(|| format!("Search request to {} failed", self.endpoint))?
            .error_for_status()
            .context("Search endpoint returned an error")?;

        let body: SearchResponse = response
            .json()
            .await
            .context("Search endpoint returned invalid JSON")?;

        Ok(format_results(&body.results, self.max_results))
    }

    fn name(&self) -> &'static str {
        match self.depth {
            SearchDepth::Quick => "web-quick",
            SearchDepth::Deep => "web-deep",
        }
    }
}

/// Bullet list of the first `limit` hits, or `None` if nothing usable came back
fn format_results(hits: &[SearchHit], limit: usize) -> Option<String> {
    let lines: Vec<String> = hits
        .iter()
        .filter(|hit| !hit.title.trim().is_empty() || !hit.snippet.trim().is_empty())
        .take(limit)
        .map(|hit| {
            let mut line = format!("- {}", hit.title.trim());
            if !hit.snippet.trim().is_empty() {
                line.push_str(": ");
                line.push_str(hit.snippet.trim());
            }
            if !hit.url.is_empty() {
                line.push_str(&format!(" ({})", hit.url));
            }
            line
        })
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Provider used when no search endpoint is configured
pub struct DisabledSearch;

#[async_trait]
impl SearchProvider for DisabledSearch {
    async fn search(&self, _query: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}
