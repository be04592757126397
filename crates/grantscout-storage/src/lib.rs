//! Persistence and outbound HTTP plumbing shared by the workflow crates.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

pub mod documents;
pub mod keywords;
pub mod opportunities;

pub use documents::{
    DocumentContent, DocumentError, DocumentKind, DocumentSearchHit, DocumentStatistics,
    DocumentStore, DocumentSummary,
};
pub use keywords::{KeywordDomain, KeywordOverview, KeywordStore, KeywordStoreError};
pub use opportunities::{
    OpportunityPage, OpportunityQuery, OpportunityStatistics, OpportunityStore, SaveOutcome,
    ScoreStatistics, StoreError, StoredOpportunity,
};

pub const CRATE_NAME: &str = "grantscout-storage";

/// Longest response body excerpt kept in an HTTP status error.
const ERROR_BODY_EXCERPT: usize = 500;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            global_concurrency: 8,
        }
    }
}

/// Thin reqwest wrapper with a global in-flight limit and JSON decoding.
///
/// Requests are sent exactly once; callers decide what a failure means.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
}

// Request URLs can carry credentials in the query string, so neither the
// transport error nor the status error keeps them.
impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Request(err.without_url())
    }
}

fn redacted_url(url: &reqwest::Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.set_fragment(None);
    let _ = url.set_password(None);
    url.to_string()
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Sends `request` and decodes a JSON body, labelling the span with `label`.
    pub async fn send_json(
        &self,
        label: &str,
        request: RequestBuilder,
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_request", label);
        async move {
            // The semaphore is never closed, so acquire only fails on shutdown.
            let _permit = self.global_limit.acquire().await.ok();

            let resp = request.send().await?;
            let status = resp.status();
            let final_url = redacted_url(resp.url());
            debug!(%status, url = %final_url, "response received");

            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(status_error(status, final_url, body));
            }

            Ok(resp.json::<JsonValue>().await?)
        }
        .instrument(span)
        .await
    }
}

fn status_error(status: StatusCode, url: String, mut body: String) -> FetchError {
    if body.len() > ERROR_BODY_EXCERPT {
        let mut cut = ERROR_BODY_EXCERPT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...");
    }
    FetchError::HttpStatus {
        status: status.as_u16(),
        url,
        body,
    }
}
