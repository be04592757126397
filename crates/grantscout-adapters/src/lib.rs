//! Source adapter contract, the three government opportunity APIs and the
//! Exa-backed news channels.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use grantscout_core::{Opportunity, Source};
use grantscout_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

mod exa;
mod grants_gov;
mod sam_gov;
mod simpler_grants;

pub use exa::{ExaChannel, ExaSearchAdapter};
pub use grants_gov::GrantsGovAdapter;
pub use sam_gov::SamGovAdapter;
pub use simpler_grants::SimplerGrantsAdapter;

pub const CRATE_NAME: &str = "grantscout-adapters";

pub const SIMPLER_GRANTS_BASE_URL: &str = "https://api.simpler.grants.gov";
pub const GRANTS_GOV_BASE_URL: &str = "https://api.grants.gov";
pub const SAM_GOV_BASE_URL: &str = "https://api.sam.gov";
pub const EXA_BASE_URL: &str = "https://api.exa.ai";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{source_name} requires the {var} credential")]
    MissingCredential {
        source_name: &'static str,
        var: &'static str,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

/// One record as returned by a source, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub title: Option<String>,
    pub reference_number: Option<String>,
    pub description: Option<String>,
    pub agency: Option<String>,
    pub posted_date: Option<String>,
    pub open_date: Option<String>,
    pub close_date: Option<String>,
    pub link: Option<String>,
    pub source: String,
}

impl RawRecord {
    /// Maps into the common item shape. A record without a title keeps an
    /// empty one; persistence decides whether it is storable.
    pub fn into_opportunity(self) -> Opportunity {
        let mut opp = Opportunity::new(self.title.unwrap_or_default(), self.source);
        opp.description = self.description.unwrap_or_default();
        opp.agency = self.agency;
        opp.published_date = self.posted_date.as_deref().map(normalize_date);
        opp.open_date = self.open_date.as_deref().map(normalize_date);
        opp.close_date = self.close_date.as_deref().map(normalize_date);
        opp.url = self.link;
        opp
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    /// Item cap used when the run does not set one.
    fn default_limit(&self) -> usize;

    /// Items posted within the trailing `days_back` window, at most `limit`.
    async fn search(
        &self,
        keywords: Option<&str>,
        days_back: u32,
        limit: usize,
    ) -> Result<Vec<RawRecord>, AdapterError>;
}

/// Credentials and endpoints for the built-in adapters.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub simpler_grants_api_key: Option<String>,
    pub sam_gov_api_key: Option<String>,
    pub exa_api_key: Option<String>,
    pub simpler_grants_base_url: String,
    pub grants_gov_base_url: String,
    pub sam_gov_base_url: String,
    pub exa_base_url: String,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            simpler_grants_api_key: None,
            sam_gov_api_key: None,
            exa_api_key: None,
            simpler_grants_base_url: SIMPLER_GRANTS_BASE_URL.to_string(),
            grants_gov_base_url: GRANTS_GOV_BASE_URL.to_string(),
            sam_gov_base_url: SAM_GOV_BASE_URL.to_string(),
            exa_base_url: EXA_BASE_URL.to_string(),
        }
    }
}

pub fn adapter_for_source(
    source: Source,
    http: &HttpFetcher,
    settings: &AdapterSettings,
) -> Option<Arc<dyn SourceAdapter>> {
    match source {
        Source::SimplerGrants => Some(Arc::new(SimplerGrantsAdapter::new(
            http.clone(),
            settings.simpler_grants_api_key.clone(),
            settings.simpler_grants_base_url.clone(),
        ))),
        Source::GrantsGov => Some(Arc::new(GrantsGovAdapter::new(
            http.clone(),
            settings.grants_gov_base_url.clone(),
        ))),
        Source::SamGov => Some(Arc::new(SamGovAdapter::new(
            http.clone(),
            settings.sam_gov_api_key.clone(),
            settings.sam_gov_base_url.clone(),
        ))),
        Source::News | Source::Twitter | Source::Linkedin | Source::Csis => {
            let channel = ExaChannel::for_source(source)?;
            Some(Arc::new(ExaSearchAdapter::new(
                http.clone(),
                channel,
                settings.exa_api_key.clone(),
                settings.exa_base_url.clone(),
            )))
        }
        Source::All | Source::AllNews => None,
    }
}

/// Adapters for every concrete source of both profiles, in catalogue order.
pub fn default_adapters(http: &HttpFetcher, settings: &AdapterSettings) -> Vec<Arc<dyn SourceAdapter>> {
    Source::CONCRETE
        .iter()
        .filter_map(|s| adapter_for_source(*s, http, settings))
        .collect()
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn json_str(value: &JsonValue, path: &[&str]) -> Option<String> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    match cur {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Best-effort ISO `YYYY-MM-DD`; unrecognised values pass through trimmed.
pub fn normalize_date(raw: &str) -> String {
    let raw = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return d.format("%Y-%m-%d").to_string();
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%m/%d/%Y") {
        return d.format("%Y-%m-%d").to_string();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.date_naive().format("%Y-%m-%d").to_string();
    }
    if let Some(prefix) = raw.get(..10) {
        if let Ok(d) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
            return d.format("%Y-%m-%d").to_string();
        }
    }
    raw.to_string()
}
