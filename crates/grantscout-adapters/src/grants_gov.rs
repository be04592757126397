use async_trait::async_trait;
use grantscout_core::Source;
use grantscout_storage::HttpFetcher;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::{json_str, AdapterError, RawRecord, SourceAdapter};

const DETAIL_BASE: &str = "https://www.grants.gov/search-results-detail";

/// Grants.gov `search2` endpoint. No credential required.
#[derive(Debug, Clone)]
pub struct GrantsGovAdapter {
    http: HttpFetcher,
    base_url: String,
}

impl GrantsGovAdapter {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

fn search_payload(keywords: Option<&str>, days_back: u32, limit: usize) -> JsonValue {
    json!({
        "keyword": keywords.filter(|k| !k.trim().is_empty()),
        "cfda": null,
        "agencies": null,
        "sortBy": "openDate|desc",
        "rows": limit,
        "eligibilities": null,
        "fundingCategories": null,
        "fundingInstruments": null,
        "dateRange": days_back.to_string(),
        "oppStatuses": "posted"
    })
}

/// `oppHits` may sit at the root or under `data`.
pub(crate) fn parse_hits(body: &JsonValue) -> Result<Vec<RawRecord>, AdapterError> {
    let hits = body
        .get("oppHits")
        .filter(|h| !h.is_null())
        .or_else(|| body.get("data").and_then(|d| d.get("oppHits")));
    let hits = match hits {
        Some(JsonValue::Array(hits)) => hits,
        Some(JsonValue::Null) | None => return Ok(Vec::new()),
        Some(other) => {
            return Err(AdapterError::Decode(format!(
                "grants.gov `oppHits` is not a list: {other}"
            )))
        }
    };

    Ok(hits
        .iter()
        .map(|item| {
            let open_date = json_str(item, &["openDate"]);
            RawRecord {
                title: json_str(item, &["title"]),
                reference_number: json_str(item, &["number"]),
                description: json_str(item, &["description"]),
                agency: json_str(item, &["agency"]).or_else(|| json_str(item, &["agencyName"])),
                posted_date: open_date.clone(),
                open_date,
                close_date: json_str(item, &["closeDate"]),
                link: json_str(item, &["id"]).map(|id| format!("{DETAIL_BASE}/{id}")),
                source: Source::GrantsGov.display_name().to_string(),
            }
        })
        .collect())
}

#[async_trait]
impl SourceAdapter for GrantsGovAdapter {
    fn source(&self) -> Source {
        Source::GrantsGov
    }

    fn default_limit(&self) -> usize {
        100
    }

    async fn search(
        &self,
        keywords: Option<&str>,
        days_back: u32,
        limit: usize,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let url = format!("{}/v1/api/search2", self.base_url.trim_end_matches('/'));
        let request = self
            .http
            .client()
            .post(url)
            .json(&search_payload(keywords, days_back, limit));
        let body = self.http.send_json("grants_gov.search2", request).await?;
        let mut records = parse_hits(&body)?;
        debug!(hits = records.len(), "grants.gov response parsed");
        records.truncate(limit);
        Ok(records)
    }
}
