use async_trait::async_trait;
use chrono::{Duration, Local, NaiveDate};
use grantscout_core::Source;
use grantscout_storage::HttpFetcher;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::{json_str, truncate_chars, AdapterError, RawRecord, SourceAdapter};

const PAGE_SIZE: usize = 50;
const DESCRIPTION_CHARS: usize = 200;
const DETAIL_BASE: &str = "https://simpler.grants.gov/opportunity";

/// Simpler.Grants.gov search API (POST, paged, newest first).
#[derive(Debug, Clone)]
pub struct SimplerGrantsAdapter {
    http: HttpFetcher,
    api_key: Option<String>,
    base_url: String,
}

impl SimplerGrantsAdapter {
    pub fn new(http: HttpFetcher, api_key: Option<String>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            api_key,
            base_url: base_url.into(),
        }
    }

    fn search_url(&self) -> String {
        format!("{}/v1/opportunities/search", self.base_url.trim_end_matches('/'))
    }
}

fn search_payload(keywords: Option<&str>, page_offset: usize) -> JsonValue {
    let mut payload = json!({
        "filters": {
            "opportunity_status": { "one_of": ["posted", "forecasted"] }
        },
        "pagination": {
            "page_offset": page_offset,
            "page_size": PAGE_SIZE,
            "sort_order": [{ "order_by": "post_date", "sort_direction": "descending" }]
        }
    });
    if let Some(query) = keywords.filter(|k| !k.trim().is_empty()) {
        payload["query"] = JsonValue::String(query.to_string());
    }
    payload
}

/// Records of one page up to the first one posted before `cutoff`.
/// The flag reports whether the cutoff was reached.
pub(crate) fn parse_page(body: &JsonValue, cutoff: NaiveDate) -> Result<(Vec<RawRecord>, bool), AdapterError> {
    let items = match body.get("data") {
        Some(JsonValue::Array(items)) => items,
        Some(JsonValue::Null) | None => return Ok((Vec::new(), false)),
        Some(other) => {
            return Err(AdapterError::Decode(format!(
                "simpler grants `data` is not a list: {other}"
            )))
        }
    };

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let posted = json_str(item, &["summary", "post_date"]);
        let too_old = posted
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .is_some_and(|d| d < cutoff);
        if too_old {
            return Ok((out, true));
        }

        let id = json_str(item, &["opportunity_id"]).or_else(|| json_str(item, &["id"]));
        out.push(RawRecord {
            title: json_str(item, &["opportunity_title"]).or_else(|| json_str(item, &["title"])),
            reference_number: json_str(item, &["opportunity_number"])
                .or_else(|| json_str(item, &["opportunityNumber"])),
            description: json_str(item, &["summary", "summary_description"])
                .map(|d| truncate_chars(&d, DESCRIPTION_CHARS)),
            agency: json_str(item, &["agency_name"]).or_else(|| json_str(item, &["agency", "name"])),
            posted_date: posted,
            open_date: None,
            close_date: json_str(item, &["summary", "close_date"]),
            link: id.map(|id| format!("{DETAIL_BASE}/{id}")),
            source: Source::SimplerGrants.display_name().to_string(),
        });
    }
    Ok((out, false))
}

#[async_trait]
impl SourceAdapter for SimplerGrantsAdapter {
    fn source(&self) -> Source {
        Source::SimplerGrants
    }

    fn default_limit(&self) -> usize {
        50
    }

    async fn search(
        &self,
        keywords: Option<&str>,
        days_back: u32,
        limit: usize,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let api_key = self.api_key.as_deref().ok_or(AdapterError::MissingCredential {
            source_name: "Simpler.Grants.gov",
            var: "SIMPLER_GRANTS_GOV_API_KEY",
        })?;
        let cutoff = (Local::now() - Duration::days(i64::from(days_back))).date_naive();

        let mut records = Vec::new();
        let mut page_offset = 1;
        while records.len() < limit {
            let request = self
                .http
                .client()
                .post(self.search_url())
                .header("X-API-Key", api_key)
                .json(&search_payload(keywords, page_offset));
            let body = self.http.send_json("simpler_grants.search", request).await?;
            let (page, reached_cutoff) = parse_page(&body, cutoff)?;
            let page_len = page.len();
            debug!(page_offset, page_len, reached_cutoff, "simpler grants page");

            records.extend(page);
            if reached_cutoff || page_len < PAGE_SIZE {
                break;
            }
            page_offset += 1;
        }
        records.truncate(limit);
        Ok(records)
    }
}
