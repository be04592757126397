use async_trait::async_trait;
use chrono::{Duration, Local, NaiveDate};
use grantscout_core::Source;
use grantscout_storage::HttpFetcher;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{json_str, AdapterError, RawRecord, SourceAdapter};

/// SAM.gov contract opportunities (GET, `MM/DD/YYYY` posted window).
#[derive(Debug, Clone)]
pub struct SamGovAdapter {
    http: HttpFetcher,
    api_key: Option<String>,
    base_url: String,
}

impl SamGovAdapter {
    pub fn new(http: HttpFetcher, api_key: Option<String>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            api_key,
            base_url: base_url.into(),
        }
    }
}

pub(crate) fn posted_window(today: NaiveDate, days_back: u32) -> (String, String) {
    let from = today - Duration::days(i64::from(days_back));
    (
        from.format("%m/%d/%Y").to_string(),
        today.format("%m/%d/%Y").to_string(),
    )
}

pub(crate) fn parse_opportunities(body: &JsonValue) -> Result<Vec<RawRecord>, AdapterError> {
    let items = match body.get("opportunitiesData") {
        Some(JsonValue::Array(items)) => items,
        Some(JsonValue::Null) | None => return Ok(Vec::new()),
        Some(other) => {
            return Err(AdapterError::Decode(format!(
                "sam.gov `opportunitiesData` is not a list: {other}"
            )))
        }
    };

    Ok(items
        .iter()
        .map(|item| RawRecord {
            title: json_str(item, &["title"]),
            reference_number: json_str(item, &["solicitationNumber"]),
            description: json_str(item, &["description"]),
            agency: json_str(item, &["fullParentPathName"]).or_else(|| json_str(item, &["department"])),
            posted_date: json_str(item, &["postedDate"]),
            open_date: None,
            close_date: json_str(item, &["responseDeadLine"]),
            link: json_str(item, &["uiLink"]),
            source: Source::SamGov.display_name().to_string(),
        })
        .collect())
}

#[async_trait]
impl SourceAdapter for SamGovAdapter {
    fn source(&self) -> Source {
        Source::SamGov
    }

    fn default_limit(&self) -> usize {
        300
    }

    async fn search(
        &self,
        keywords: Option<&str>,
        days_back: u32,
        limit: usize,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let api_key = self.api_key.as_deref().ok_or(AdapterError::MissingCredential {
            source_name: "SAM.gov",
            var: "SAM_GOV_API_KEY",
        })?;
        let (posted_from, posted_to) = posted_window(Local::now().date_naive(), days_back);

        let mut params = vec![
            ("postedFrom", posted_from),
            ("postedTo", posted_to),
            ("limit", limit.to_string()),
            ("offset", "0".to_string()),
            ("active", "true".to_string()),
        ];
        if let Some(k) = keywords.filter(|k| !k.trim().is_empty()) {
            params.push(("keywords", k.to_string()));
        }

        let url = format!("{}/opportunities/v2/search", self.base_url.trim_end_matches('/'));
        // The key travels as a header so it never appears in a request URL.
        let request = self
            .http
            .client()
            .get(url)
            .header("X-Api-Key", api_key)
            .query(&params);
        let body = self.http.send_json("sam_gov.search", request).await?;
        let mut records = parse_opportunities(&body)?;
        debug!(count = records.len(), "sam.gov response parsed");
        records.truncate(limit);
        Ok(records)
    }
}
