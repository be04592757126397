use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use grantscout_core::{news, Source};
use grantscout_storage::HttpFetcher;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::{json_str, truncate_chars, AdapterError, RawRecord, SourceAdapter};

/// Upper bound the search API accepts for `numResults`.
const MAX_RESULTS: usize = 100;

/// One slice of the Exa index the news profile searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExaChannel {
    News,
    Twitter,
    Linkedin,
    Csis,
}

impl ExaChannel {
    pub fn for_source(source: Source) -> Option<Self> {
        match source {
            Source::News => Some(ExaChannel::News),
            Source::Twitter => Some(ExaChannel::Twitter),
            Source::Linkedin => Some(ExaChannel::Linkedin),
            Source::Csis => Some(ExaChannel::Csis),
            _ => None,
        }
    }

    pub fn source(&self) -> Source {
        match self {
            ExaChannel::News => Source::News,
            ExaChannel::Twitter => Source::Twitter,
            ExaChannel::Linkedin => Source::Linkedin,
            ExaChannel::Csis => Source::Csis,
        }
    }

    fn category(&self) -> Option<&'static str> {
        match self {
            ExaChannel::News | ExaChannel::Csis => Some("news"),
            ExaChannel::Twitter => Some("tweet"),
            ExaChannel::Linkedin => None,
        }
    }

    fn include_domains(&self) -> &'static [&'static str] {
        match self {
            ExaChannel::Csis => &["csis.org"],
            ExaChannel::Linkedin => &["linkedin.com"],
            ExaChannel::News | ExaChannel::Twitter => &[],
        }
    }

    fn default_results(&self) -> usize {
        match self {
            ExaChannel::News => 15,
            ExaChannel::Twitter | ExaChannel::Linkedin | ExaChannel::Csis => 20,
        }
    }

    /// Longer posts and research pieces keep more text.
    fn text_chars(&self) -> usize {
        match self {
            ExaChannel::News => 1000,
            ExaChannel::Twitter => 2000,
            ExaChannel::Linkedin => 3000,
            ExaChannel::Csis => 5000,
        }
    }
}

/// Exa neural search over news, social posts and think-tank publications.
#[derive(Debug, Clone)]
pub struct ExaSearchAdapter {
    http: HttpFetcher,
    channel: ExaChannel,
    api_key: Option<String>,
    base_url: String,
}

impl ExaSearchAdapter {
    pub fn new(
        http: HttpFetcher,
        channel: ExaChannel,
        api_key: Option<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            channel,
            api_key,
            base_url: base_url.into(),
        }
    }
}

pub(crate) fn search_payload(
    channel: ExaChannel,
    query: &str,
    published_after: DateTime<Utc>,
    limit: usize,
) -> JsonValue {
    let mut payload = json!({
        "query": query,
        "numResults": limit.clamp(1, MAX_RESULTS),
        "startPublishedDate": published_after.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "contents": { "text": { "maxCharacters": channel.text_chars() } }
    });
    if let Some(category) = channel.category() {
        payload["category"] = JsonValue::String(category.to_string());
    }
    if !channel.include_domains().is_empty() {
        payload["includeDomains"] = json!(channel.include_domains());
    }
    payload
}

pub(crate) fn parse_results(body: &JsonValue, channel: ExaChannel) -> Result<Vec<RawRecord>, AdapterError> {
    let items = match body.get("results") {
        Some(JsonValue::Array(items)) => items,
        Some(JsonValue::Null) | None => return Ok(Vec::new()),
        Some(other) => {
            return Err(AdapterError::Decode(format!("exa `results` is not a list: {other}")))
        }
    };

    let source = channel.source();
    Ok(items
        .iter()
        .map(|item| RawRecord {
            title: json_str(item, &["title"]),
            reference_number: json_str(item, &["id"]),
            description: json_str(item, &["text"]).map(|t| truncate_chars(&t, channel.text_chars())),
            agency: json_str(item, &["author"]).or_else(|| {
                (channel == ExaChannel::Csis).then(|| source.display_name().to_string())
            }),
            posted_date: json_str(item, &["publishedDate"]),
            open_date: None,
            close_date: None,
            link: json_str(item, &["url"]),
            source: source.display_name().to_string(),
        })
        .collect())
}

#[async_trait]
impl SourceAdapter for ExaSearchAdapter {
    fn source(&self) -> Source {
        self.channel.source()
    }

    fn default_limit(&self) -> usize {
        self.channel.default_results()
    }

    async fn search(
        &self,
        keywords: Option<&str>,
        days_back: u32,
        limit: usize,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let api_key = self.api_key.as_deref().ok_or(AdapterError::MissingCredential {
            source_name: "Exa",
            var: "EXA_API_KEY",
        })?;
        let query = keywords
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .unwrap_or(news::DEFAULT_QUERY);
        let published_after = Utc::now() - Duration::days(i64::from(days_back));

        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let request = self
            .http
            .client()
            .post(url)
            .header("x-api-key", api_key)
            .json(&search_payload(self.channel, query, published_after, limit));
        let label = format!("exa.{}", self.channel.source());
        let body = self.http.send_json(&label, request).await?;
        let mut records = parse_results(&body, self.channel)?;
        debug!(count = records.len(), channel = ?self.channel, "exa results parsed");
        records.truncate(limit);
        Ok(records)
    }
}
