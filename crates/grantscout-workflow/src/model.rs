//! Stage implementations backed by an OpenAI-compatible chat completion API.

use std::sync::Arc;

use async_trait::async_trait;
use grantscout_core::{news, KeywordSet, Opportunity, RunProfile, ScoredOpportunity};
use grantscout_storage::HttpFetcher;
use serde::de::DeserializeOwned;
use serde_json::{json, Value as JsonValue};
use tokio::fs;
use tracing::debug;

use crate::stages::{
    EnrichmentStage, FilterStage, ReportRequest, ReportStage, ScoringStage, StageError,
};

pub const DEFAULT_MODEL_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

const ENRICH_PROMPT: &str = "You merge government funding opportunities. \
Combine records that describe the same opportunity, keep the most complete fields, \
and never invent URLs. Reply with JSON: {\"opportunities\": [...]} using the input field names.";

const FILTER_PROMPT: &str = "You screen funding opportunities against keyword domains. \
Keep an opportunity only if it matches at least one positive keyword and none of the negative keywords. \
Set `category` to the best matching domain name. \
Reply with JSON: {\"opportunities\": [...]} containing only the kept items, fields unchanged otherwise.";

const SCORE_PROMPT: &str = "You score funding opportunities from 0 to 10 on feasibility, impact and alignment. \
total_score = 0.35*feasibility_score + 0.35*impact_score + 0.30*alignment_score. \
Reply with JSON: {\"opportunities\": [...]} where each item keeps its input fields and adds \
feasibility_score, impact_score, alignment_score, total_score and a one-paragraph justification.";

const REPORT_PROMPT: &str = "You write concise markdown briefing reports on scored funding opportunities. \
Start with an executive summary, then a ranked table, then one section per opportunity with its link, \
deadline, scores and justification. Reply with the markdown document only.";

const NEWS_REPORT_PROMPT: &str = "You write markdown intelligence briefs on critical minerals news. \
Use these sections in order: {sections}. Cite every item with its link and publication date, \
group social media posts under Social Media Insights and reply with the markdown document only.";

fn report_prompt(profile: RunProfile) -> String {
    match profile {
        RunProfile::Grants => REPORT_PROMPT.to_string(),
        RunProfile::News => NEWS_REPORT_PROMPT.replace("{sections}", &news::REPORT_SECTIONS.join(", ")),
    }
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_MODEL_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatClient {
    http: HttpFetcher,
    settings: ModelSettings,
}

impl ChatClient {
    pub fn new(http: HttpFetcher, settings: ModelSettings) -> Self {
        Self { http, settings }
    }

    async fn complete(&self, label: &str, system: &str, user: String, json_mode: bool) -> Result<String, StageError> {
        let api_key = self
            .settings
            .api_key
            .as_deref()
            .ok_or_else(|| StageError::Unavailable("OPENAI_API_KEY is not set".to_string()))?;

        let mut body = json!({
            "model": self.settings.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ]
        });
        if json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let url = format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'));
        let request = self.http.client().post(url).bearer_auth(api_key).json(&body);
        let response = self.http.send_json(label, request).await?;

        let content = response
            .pointer("/choices/0/message/content")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| StageError::MalformedOutput("response has no message content".to_string()))?;
        debug!(label, chars = content.len(), "model reply received");
        Ok(content.to_string())
    }

    /// Sends one request and decodes the `opportunities` list from the reply.
    pub async fn opportunities<T: DeserializeOwned>(
        &self,
        label: &str,
        system: &str,
        user: String,
    ) -> Result<Vec<T>, StageError> {
        let content = self.complete(label, system, user, true).await?;
        parse_opportunity_list(&content)
    }

    pub async fn text(&self, label: &str, system: &str, user: String) -> Result<String, StageError> {
        self.complete(label, system, user, false).await
    }
}

/// Accepts `{"opportunities": [...]}` only, optionally wrapped in a code fence.
pub fn parse_opportunity_list<T: DeserializeOwned>(content: &str) -> Result<Vec<T>, StageError> {
    let value: JsonValue = serde_json::from_str(strip_code_fence(content))
        .map_err(|e| StageError::MalformedOutput(format!("reply is not JSON: {e}")))?;
    let list = value
        .get("opportunities")
        .filter(|v| v.is_array())
        .cloned()
        .ok_or_else(|| StageError::MalformedOutput("reply lacks an `opportunities` list".to_string()))?;
    serde_json::from_value(list).map_err(|e| StageError::MalformedOutput(format!("bad opportunity entry: {e}")))
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn items_json<T: serde::Serialize>(items: &T) -> Result<String, StageError> {
    serde_json::to_string_pretty(items).map_err(|e| StageError::MalformedOutput(format!("serializing input: {e}")))
}

pub struct ModelEnrichmentStage {
    client: Arc<ChatClient>,
}

impl ModelEnrichmentStage {
    pub fn new(client: Arc<ChatClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EnrichmentStage for ModelEnrichmentStage {
    async fn merge(&self, items: &[Opportunity]) -> Result<Vec<Opportunity>, StageError> {
        let user = format!(
            "Here is the list of opportunities:\n{}\n\nMerge duplicates and enrich.",
            items_json(&items)?
        );
        self.client.opportunities("model.enrich", ENRICH_PROMPT, user).await
    }
}

pub struct ModelFilterStage {
    client: Arc<ChatClient>,
}

impl ModelFilterStage {
    pub fn new(client: Arc<ChatClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FilterStage for ModelFilterStage {
    async fn filter(&self, batch: &[Opportunity], keywords: &KeywordSet) -> Result<Vec<Opportunity>, StageError> {
        let user = format!(
            "Keyword domains:\n{}\n\nNegative keywords:\n{}\n\nFilter these opportunities:\n{}",
            items_json(&keywords.domains)?,
            items_json(&keywords.negative)?,
            items_json(&batch)?
        );
        self.client.opportunities("model.filter", FILTER_PROMPT, user).await
    }
}

pub struct ModelScoringStage {
    client: Arc<ChatClient>,
}

impl ModelScoringStage {
    pub fn new(client: Arc<ChatClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ScoringStage for ModelScoringStage {
    async fn score(&self, items: &[Opportunity]) -> Result<Vec<ScoredOpportunity>, StageError> {
        let user = format!("Score these opportunities:\n{}", items_json(&items)?);
        self.client.opportunities("model.score", SCORE_PROMPT, user).await
    }
}

/// Reads the staged scored items and writes the model's markdown to the destination.
pub struct ModelReportStage {
    client: Arc<ChatClient>,
}

impl ModelReportStage {
    pub fn new(client: Arc<ChatClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReportStage for ModelReportStage {
    async fn render(&self, request: &ReportRequest) -> Result<(), StageError> {
        let data = fs::read_to_string(&request.staging_path)
            .await
            .map_err(|e| StageError::io(&request.staging_path, e))?;
        let user = format!(
            "Write the report for these {} scored items:\n{}",
            request.item_count, data
        );
        let markdown = self
            .client
            .text("model.report", &report_prompt(request.profile), user)
            .await?;
        let markdown = strip_code_fence(&markdown);
        if markdown.is_empty() {
            return Err(StageError::MalformedOutput("empty report".to_string()));
        }
        fs::write(&request.destination, markdown)
            .await
            .map_err(|e| StageError::io(&request.destination, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grantscout_storage::HttpClientConfig;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: String, api_key: Option<&str>) -> Arc<ChatClient> {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        Arc::new(ChatClient::new(
            http,
            ModelSettings {
                api_key: api_key.map(str::to_string),
                base_url,
                model: "test-model".into(),
            },
        ))
    }

    fn reply(content: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        }))
    }

    #[test]
    fn opportunity_list_requires_expected_shape() {
        let ok: Vec<Opportunity> =
            parse_opportunity_list(r#"{"opportunities":[{"title":"A","source":"Grants.gov"}]}"#).unwrap();
        assert_eq!(ok[0].category, grantscout_core::UNCLASSIFIED);

        let fenced: Vec<Opportunity> =
            parse_opportunity_list("```json\n{\"opportunities\": []}\n```").unwrap();
        assert!(fenced.is_empty());

        for bad in ["not json", r#"{"items": []}"#, r#"{"opportunities": {}}"#, r#"[1,2]"#] {
            let err = parse_opportunity_list::<Opportunity>(bad).unwrap_err();
            assert!(matches!(err, StageError::MalformedOutput(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn missing_key_makes_stage_unavailable() {
        let stage = ModelScoringStage::new(client("http://127.0.0.1:9".into(), None));
        let err = stage.score(&[Opportunity::new("A", "x")]).await.unwrap_err();
        assert!(matches!(err, StageError::Unavailable(_)));
    }

    #[tokio::test]
    async fn filter_stage_decodes_kept_items() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer k"))
            .respond_with(reply(
                r#"{"opportunities":[{"title":"Battery recycling","source":"SAM.gov","category":"Critical Minerals"}]}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let stage = ModelFilterStage::new(client(server.uri(), Some("k")));
        let batch = vec![Opportunity::new("Battery recycling", "SAM.gov"), Opportunity::new("Parks", "SAM.gov")];
        let kept = stage.filter(&batch, &KeywordSet::default()).await.unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].category, "Critical Minerals");
    }

    #[tokio::test]
    async fn report_stage_writes_markdown_to_destination() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(reply("```markdown\n# Report\n\nBody\n```"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join(".data.json");
        std::fs::write(&staging, "[]").unwrap();
        let request = ReportRequest {
            staging_path: staging,
            destination: dir.path().join("Report.md"),
            item_count: 0,
            profile: RunProfile::Grants,
        };
        ModelReportStage::new(client(server.uri(), Some("k")))
            .render(&request)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&request.destination).unwrap(), "# Report\n\nBody");
    }

    #[test]
    fn news_reports_use_the_brief_sections() {
        let prompt = report_prompt(RunProfile::News);
        assert!(prompt.contains("Executive Summary, Latest News, Social Media Insights"));
        assert!(!prompt.contains("{sections}"));
        assert_eq!(report_prompt(RunProfile::Grants), REPORT_PROMPT);
    }

    #[tokio::test]
    async fn model_http_error_is_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .expect(1)
            .mount(&server)
            .await;

        let stage = ModelEnrichmentStage::new(client(server.uri(), Some("k")));
        let err = stage.merge(&[Opportunity::new("A", "x")]).await.unwrap_err();
        assert!(matches!(err, StageError::Transport(_)));
    }
}
