//! JSON API over the discovery workflow, keyword store, opportunity store,
//! generated reports and the news-profile catalogue.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Local};
use grantscout_storage::{DocumentStore, KeywordStore, OpportunityStore};
use grantscout_workflow::{Services, WorkflowConfig, WorkflowService};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

mod config;
mod error;
mod keywords;
mod opportunities;
mod reports;
mod workflows;

pub use error::ApiError;

pub const CRATE_NAME: &str = "grantscout-web";

#[derive(Clone)]
pub struct AppState {
    pub workflows: WorkflowService,
    pub keywords: KeywordStore,
    pub opportunities: OpportunityStore,
    pub documents: DocumentStore,
    pub config: WorkflowConfig,
}

impl AppState {
    pub fn new(services: Services) -> Self {
        Self {
            workflows: services.workflows,
            keywords: services.keywords,
            opportunities: services.opportunities,
            documents: services.documents,
            config: services.config,
        }
    }
}

pub type SharedState = Arc<AppState>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/workflows", post(workflows::start_handler).get(workflows::list_handler))
        .route("/workflows/quick-start", post(workflows::quick_start_handler))
        .route("/workflows/sources", get(workflows::sources_handler))
        .route("/workflows/preset/{name}", post(workflows::preset_handler))
        .route("/workflows/{id}", get(workflows::status_handler))
        .route("/workflows/{id}/cancel", post(workflows::cancel_handler))
        .route("/opportunities", get(opportunities::list_handler))
        .route("/opportunities/top", get(opportunities::top_handler))
        .route("/opportunities/statistics", get(opportunities::statistics_handler))
        .route("/opportunities/sectors", get(opportunities::sectors_handler))
        .route("/opportunities/sources", get(opportunities::sources_handler))
        .route(
            "/opportunities/{id}",
            get(opportunities::get_handler).delete(opportunities::delete_handler),
        )
        .route("/keywords", get(keywords::overview_handler))
        .route("/keywords/search", get(keywords::search_handler))
        .route("/keywords/domains", get(keywords::domains_handler))
        .route("/keywords/domain", post(keywords::add_domain_handler))
        .route(
            "/keywords/domain/{name}",
            get(keywords::get_domain_handler)
                .put(keywords::update_domain_handler)
                .delete(keywords::delete_domain_handler),
        )
        .route("/keywords/domain/{name}/keywords", delete(keywords::delete_keywords_handler))
        .route(
            "/keywords/negative",
            get(keywords::get_negative_handler).put(keywords::set_negative_handler),
        )
        .route("/reports", get(reports::list_handler))
        .route("/reports/latest", get(reports::latest_handler))
        .route("/reports/search", get(reports::search_handler))
        .route("/reports/statistics", get(reports::statistics_handler))
        .route(
            "/reports/{filename}",
            get(reports::read_handler).delete(reports::delete_handler),
        )
        .route("/config", get(config::config_handler))
        .route("/config/minerals", get(config::minerals_handler))
        .route("/config/presets", get(config::presets_handler))
        .route("/config/domains", get(config::domains_handler))
        .route("/config/regions", get(config::regions_handler))
        .route("/config/sectors", get(config::sectors_handler))
        .route("/config/exa", get(config::exa_handler))
        .route("/config/query/generate", post(config::generate_query_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(services: Services) -> anyhow::Result<()> {
    let addr = services.config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "grantscout api listening");
    axum::serve(listener, app(AppState::new(services)))
        .await
        .context("serving http")?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(Services::from_env().await?).await
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Local>,
    version: &'static str,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
struct HealthChecks {
    database: bool,
    keywords_file: bool,
    outputs_directory: bool,
}

async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    let database = state.opportunities.count().await.is_ok();
    let keywords_file = tokio::fs::try_exists(state.keywords.path()).await.unwrap_or(false);
    let outputs_directory = tokio::fs::metadata(state.documents.root())
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    Json(HealthResponse {
        status: "healthy",
        timestamp: Local::now(),
        version: env!("CARGO_PKG_VERSION"),
        checks: HealthChecks {
            database,
            keywords_file,
            outputs_directory,
        },
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use grantscout_storage::{HttpClientConfig, HttpFetcher};
    use grantscout_workflow::{
        ChatClient, HtmlConverter, ModelEnrichmentStage, ModelFilterStage, ModelReportStage,
        ModelScoringStage, ModelSettings, Pipeline, PipelineSettings, Stages,
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    /// State rooted in `dir` with no source adapters and no model key, so
    /// started runs fail fast without touching the network.
    pub(crate) async fn state(dir: &Path) -> AppState {
        let config = WorkflowConfig {
            database_path: dir.join("db.sqlite"),
            keywords_path: dir.join("keywords.json"),
            outputs_dir: dir.join("outputs"),
            ..WorkflowConfig::default()
        };
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let chat = Arc::new(ChatClient::new(http, ModelSettings::default()));
        let keywords = KeywordStore::new(config.keywords_path.clone());
        let opportunities = OpportunityStore::open(&config.database_path).await.unwrap();
        let documents = DocumentStore::new(config.outputs_dir.clone());
        documents.ensure_dir().await.unwrap();
        let pipeline = Pipeline::new(
            Vec::new(),
            Stages {
                enrichment: Arc::new(ModelEnrichmentStage::new(chat.clone())),
                filter: Arc::new(ModelFilterStage::new(chat.clone())),
                scoring: Arc::new(ModelScoringStage::new(chat.clone())),
                report: Arc::new(ModelReportStage::new(chat)),
            },
            keywords.clone(),
            PipelineSettings {
                outputs_dir: config.outputs_dir.clone(),
                batch_size: config.batch_size,
                stage_timeout: Duration::from_secs(2),
                max_days_back: config.max_days_back,
            },
        )
        .with_store(opportunities.clone())
        .with_converter(Arc::new(HtmlConverter));
        AppState {
            workflows: WorkflowService::new(pipeline, 2),
            keywords,
            opportunities,
            documents,
            config,
        }
    }

    pub(crate) async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }
}
