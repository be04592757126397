use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use grantscout_core::{news, RunConfig, RunProfile, RunStatus, Source, WorkflowRun};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{check_range, ApiError};
use crate::SharedState;

/// Body of `POST /workflows`. Omitted fields take the configured defaults;
/// unrecognised fields are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct WorkflowRequest {
    pub profile: Option<RunProfile>,
    pub sources: Option<Vec<Source>>,
    /// Free-text search; wins over `preset` and `minerals`.
    pub query: Option<String>,
    pub preset: Option<String>,
    pub minerals: Option<Vec<String>>,
    pub days_back: Option<u32>,
    pub domains: Option<Vec<String>>,
    pub generate_report: Option<bool>,
    pub save_to_db: Option<bool>,
    pub convert_report: Option<bool>,
    pub batch_size: Option<usize>,
    pub per_source_limit: Option<usize>,
}

fn resolve_query(
    query: Option<String>,
    preset: Option<&str>,
    minerals: Option<&[String]>,
) -> Result<Option<String>, ApiError> {
    if let Some(query) = query.filter(|q| !q.trim().is_empty()) {
        return Ok(Some(query.trim().to_string()));
    }
    if let Some(name) = preset {
        let preset = news::preset(name).ok_or_else(|| {
            let known: Vec<&str> = news::QUERY_PRESETS.iter().map(|p| p.name).collect();
            ApiError::Validation(format!("Unknown preset '{name}'. Available: {}", known.join(", ")))
        })?;
        return Ok(Some(preset.query.to_string()));
    }
    Ok(minerals
        .filter(|m| m.iter().any(|name| !name.trim().is_empty()))
        .map(news::minerals_query))
}

impl WorkflowRequest {
    fn into_run_config(self, default_days_back: u32) -> Result<RunConfig, ApiError> {
        let defaults = RunConfig::default();
        let profile = self.profile.unwrap_or_default();
        let query = resolve_query(self.query, self.preset.as_deref(), self.minerals.as_deref())?;
        Ok(RunConfig {
            sources: self
                .sources
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| profile.default_sources()),
            days_back: self.days_back.unwrap_or(default_days_back),
            domains: self.domains.filter(|d| !d.is_empty()),
            generate_report: self.generate_report.unwrap_or(defaults.generate_report),
            save_to_db: self.save_to_db.unwrap_or(defaults.save_to_db),
            convert_report: self.convert_report.unwrap_or(defaults.convert_report),
            batch_size: self.batch_size,
            per_source_limit: self.per_source_limit,
            profile,
            query,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct WorkflowAccepted {
    workflow_id: String,
    status: RunStatus,
    message: String,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SourceInfo {
    id: &'static str,
    name: &'static str,
    profile: RunProfile,
    group: bool,
}

impl SourceInfo {
    fn of(source: Source) -> Self {
        Self {
            id: source.as_str(),
            name: source.display_name(),
            profile: source.profile(),
            group: source.is_group(),
        }
    }
}

fn start(state: &SharedState, config: RunConfig) -> Result<(StatusCode, Json<WorkflowAccepted>), ApiError> {
    let run = state.workflows.start(config)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(WorkflowAccepted {
            message: format!("Workflow started. Poll /workflows/{} for status.", run.id),
            workflow_id: run.id,
            status: run.status,
            started_at: run.started_at,
        }),
    ))
}

pub async fn start_handler(
    State(state): State<SharedState>,
    body: Result<Json<WorkflowRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<WorkflowAccepted>), ApiError> {
    let Json(request) = body?;
    let config = request.into_run_config(state.config.default_days_back)?;
    start(&state, config)
}

pub async fn quick_start_handler(
    State(state): State<SharedState>,
) -> Result<(StatusCode, Json<WorkflowAccepted>), ApiError> {
    let config = WorkflowRequest::default().into_run_config(state.config.default_days_back)?;
    start(&state, config)
}

/// News run over every news source using a named query preset.
pub async fn preset_handler(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<WorkflowAccepted>), ApiError> {
    let request = WorkflowRequest {
        profile: Some(RunProfile::News),
        preset: Some(name),
        ..WorkflowRequest::default()
    };
    let config = request.into_run_config(state.config.default_days_back)?;
    start(&state, config)
}

pub async fn list_handler(
    State(state): State<SharedState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<WorkflowRun>>, ApiError> {
    let Query(query) = query?;
    let limit = check_range("limit", query.limit.unwrap_or(50), 1, 100)?;
    Ok(Json(state.workflows.list(limit)))
}

/// Each profile's sources followed by its group selector.
pub async fn sources_handler() -> Json<Vec<SourceInfo>> {
    let sources = Source::GRANTS
        .into_iter()
        .chain([Source::All])
        .chain(Source::NEWS)
        .chain([Source::AllNews])
        .map(SourceInfo::of)
        .collect();
    Json(sources)
}

pub async fn status_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowRun>, ApiError> {
    state
        .workflows
        .get_status(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Workflow with ID '{id}' not found")))
}

pub async fn cancel_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let Some(run) = state.workflows.get_status(&id) else {
        return Err(ApiError::NotFound(format!("Workflow with ID '{id}' not found")));
    };
    if !state.workflows.cancel(&id) {
        return Err(ApiError::BadRequest(format!(
            "Workflow '{id}' could not be cancelled: status is {}",
            run.status
        )));
    }
    Ok(Json(json!({ "message": format!("Workflow '{id}' has been cancelled") })))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode;
    use serde_json::json;

    use super::*;
    use crate::app;
    use crate::test_support::{send, state};

    #[tokio::test]
    async fn start_returns_pending_and_run_becomes_pollable() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state(dir.path()).await);

        let (status, body) = send(
            &app,
            "POST",
            "/workflows",
            Some(json!({ "sources": ["grants_gov"], "days_back": 3, "generate_report": false })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "pending");
        let id = body["workflow_id"].as_str().unwrap().to_string();

        let mut run = serde_json::Value::Null;
        for _ in 0..200 {
            let (status, snapshot) = send(&app, "GET", &format!("/workflows/{id}"), None).await;
            assert_eq!(status, StatusCode::OK);
            run = snapshot;
            if run["status"] == "failed" || run["status"] == "completed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // no adapters are wired in tests, so every source fails
        assert_eq!(run["status"], "failed");
        assert_eq!(run["workflow_id"], id.as_str());
        assert_eq!(run["phases"][0]["phase"], "fetch");
        assert!(run["source_errors"]["grants_gov"].is_string());

        let (status, list) = send(&app, "GET", "/workflows?limit=5", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_with_detail() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state(dir.path()).await);

        let (status, body) = send(&app, "POST", "/workflows", Some(json!({ "days_back": 45 }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["detail"].as_str().unwrap().contains("days_back"));

        let (status, body) = send(&app, "POST", "/workflows", Some(json!({ "sources": ["usaspending"] }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["detail"].is_string());

        let (status, _) = send(&app, "GET", "/workflows?limit=0", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, list) = send(&app, "GET", "/workflows", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(list.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_and_finished_runs_cannot_be_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state(dir.path()).await);

        let (status, body) = send(&app, "GET", "/workflows/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["detail"].as_str().unwrap().contains("missing"));

        let (status, _) = send(&app, "POST", "/workflows/missing/cancel", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, started) = send(&app, "POST", "/workflows/quick-start", None).await;
        let id = started["workflow_id"].as_str().unwrap().to_string();
        for _ in 0..200 {
            let (_, run) = send(&app, "GET", &format!("/workflows/{id}"), None).await;
            if run["status"] == "failed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let (status, body) = send(&app, "POST", &format!("/workflows/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("failed"));
    }

    #[tokio::test]
    async fn sources_lists_catalogue() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state(dir.path()).await);
        let (status, body) = send(&app, "GET", "/workflows/sources", None).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<_> = body.as_array().unwrap().iter().map(|s| s["id"].as_str().unwrap()).collect();
        assert_eq!(
            ids,
            vec!["simpler_grants", "grants_gov", "sam_gov", "all", "news", "twitter", "linkedin", "csis", "all_news"]
        );
        assert_eq!(body[3]["group"], true);
        assert_eq!(body[4]["profile"], "news");
    }

    #[tokio::test]
    async fn unrecognised_request_fields_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state(dir.path()).await);

        let (status, body) = send(
            &app,
            "POST",
            "/workflows",
            Some(json!({ "sources": ["grants_gov"], "client_version": "2.1", "notify": {"email": "a@b.c"} })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED, "{body}");
        assert_eq!(body["status"], "pending");
    }

    #[tokio::test]
    async fn news_profile_requests_resolve_sources_and_presets() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state(dir.path()).await);

        let (status, body) = send(&app, "POST", "/workflows", Some(json!({ "profile": "news", "minerals": ["cobalt"] }))).await;
        assert_eq!(status, StatusCode::ACCEPTED, "{body}");
        let id = body["workflow_id"].as_str().unwrap().to_string();
        let mut run = serde_json::Value::Null;
        for _ in 0..200 {
            let (_, snapshot) = send(&app, "GET", &format!("/workflows/{id}"), None).await;
            run = snapshot;
            if run["status"] == "failed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let errors = run["source_errors"].as_object().unwrap();
        let mut failed: Vec<_> = errors.keys().map(String::as_str).collect();
        failed.sort();
        assert_eq!(failed, vec!["csis", "linkedin", "news", "twitter"]);

        let (status, _) = send(&app, "POST", "/workflows/preset/geopolitics", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, body) = send(&app, "POST", "/workflows/preset/astrology", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["detail"].as_str().unwrap().contains("geopolitics"));

        let (status, body) = send(
            &app,
            "POST",
            "/workflows",
            Some(json!({ "profile": "news", "sources": ["sam_gov"] })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["detail"].as_str().unwrap().contains("sam_gov"));
    }

    #[test]
    fn explicit_query_wins_over_preset_and_minerals() {
        let minerals = vec!["nickel".to_string()];
        assert_eq!(
            resolve_query(Some(" graphite anodes ".into()), Some("market"), Some(&minerals)).unwrap(),
            Some("graphite anodes".to_string())
        );
        assert_eq!(
            resolve_query(None, Some("market"), Some(&minerals)).unwrap().as_deref(),
            news::preset("market").map(|p| p.query)
        );
        assert_eq!(
            resolve_query(None, None, Some(&minerals)).unwrap().as_deref(),
            Some("Latest developments in critical minerals including nickel")
        );
        assert_eq!(resolve_query(None, None, Some(&[" ".to_string()])).unwrap(), None);
    }
}
