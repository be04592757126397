use std::collections::BTreeMap;

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use grantscout_storage::{KeywordDomain, KeywordOverview};
use serde::Deserialize;

use crate::error::ApiError;
use crate::SharedState;

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    query: String,
    domain: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AppendParam {
    #[serde(default)]
    append: bool,
}

#[derive(Debug, Deserialize)]
pub struct NewDomain {
    domain: String,
    #[serde(default)]
    keywords: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct KeywordList {
    keywords: Vec<String>,
}

fn domain_not_found(name: &str) -> ApiError {
    ApiError::NotFound(format!("Domain '{name}' not found"))
}

pub async fn overview_handler(State(state): State<SharedState>) -> Result<Json<KeywordOverview>, ApiError> {
    Ok(Json(state.keywords.overview().await?))
}

pub async fn search_handler(
    State(state): State<SharedState>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Json<BTreeMap<String, Vec<String>>>, ApiError> {
    let Query(params) = params?;
    if params.query.trim().chars().count() < 2 {
        return Err(ApiError::Validation("query must be at least 2 characters".to_string()));
    }
    let hits = state
        .keywords
        .search(params.query.trim(), params.domain.as_deref())
        .await?;
    Ok(Json(hits))
}

pub async fn domains_handler(State(state): State<SharedState>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.keywords.domain_names().await?))
}

pub async fn get_domain_handler(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<KeywordDomain>, ApiError> {
    state
        .keywords
        .get_domain(&name)
        .await?
        .map(Json)
        .ok_or_else(|| domain_not_found(&name))
}

pub async fn add_domain_handler(
    State(state): State<SharedState>,
    body: Result<Json<NewDomain>, JsonRejection>,
) -> Result<(StatusCode, Json<KeywordDomain>), ApiError> {
    let Json(body) = body?;
    let domain = state.keywords.add_domain(body.domain.trim(), &body.keywords).await?;
    Ok((StatusCode::CREATED, Json(domain)))
}

/// Body is a bare JSON list of keywords; `?append=true` keeps existing ones.
pub async fn update_domain_handler(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    append: Result<Query<AppendParam>, QueryRejection>,
    body: Result<Json<Vec<String>>, JsonRejection>,
) -> Result<Json<KeywordDomain>, ApiError> {
    let Query(AppendParam { append }) = append?;
    let Json(keywords) = body?;
    Ok(Json(state.keywords.set_domain(&name, &keywords, append).await?))
}

pub async fn delete_domain_handler(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.keywords.delete_domain(&name).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(domain_not_found(&name))
    }
}

pub async fn delete_keywords_handler(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    body: Result<Json<KeywordList>, JsonRejection>,
) -> Result<Json<KeywordDomain>, ApiError> {
    let Json(body) = body?;
    state
        .keywords
        .delete_keywords(&name, &body.keywords)
        .await?
        .map(Json)
        .ok_or_else(|| domain_not_found(&name))
}

pub async fn get_negative_handler(State(state): State<SharedState>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.keywords.get_negative().await?))
}

pub async fn set_negative_handler(
    State(state): State<SharedState>,
    append: Result<Query<AppendParam>, QueryRejection>,
    body: Result<Json<Vec<String>>, JsonRejection>,
) -> Result<Json<Vec<String>>, ApiError> {
    let Query(AppendParam { append }) = append?;
    let Json(keywords) = body?;
    Ok(Json(state.keywords.set_negative(&keywords, append).await?))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::app;
    use crate::test_support::{send, state};

    #[tokio::test]
    async fn domain_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state(dir.path()).await);

        let (status, created) = send(
            &app,
            "POST",
            "/keywords/domain",
            Some(json!({ "domain": "Critical Minerals", "keywords": ["lithium", "cobalt"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["count"], 2);

        let (status, body) = send(
            &app,
            "POST",
            "/keywords/domain",
            Some(json!({ "domain": "Critical Minerals", "keywords": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["detail"].as_str().unwrap().contains("already exists"));

        let (status, updated) = send(
            &app,
            "PUT",
            "/keywords/domain/Critical%20Minerals?append=true",
            Some(json!(["graphite", "lithium"])),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["keywords"], json!(["lithium", "cobalt", "graphite"]));

        let (_, hits) = send(&app, "GET", "/keywords/search?query=LITH", None).await;
        assert_eq!(hits["Critical Minerals"], json!(["lithium"]));
        let (status, _) = send(&app, "GET", "/keywords/search?query=l", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, trimmed) = send(
            &app,
            "DELETE",
            "/keywords/domain/Critical%20Minerals/keywords",
            Some(json!({ "keywords": ["cobalt"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(trimmed["keywords"], json!(["lithium", "graphite"]));

        let (_, names) = send(&app, "GET", "/keywords/domains", None).await;
        assert_eq!(names, json!(["Critical Minerals"]));

        let (status, _) = send(&app, "DELETE", "/keywords/domain/Critical%20Minerals", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "GET", "/keywords/domain/Critical%20Minerals", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "DELETE", "/keywords/domain/Critical%20Minerals", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn negative_keywords_replace_or_append() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state(dir.path()).await);

        let (_, list) = send(&app, "PUT", "/keywords/negative", Some(json!(["sports", "tourism"]))).await;
        assert_eq!(list, json!(["sports", "tourism"]));
        let (_, list) = send(&app, "PUT", "/keywords/negative?append=true", Some(json!(["arts"]))).await;
        assert_eq!(list, json!(["sports", "tourism", "arts"]));
        let (_, list) = send(&app, "PUT", "/keywords/negative", Some(json!(["arts"]))).await;
        assert_eq!(list, json!(["arts"]));

        let (status, overview) = send(&app, "GET", "/keywords", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(overview["negative_keywords"], json!(["arts"]));
        assert_eq!(overview["total_domains"], 0);
    }
}
