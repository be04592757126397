use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use grantscout_storage::documents::resolve_filename;
use grantscout_storage::{DocumentContent, DocumentSearchHit, DocumentStatistics, DocumentSummary};
use serde::{Deserialize, Serialize};

use crate::error::{check_range, ApiError};
use crate::SharedState;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    keyword: String,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ReportList {
    reports: Vec<DocumentSummary>,
    total: usize,
}

#[derive(Debug, Serialize)]
pub struct SearchResults {
    keyword: String,
    results: Vec<DocumentSearchHit>,
    total_matches: usize,
}

fn checked_name(filename: &str) -> Result<String, ApiError> {
    resolve_filename(filename)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid report filename '{filename}'")))
}

pub async fn list_handler(
    State(state): State<SharedState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<ReportList>, ApiError> {
    let Query(params) = params?;
    let limit = check_range("limit", params.limit.unwrap_or(20), 1, 100)?;
    let (reports, total) = state.documents.list(limit).await?;
    Ok(Json(ReportList { reports, total }))
}

pub async fn latest_handler(State(state): State<SharedState>) -> Result<Json<DocumentContent>, ApiError> {
    state
        .documents
        .latest()
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("No reports have been generated yet".to_string()))
}

pub async fn search_handler(
    State(state): State<SharedState>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Json<SearchResults>, ApiError> {
    let Query(params) = params?;
    let keyword = params.keyword.trim().to_string();
    if keyword.chars().count() < 2 {
        return Err(ApiError::Validation("keyword must be at least 2 characters".to_string()));
    }
    let limit = check_range("limit", params.limit.unwrap_or(10), 1, 50)?;
    let results = state.documents.search(&keyword, limit).await?;
    let total_matches = results.iter().map(|hit| hit.match_count).sum();
    Ok(Json(SearchResults {
        keyword,
        results,
        total_matches,
    }))
}

pub async fn statistics_handler(State(state): State<SharedState>) -> Result<Json<DocumentStatistics>, ApiError> {
    Ok(Json(state.documents.statistics().await?))
}

pub async fn read_handler(
    State(state): State<SharedState>,
    Path(filename): Path<String>,
) -> Result<Json<DocumentContent>, ApiError> {
    let name = checked_name(&filename)?;
    state
        .documents
        .read(&name)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Report '{name}' not found")))
}

pub async fn delete_handler(
    State(state): State<SharedState>,
    Path(filename): Path<String>,
) -> Result<StatusCode, ApiError> {
    let name = checked_name(&filename)?;
    if state.documents.delete(&name).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Report '{name}' not found")))
    }
}
