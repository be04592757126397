use std::collections::BTreeMap;

use axum::{
    extract::{rejection::PathRejection, rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use grantscout_core::{MAX_SCORE, MIN_SCORE};
use grantscout_storage::{OpportunityPage, OpportunityQuery, OpportunityStatistics, StoredOpportunity};
use serde::Deserialize;

use crate::error::{check_range, ApiError};
use crate::SharedState;

const MAX_PAGE: i64 = 500;
const MAX_TOP: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    limit: Option<i64>,
    offset: Option<i64>,
    sector: Option<String>,
    source: Option<String>,
    min_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct TopParams {
    limit: Option<i64>,
    min_score: Option<f64>,
}

fn not_found(id: i64) -> ApiError {
    ApiError::NotFound(format!("Opportunity with ID {id} not found"))
}

pub async fn list_handler(
    State(state): State<SharedState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<OpportunityPage>, ApiError> {
    let Query(params) = params?;
    let query = OpportunityQuery {
        limit: Some(check_range("limit", params.limit.unwrap_or(100), 1, MAX_PAGE)?),
        offset: Some(check_range("offset", params.offset.unwrap_or(0), 0, i64::MAX)?),
        sector: params.sector.filter(|s| !s.is_empty()),
        source: params.source.filter(|s| !s.is_empty()),
        min_score: params
            .min_score
            .map(|s| check_range("min_score", s, MIN_SCORE, MAX_SCORE))
            .transpose()?,
    };
    Ok(Json(state.opportunities.list(&query).await?))
}

pub async fn top_handler(
    State(state): State<SharedState>,
    params: Result<Query<TopParams>, QueryRejection>,
) -> Result<Json<OpportunityPage>, ApiError> {
    let Query(params) = params?;
    let limit = check_range("limit", params.limit.unwrap_or(10), 1, MAX_TOP)?;
    let min_score = check_range(
        "min_score",
        params.min_score.unwrap_or(state.config.top_min_score),
        MIN_SCORE,
        MAX_SCORE,
    )?;
    Ok(Json(state.opportunities.top(limit, min_score).await?))
}

pub async fn statistics_handler(
    State(state): State<SharedState>,
) -> Result<Json<OpportunityStatistics>, ApiError> {
    Ok(Json(state.opportunities.statistics().await?))
}

pub async fn sectors_handler(
    State(state): State<SharedState>,
) -> Result<Json<BTreeMap<String, i64>>, ApiError> {
    Ok(Json(state.opportunities.sector_counts().await?))
}

pub async fn sources_handler(
    State(state): State<SharedState>,
) -> Result<Json<BTreeMap<String, i64>>, ApiError> {
    Ok(Json(state.opportunities.source_counts().await?))
}

pub async fn get_handler(
    State(state): State<SharedState>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<StoredOpportunity>, ApiError> {
    let Path(id) = id?;
    state
        .opportunities
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(id))
}

pub async fn delete_handler(
    State(state): State<SharedState>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<StatusCode, ApiError> {
    let Path(id) = id?;
    if state.opportunities.delete(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(id))
    }
}
