//! Read-only view of the run defaults and the news-profile catalogue.

use std::collections::BTreeMap;

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    Json,
};
use grantscout_core::news::{self, QueryPreset};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::SharedState;

const EXA_CATEGORY: &str = "news";
const EXA_NUM_RESULTS: usize = 15;
const EXA_TEXT_LENGTH_LIMIT: usize = 1000;

#[derive(Debug, Serialize)]
pub struct ExaSettings {
    category: &'static str,
    num_results: usize,
    text_length_limit: usize,
    configured: bool,
}

#[derive(Debug, Serialize)]
pub struct ConfigView {
    model_id: String,
    default_days_back: u32,
    max_days_back: u32,
    batch_size: usize,
    workers: usize,
    stage_timeout_secs: u64,
    exa_num_results: usize,
    exa_text_length_limit: usize,
    exa_category: &'static str,
    critical_minerals: &'static [&'static str],
    default_query: &'static str,
    output_directory: String,
    report_sections: &'static [&'static str],
    geographic_regions: &'static [&'static str],
    industry_sectors: &'static [&'static str],
    search_presets: BTreeMap<&'static str, &'static str>,
    trusted_domains: BTreeMap<&'static str, &'static [&'static str]>,
}

#[derive(Debug, Serialize)]
pub struct MineralsList {
    minerals: &'static [&'static str],
    count: usize,
}

#[derive(Debug, Deserialize)]
pub struct GenerateParams {
    /// Comma-separated mineral names.
    minerals: String,
}

#[derive(Debug, Serialize)]
pub struct GeneratedQuery {
    minerals: Vec<String>,
    query: String,
}

fn trusted_domains() -> BTreeMap<&'static str, &'static [&'static str]> {
    news::TRUSTED_DOMAINS.iter().copied().collect()
}

fn exa_settings(state: &SharedState) -> ExaSettings {
    ExaSettings {
        category: EXA_CATEGORY,
        num_results: EXA_NUM_RESULTS,
        text_length_limit: EXA_TEXT_LENGTH_LIMIT,
        configured: state.config.exa_api_key.is_some(),
    }
}

pub async fn config_handler(State(state): State<SharedState>) -> Json<ConfigView> {
    let cfg = &state.config;
    Json(ConfigView {
        model_id: cfg.model.model.clone(),
        default_days_back: cfg.default_days_back,
        max_days_back: cfg.max_days_back,
        batch_size: cfg.batch_size,
        workers: cfg.workers,
        stage_timeout_secs: cfg.stage_timeout_secs,
        exa_num_results: EXA_NUM_RESULTS,
        exa_text_length_limit: EXA_TEXT_LENGTH_LIMIT,
        exa_category: EXA_CATEGORY,
        critical_minerals: &news::CRITICAL_MINERALS,
        default_query: news::DEFAULT_QUERY,
        output_directory: cfg.outputs_dir.display().to_string(),
        report_sections: &news::REPORT_SECTIONS,
        geographic_regions: &news::GEOGRAPHIC_REGIONS,
        industry_sectors: &news::INDUSTRY_SECTORS,
        search_presets: news::QUERY_PRESETS.iter().map(|p| (p.name, p.query)).collect(),
        trusted_domains: trusted_domains(),
    })
}

pub async fn minerals_handler() -> Json<MineralsList> {
    Json(MineralsList {
        minerals: &news::CRITICAL_MINERALS[..],
        count: news::CRITICAL_MINERALS.len(),
    })
}

pub async fn presets_handler() -> Json<&'static [QueryPreset]> {
    Json(&news::QUERY_PRESETS[..])
}

pub async fn domains_handler() -> Json<BTreeMap<&'static str, &'static [&'static str]>> {
    Json(trusted_domains())
}

pub async fn regions_handler() -> Json<&'static [&'static str]> {
    Json(&news::GEOGRAPHIC_REGIONS[..])
}

pub async fn sectors_handler() -> Json<&'static [&'static str]> {
    Json(&news::INDUSTRY_SECTORS[..])
}

pub async fn exa_handler(State(state): State<SharedState>) -> Json<ExaSettings> {
    Json(exa_settings(&state))
}

pub async fn generate_query_handler(
    params: Result<Query<GenerateParams>, QueryRejection>,
) -> Result<Json<GeneratedQuery>, ApiError> {
    let Query(params) = params?;
    let minerals: Vec<String> = params
        .minerals
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect();
    if minerals.is_empty() {
        return Err(ApiError::Validation("minerals must name at least one mineral".to_string()));
    }
    let query = news::minerals_query(&minerals);
    Ok(Json(GeneratedQuery { minerals, query }))
}
