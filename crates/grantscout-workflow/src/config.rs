use std::path::PathBuf;
use std::time::Duration;

use grantscout_adapters::AdapterSettings;
use grantscout_core::{DEFAULT_DAYS_BACK, MAX_DAYS_BACK};
use grantscout_storage::HttpClientConfig;

use crate::model::{ModelSettings, DEFAULT_MODEL, DEFAULT_MODEL_BASE_URL};
use crate::registry::DEFAULT_RETAINED_RUNS;

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_WORKERS: usize = 3;

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub database_path: PathBuf,
    pub keywords_path: PathBuf,
    pub outputs_dir: PathBuf,
    pub default_days_back: u32,
    pub max_days_back: u32,
    pub batch_size: usize,
    pub workers: usize,
    pub retained_runs: usize,
    pub stage_timeout_secs: u64,
    pub top_min_score: f64,
    pub user_agent: String,
    pub model: ModelSettings,
    pub simpler_grants_api_key: Option<String>,
    pub sam_gov_api_key: Option<String>,
    pub exa_api_key: Option<String>,
    pub host: String,
    pub port: u16,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("opportunity_discovery.db"),
            keywords_path: PathBuf::from("keywords.json"),
            outputs_dir: PathBuf::from("outputs"),
            default_days_back: DEFAULT_DAYS_BACK,
            max_days_back: MAX_DAYS_BACK,
            batch_size: DEFAULT_BATCH_SIZE,
            workers: DEFAULT_WORKERS,
            retained_runs: DEFAULT_RETAINED_RUNS,
            stage_timeout_secs: 90,
            top_min_score: 7.0,
            user_agent: "grantscout/0.1".to_string(),
            model: ModelSettings::default(),
            simpler_grants_api_key: None,
            sam_gov_api_key: None,
            exa_api_key: None,
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_secret(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl WorkflowConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: std::env::var("GRANTSCOUT_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            keywords_path: std::env::var("GRANTSCOUT_KEYWORDS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.keywords_path),
            outputs_dir: std::env::var("GRANTSCOUT_OUTPUTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.outputs_dir),
            default_days_back: env_parse("GRANTSCOUT_DEFAULT_DAYS_BACK").unwrap_or(defaults.default_days_back),
            max_days_back: env_parse("GRANTSCOUT_MAX_DAYS_BACK").unwrap_or(defaults.max_days_back),
            batch_size: env_parse::<usize>("GRANTSCOUT_BATCH_SIZE")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_size),
            workers: env_parse::<usize>("GRANTSCOUT_WORKERS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.workers),
            retained_runs: env_parse::<usize>("GRANTSCOUT_MAX_RETAINED_RUNS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.retained_runs),
            stage_timeout_secs: env_parse("GRANTSCOUT_STAGE_TIMEOUT_SECS").unwrap_or(defaults.stage_timeout_secs),
            top_min_score: env_parse("GRANTSCOUT_TOP_MIN_SCORE").unwrap_or(defaults.top_min_score),
            user_agent: std::env::var("GRANTSCOUT_USER_AGENT").unwrap_or(defaults.user_agent),
            model: ModelSettings {
                api_key: env_secret("OPENAI_API_KEY"),
                base_url: std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_MODEL_BASE_URL.to_string()),
                model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            },
            simpler_grants_api_key: env_secret("SIMPLER_GRANTS_GOV_API_KEY"),
            sam_gov_api_key: env_secret("SAM_GOV_API_KEY"),
            exa_api_key: env_secret("EXA_API_KEY"),
            host: std::env::var("GRANTSCOUT_HOST").unwrap_or(defaults.host),
            port: env_parse("GRANTSCOUT_PORT").unwrap_or(defaults.port),
        }
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs.max(1))
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.stage_timeout(),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            simpler_grants_api_key: self.simpler_grants_api_key.clone(),
            sam_gov_api_key: self.sam_gov_api_key.clone(),
            exa_api_key: self.exa_api_key.clone(),
            ..Default::default()
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = WorkflowConfig::default();
        assert_eq!(cfg.default_days_back, 7);
        assert_eq!(cfg.max_days_back, 30);
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.retained_runs, 500);
        assert_eq!(cfg.top_min_score, 7.0);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8000");
        assert_eq!(cfg.stage_timeout(), Duration::from_secs(90));
    }
}
