//! Discovery run orchestration: stages, the phase pipeline, the run registry
//! and the wiring that builds them from configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use grantscout_adapters::default_adapters;
use grantscout_storage::{DocumentStore, HttpFetcher, KeywordStore, OpportunityStore};
use tracing::info;

pub mod config;
pub mod convert;
pub mod dedup;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod stages;

#[cfg(test)]
mod testing;

pub use config::{WorkflowConfig, DEFAULT_BATCH_SIZE, DEFAULT_WORKERS};
pub use convert::{markdown_to_html, normalize_typography, HtmlConverter};
pub use dedup::{batches, fallback_dedup, validate_scores, TOTAL_TOLERANCE};
pub use model::{
    ChatClient, ModelEnrichmentStage, ModelFilterStage, ModelReportStage, ModelScoringStage,
    ModelSettings,
};
pub use pipeline::{
    AggregateOutcome, FetchOutcome, FilterOutcome, NoopObserver, Pipeline, PipelineSettings,
    RunObserver, RunSummary, Stages,
};
pub use registry::{RegistryObserver, WorkflowRegistry, WorkflowService, DEFAULT_RETAINED_RUNS};
pub use stages::{
    DocumentConverter, EnrichmentStage, FilterStage, ReportRequest, ReportStage, ScoringStage,
    StageError,
};

pub const CRATE_NAME: &str = "grantscout-workflow";

/// Everything the HTTP API and CLI need, built once per process.
#[derive(Clone)]
pub struct Services {
    pub config: WorkflowConfig,
    pub workflows: WorkflowService,
    pub keywords: KeywordStore,
    pub opportunities: OpportunityStore,
    pub documents: DocumentStore,
}

impl Services {
    pub async fn from_config(config: WorkflowConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let adapters = default_adapters(&http, &config.adapter_settings());

        let chat = Arc::new(ChatClient::new(http, config.model.clone()));
        if config.exa_api_key.is_none() {
            info!("EXA_API_KEY not set; news profile sources will report a missing credential");
        }
        if config.model.api_key.is_none() {
            info!("OPENAI_API_KEY not set; enrichment falls back to local dedup and later stages will fail");
        }
        let stages = Stages {
            enrichment: Arc::new(ModelEnrichmentStage::new(chat.clone())),
            filter: Arc::new(ModelFilterStage::new(chat.clone())),
            scoring: Arc::new(ModelScoringStage::new(chat.clone())),
            report: Arc::new(ModelReportStage::new(chat)),
        };

        let keywords = KeywordStore::new(config.keywords_path.clone());
        let opportunities = OpportunityStore::open(&config.database_path)
            .await
            .with_context(|| format!("opening database {}", config.database_path.display()))?;
        let documents = DocumentStore::new(config.outputs_dir.clone());
        documents
            .ensure_dir()
            .await
            .with_context(|| format!("creating outputs dir {}", config.outputs_dir.display()))?;

        let pipeline = Pipeline::new(
            adapters,
            stages,
            keywords.clone(),
            PipelineSettings {
                outputs_dir: config.outputs_dir.clone(),
                batch_size: config.batch_size,
                stage_timeout: config.stage_timeout(),
                max_days_back: config.max_days_back,
            },
        )
        .with_store(opportunities.clone())
        .with_converter(Arc::new(HtmlConverter));
        let workflows = WorkflowService::with_registry(
            WorkflowRegistry::with_capacity(config.retained_runs),
            pipeline,
            config.workers,
        );

        Ok(Self {
            config,
            workflows,
            keywords,
            opportunities,
            documents,
        })
    }

    pub async fn from_env() -> Result<Self> {
        Self::from_config(WorkflowConfig::from_env()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn services_build_from_config_in_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkflowConfig {
            database_path: dir.path().join("db.sqlite"),
            keywords_path: dir.path().join("keywords.json"),
            outputs_dir: dir.path().join("outputs"),
            ..WorkflowConfig::default()
        };
        let services = Services::from_config(config).await.unwrap();
        assert!(dir.path().join("outputs").is_dir());
        assert_eq!(services.opportunities.count().await.unwrap(), 0);
        assert!(services.workflows.list(10).is_empty());
        assert_eq!(services.workflows.max_days_back(), 30);
        assert_eq!(services.workflows.registry().capacity(), 500);
    }
}
