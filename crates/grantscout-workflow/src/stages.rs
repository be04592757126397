//! Contracts for the external processing steps a run delegates to.
//!
//! Each stage is one fallible call taking structured input. The pipeline
//! never interprets how a stage reaches its answer; it only checks shape,
//! applies a timeout and decides what a failure means for the phase.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use grantscout_core::{KeywordSet, Opportunity, RunProfile, ScoredOpportunity};
use grantscout_storage::FetchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage unavailable: {0}")]
    Unavailable(String),
    #[error("model request failed: {0}")]
    Transport(#[from] FetchError),
    #[error("malformed stage output: {0}")]
    MalformedOutput(String),
    #[error("stage timed out after {0:?}")]
    Timeout(Duration),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("render failed: {0}")]
    Render(String),
}

impl StageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Merges duplicates and fills in missing details over the whole fetched set.
#[async_trait]
pub trait EnrichmentStage: Send + Sync {
    async fn merge(&self, items: &[Opportunity]) -> Result<Vec<Opportunity>, StageError>;
}

/// Keeps items matching a positive keyword and no negative one, assigning a category.
#[async_trait]
pub trait FilterStage: Send + Sync {
    async fn filter(
        &self,
        batch: &[Opportunity],
        keywords: &KeywordSet,
    ) -> Result<Vec<Opportunity>, StageError>;
}

#[async_trait]
pub trait ScoringStage: Send + Sync {
    async fn score(&self, items: &[Opportunity]) -> Result<Vec<ScoredOpportunity>, StageError>;
}

/// Where the report stage reads its input and writes its document.
#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub staging_path: PathBuf,
    pub destination: PathBuf,
    pub item_count: usize,
    pub profile: RunProfile,
}

#[async_trait]
pub trait ReportStage: Send + Sync {
    /// Writes the document to `request.destination`.
    async fn render(&self, request: &ReportRequest) -> Result<(), StageError>;
}

/// Produces a secondary-format copy of a generated report.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn convert(&self, markdown_path: &std::path::Path) -> Result<PathBuf, StageError>;
}
