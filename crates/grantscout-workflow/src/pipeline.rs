//! Phase sequencing for a single discovery run.

use std::collections::BTreeMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use futures::future::join_all;
use grantscout_adapters::{RawRecord, SourceAdapter};
use grantscout_core::{
    KeywordSet, Opportunity, Phase, PhaseResult, RunConfig, RunProfile, RunStatus, ScoredOpportunity,
    Source,
};
use grantscout_storage::{KeywordStore, OpportunityStore};
use serde::Serialize;
use tokio::fs;
use tokio::time::timeout;
use tracing::{info, info_span, warn, Instrument};

use crate::dedup::{batches, fallback_dedup, validate_scores};
use crate::stages::{
    DocumentConverter, EnrichmentStage, FilterStage, ReportRequest, ReportStage, ScoringStage,
    StageError,
};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub outputs_dir: PathBuf,
    pub batch_size: usize,
    pub stage_timeout: Duration,
    pub max_days_back: u32,
}

pub struct Stages {
    pub enrichment: Arc<dyn EnrichmentStage>,
    pub filter: Arc<dyn FilterStage>,
    pub scoring: Arc<dyn ScoringStage>,
    pub report: Arc<dyn ReportStage>,
}

/// Receives progress from a running pipeline.
pub trait RunObserver: Send + Sync {
    fn phase_started(&self, phase: Phase);

    /// Called after `result` has been appended to `summary.phases`.
    fn phase_finished(&self, result: &PhaseResult, summary: &RunSummary);

    /// Checked between phases; a `true` stops the run before the next phase.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Observer for callers that only want the returned summary.
pub struct NoopObserver;

impl RunObserver for NoopObserver {
    fn phase_started(&self, _phase: Phase) {}
    fn phase_finished(&self, _result: &PhaseResult, _summary: &RunSummary) {}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub phases: Vec<PhaseResult>,
    pub total_opportunities_found: Option<usize>,
    pub total_opportunities_scored: Option<usize>,
    pub report_path: Option<String>,
    pub converted_path: Option<String>,
    pub source_errors: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl RunSummary {
    fn running() -> Self {
        Self {
            status: RunStatus::Running,
            phases: Vec::new(),
            total_opportunities_found: None,
            total_opportunities_scored: None,
            report_path: None,
            converted_path: None,
            source_errors: BTreeMap::new(),
            error: None,
        }
    }

    fn finish(mut self, status: RunStatus, error: Option<String>) -> Self {
        self.status = status;
        self.error = error;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub items: Vec<Opportunity>,
    pub source_errors: BTreeMap<String, String>,
    pub sources_attempted: usize,
}

impl FetchOutcome {
    pub fn all_failed(&self) -> bool {
        self.sources_attempted > 0 && self.source_errors.len() == self.sources_attempted
    }
}

#[derive(Debug, Clone)]
pub struct AggregateOutcome {
    pub items: Vec<Opportunity>,
    /// Set when the enrichment stage failed and local dedup was used instead.
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub items: Vec<Opportunity>,
    pub batches: usize,
    pub failed_batches: Vec<String>,
}

impl FilterOutcome {
    pub fn all_failed(&self) -> bool {
        self.batches > 0 && self.failed_batches.len() == self.batches
    }
}

/// Transient input file for the report stage, removed when dropped.
struct StagingFile {
    path: PathBuf,
}

impl StagingFile {
    async fn write(path: PathBuf, scored: &[ScoredOpportunity]) -> Result<Self, StageError> {
        let bytes = serde_json::to_vec_pretty(scored)
            .map_err(|e| StageError::Render(format!("serializing report data: {e}")))?;
        let staged = Self { path };
        fs::write(&staged.path, bytes)
            .await
            .map_err(|e| StageError::io(&staged.path, e))?;
        Ok(staged)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "could not remove report staging file");
            }
        }
    }
}

pub struct Pipeline {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    stages: Stages,
    converter: Option<Arc<dyn DocumentConverter>>,
    keywords: KeywordStore,
    store: Option<OpportunityStore>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        stages: Stages,
        keywords: KeywordStore,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            adapters,
            stages,
            converter: None,
            keywords,
            store: None,
            settings,
        }
    }

    pub fn with_store(mut self, store: OpportunityStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn DocumentConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    async fn guarded<T, F>(&self, call: F) -> Result<T, StageError>
    where
        F: Future<Output = Result<T, StageError>>,
    {
        match timeout(self.settings.stage_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout(self.settings.stage_timeout)),
        }
    }

    /// Queries every selected source concurrently. Results are concatenated in
    /// source order; a failing source only adds an entry to `source_errors`.
    pub async fn fetch_all(
        &self,
        sources: &[Source],
        query: Option<&str>,
        days_back: u32,
        per_source_limit: Option<usize>,
    ) -> FetchOutcome {
        let selected = Source::expand(sources);
        let stage_timeout = self.settings.stage_timeout;

        let calls = selected.iter().map(|source| {
            let adapter = self.adapters.iter().find(|a| a.source() == *source).cloned();
            let span = info_span!("source_search", source = %source);
            async move {
                let Some(adapter) = adapter else {
                    return Err("no adapter configured".to_string());
                };
                let limit = per_source_limit.unwrap_or_else(|| adapter.default_limit());
                match timeout(stage_timeout, adapter.search(query, days_back, limit)).await {
                    Ok(Ok(mut records)) => {
                        records.truncate(limit);
                        info!(count = records.len(), "source search finished");
                        Ok(records)
                    }
                    Ok(Err(err)) => Err(err.to_string()),
                    Err(_) => Err(format!("timed out after {stage_timeout:?}")),
                }
            }
            .instrument(span)
        });
        let results = join_all(calls).await;

        let mut outcome = FetchOutcome {
            sources_attempted: selected.len(),
            ..FetchOutcome::default()
        };
        for (source, result) in selected.iter().zip(results) {
            match result {
                Ok(records) => outcome
                    .items
                    .extend(records.into_iter().map(RawRecord::into_opportunity)),
                Err(message) => {
                    warn!(source = %source, error = %message, "source failed");
                    outcome.source_errors.insert(source.as_str().to_string(), message);
                }
            }
        }
        outcome
    }

    /// One enrichment call over the whole set, with local dedup as the fallback.
    pub async fn aggregate(&self, items: Vec<Opportunity>) -> AggregateOutcome {
        let result = self.guarded(self.stages.enrichment.merge(&items)).await;
        match result {
            Ok(merged) => AggregateOutcome {
                items: merged,
                fallback_reason: None,
            },
            Err(err) => {
                warn!(error = %err, "enrichment stage failed; falling back to local dedup");
                AggregateOutcome {
                    items: fallback_dedup(items),
                    fallback_reason: Some(err.to_string()),
                }
            }
        }
    }

    /// Runs the filter stage per batch. A failed batch contributes nothing.
    pub async fn filter(
        &self,
        items: &[Opportunity],
        keywords: &KeywordSet,
        batch_size: usize,
    ) -> FilterOutcome {
        let total = items.len().div_ceil(batch_size.max(1));
        let mut outcome = FilterOutcome {
            batches: total,
            ..FilterOutcome::default()
        };
        for (idx, batch) in batches(items, batch_size).enumerate() {
            let result = self.guarded(self.stages.filter.filter(batch, keywords)).await;
            match result {
                Ok(kept) => outcome.items.extend(kept),
                Err(err) => {
                    warn!(batch = idx + 1, total, error = %err, "filter batch failed");
                    outcome
                        .failed_batches
                        .push(format!("batch {}/{}: {}", idx + 1, total, err));
                }
            }
        }
        outcome
    }

    /// Single scoring call. Returns the in-range items and how many were dropped.
    pub async fn score(
        &self,
        items: &[Opportunity],
    ) -> Result<(Vec<ScoredOpportunity>, usize), StageError> {
        let scored = self.guarded(self.stages.scoring.score(items)).await?;
        Ok(validate_scores(scored))
    }

    /// Stages the scored items, asks the report stage for a document and
    /// returns its path, or `None` when nothing was written.
    pub async fn report(
        &self,
        scored: &[ScoredOpportunity],
        run_id: &str,
        profile: RunProfile,
    ) -> Result<Option<PathBuf>, StageError> {
        let dir = &self.settings.outputs_dir;
        fs::create_dir_all(dir)
            .await
            .map_err(|e| StageError::io(dir, e))?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let destination = claim_report_path(dir, profile.report_prefix(), &stamp, run_id).await?;

        let staging =
            StagingFile::write(dir.join(format!(".report_data_{stamp}_{}.json", file_token(run_id))), scored)
                .await?;
        let request = ReportRequest {
            staging_path: staging.path().to_path_buf(),
            destination: destination.clone(),
            item_count: scored.len(),
            profile,
        };
        let result = self.guarded(self.stages.report.render(&request)).await;
        drop(staging);

        let written = match &result {
            Ok(()) => fs::metadata(&destination)
                .await
                .is_ok_and(|meta| meta.is_file() && meta.len() > 0),
            Err(_) => false,
        };
        if !written {
            if let Err(err) = fs::remove_file(&destination).await {
                if err.kind() != ErrorKind::NotFound {
                    warn!(path = %destination.display(), error = %err, "could not remove unused report path");
                }
            }
        }
        result?;
        Ok(written.then_some(destination))
    }

    /// Converts the report when a converter is configured.
    pub async fn convert(&self, report: &Path) -> Option<Result<PathBuf, StageError>> {
        let converter = self.converter.as_ref()?;
        Some(self.guarded(converter.convert(report)).await)
    }

    async fn persist_discovered(&self, items: &[Opportunity], observer: &dyn RunObserver) {
        if observer.is_cancelled() {
            info!("run cancelled; discovered opportunities not saved");
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        match store.save_discovered(items).await {
            Ok(saved) => info!(
                written = saved.written,
                ignored = saved.ignored,
                rejected = saved.rejected,
                "discovered opportunities saved"
            ),
            Err(err) => warn!(error = %err, "saving discovered opportunities failed"),
        }
    }

    async fn persist_scored(&self, items: &[ScoredOpportunity], observer: &dyn RunObserver) {
        if observer.is_cancelled() {
            info!("run cancelled; scores not saved");
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        match store.save_scored(items).await {
            Ok(saved) => info!(
                written = saved.written,
                rejected = saved.rejected,
                "scored opportunities saved"
            ),
            Err(err) => warn!(error = %err, "saving scored opportunities failed"),
        }
    }

    fn record(summary: &mut RunSummary, result: PhaseResult, observer: &dyn RunObserver) {
        if result.is_failed() {
            warn!(phase = %result.phase, message = ?result.message, "phase failed");
        } else {
            info!(phase = %result.phase, count = ?result.count, "phase completed");
        }
        summary.phases.push(result);
        if let Some(last) = summary.phases.last() {
            observer.phase_finished(last, summary);
        }
    }

    fn cancelled(summary: RunSummary, next: Phase) -> RunSummary {
        info!(next = %next, "run cancelled; skipping remaining phases");
        summary.finish(RunStatus::Cancelled, Some(format!("Cancelled before {next} phase")))
    }

    /// Executes fetch → aggregate → filter → score → report → convert,
    /// stopping early when a phase leaves nothing to work on.
    pub async fn run(&self, run_id: &str, config: &RunConfig, observer: &dyn RunObserver) -> RunSummary {
        let mut summary = RunSummary::running();
        if let Err(err) = config.validate(self.settings.max_days_back) {
            return summary.finish(RunStatus::Failed, Some(err.to_string()));
        }
        let batch_size = config.batch_size.unwrap_or(self.settings.batch_size);

        // fetch
        if observer.is_cancelled() {
            return Self::cancelled(summary, Phase::Fetch);
        }
        observer.phase_started(Phase::Fetch);
        let started = Instant::now();
        let fetched = self
            .fetch_all(
                &config.sources,
                config.query.as_deref(),
                config.days_back,
                config.per_source_limit,
            )
            .await;
        let found = fetched.items.len();
        summary.total_opportunities_found = Some(found);
        summary.source_errors = fetched.source_errors.clone();
        let ok_sources = fetched.sources_attempted - fetched.source_errors.len();
        let result = if fetched.all_failed() {
            PhaseResult::failed(
                Phase::Fetch,
                0,
                started.elapsed().as_secs_f64(),
                format!("All {} sources failed", fetched.sources_attempted),
            )
        } else {
            PhaseResult::completed(
                Phase::Fetch,
                found,
                started.elapsed().as_secs_f64(),
                format!(
                    "Fetched {found} opportunities from {ok_sources}/{} sources",
                    fetched.sources_attempted
                ),
            )
        };
        Self::record(&mut summary, result, observer);
        if found == 0 {
            if fetched.all_failed() {
                let detail = fetched
                    .source_errors
                    .iter()
                    .map(|(source, err)| format!("{source}: {err}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                return summary.finish(RunStatus::Failed, Some(format!("All sources failed: {detail}")));
            }
            return summary.finish(
                RunStatus::Completed,
                Some("No opportunities found from any source".to_string()),
            );
        }

        // aggregate
        if observer.is_cancelled() {
            return Self::cancelled(summary, Phase::Aggregate);
        }
        observer.phase_started(Phase::Aggregate);
        let started = Instant::now();
        let aggregated = self.aggregate(fetched.items).await;
        let count = aggregated.items.len();
        let message = match &aggregated.fallback_reason {
            None => format!("Aggregated to {count} unique opportunities"),
            Some(reason) => format!("Enrichment unavailable ({reason}); local dedup kept {count} opportunities"),
        };
        Self::record(
            &mut summary,
            PhaseResult::completed(Phase::Aggregate, count, started.elapsed().as_secs_f64(), message),
            observer,
        );
        if config.save_to_db {
            self.persist_discovered(&aggregated.items, observer).await;
        }
        if count == 0 {
            return summary.finish(
                RunStatus::Completed,
                Some("No opportunities left after aggregation".to_string()),
            );
        }

        // filter
        if observer.is_cancelled() {
            return Self::cancelled(summary, Phase::Filter);
        }
        observer.phase_started(Phase::Filter);
        let started = Instant::now();
        let keywords = match self.keywords.keywords_for_run(config.domains.as_deref()).await {
            Ok(keywords) => keywords,
            Err(err) => {
                let message = format!("Keyword store unavailable: {err}");
                Self::record(
                    &mut summary,
                    PhaseResult::failed(Phase::Filter, 0, started.elapsed().as_secs_f64(), message.clone()),
                    observer,
                );
                return summary.finish(RunStatus::Completed, Some(message));
            }
        };
        let filtered = self.filter(&aggregated.items, &keywords, batch_size).await;
        let count = filtered.items.len();
        let elapsed = started.elapsed().as_secs_f64();
        let result = if filtered.all_failed() {
            PhaseResult::failed(
                Phase::Filter,
                0,
                elapsed,
                format!("All {} filter batches failed", filtered.batches),
            )
        } else if filtered.failed_batches.is_empty() {
            PhaseResult::completed(Phase::Filter, count, elapsed, format!("Filtered to {count} relevant opportunities"))
        } else {
            PhaseResult::completed(
                Phase::Filter,
                count,
                elapsed,
                format!(
                    "Filtered to {count} relevant opportunities ({} of {} batches failed: {})",
                    filtered.failed_batches.len(),
                    filtered.batches,
                    filtered.failed_batches.join("; ")
                ),
            )
        };
        Self::record(&mut summary, result, observer);
        if count == 0 {
            let error = if filtered.all_failed() {
                "Filter stage failed for every batch"
            } else {
                "No opportunities matched domain keywords"
            };
            return summary.finish(RunStatus::Completed, Some(error.to_string()));
        }

        // score
        if observer.is_cancelled() {
            return Self::cancelled(summary, Phase::Score);
        }
        observer.phase_started(Phase::Score);
        let started = Instant::now();
        let scored = match self.score(&filtered.items).await {
            Ok((scored, discarded)) => {
                let count = scored.len();
                let message = if discarded == 0 {
                    format!("Scored {count} opportunities")
                } else {
                    format!("Scored {count} opportunities ({discarded} discarded for out-of-range scores)")
                };
                summary.total_opportunities_scored = Some(count);
                Self::record(
                    &mut summary,
                    PhaseResult::completed(Phase::Score, count, started.elapsed().as_secs_f64(), message),
                    observer,
                );
                scored
            }
            Err(err) => {
                let message = format!("Scoring failed: {err}");
                summary.total_opportunities_scored = Some(0);
                Self::record(
                    &mut summary,
                    PhaseResult::failed(Phase::Score, 0, started.elapsed().as_secs_f64(), message.clone()),
                    observer,
                );
                return summary.finish(RunStatus::Completed, Some(message));
            }
        };
        if config.save_to_db {
            self.persist_scored(&scored, observer).await;
        }
        if scored.is_empty() {
            return summary.finish(
                RunStatus::Completed,
                Some("No opportunities could be scored".to_string()),
            );
        }
        if !config.generate_report {
            return summary.finish(RunStatus::Completed, None);
        }

        // report
        if observer.is_cancelled() {
            return Self::cancelled(summary, Phase::Report);
        }
        observer.phase_started(Phase::Report);
        let started = Instant::now();
        let report_path = match self.report(&scored, run_id, config.profile).await {
            Ok(Some(path)) => {
                let name = file_name(&path);
                summary.report_path = Some(path.display().to_string());
                Self::record(
                    &mut summary,
                    PhaseResult::completed(Phase::Report, 1, started.elapsed().as_secs_f64(), format!("Generated report: {name}")),
                    observer,
                );
                path
            }
            Ok(None) => {
                Self::record(
                    &mut summary,
                    PhaseResult::failed(Phase::Report, 0, started.elapsed().as_secs_f64(), "Report stage produced no document"),
                    observer,
                );
                return summary.finish(RunStatus::Completed, None);
            }
            Err(err) => {
                Self::record(
                    &mut summary,
                    PhaseResult::failed(Phase::Report, 0, started.elapsed().as_secs_f64(), format!("Report generation failed: {err}")),
                    observer,
                );
                return summary.finish(RunStatus::Completed, None);
            }
        };

        // convert
        if !config.convert_report || self.converter.is_none() {
            return summary.finish(RunStatus::Completed, None);
        }
        if observer.is_cancelled() {
            return Self::cancelled(summary, Phase::Convert);
        }
        observer.phase_started(Phase::Convert);
        let started = Instant::now();
        let result = match self.convert(&report_path).await {
            Some(Ok(path)) => {
                let name = file_name(&path);
                summary.converted_path = Some(path.display().to_string());
                PhaseResult::completed(Phase::Convert, 1, started.elapsed().as_secs_f64(), format!("Converted report: {name}"))
            }
            Some(Err(err)) => PhaseResult::failed(
                Phase::Convert,
                0,
                started.elapsed().as_secs_f64(),
                format!("Conversion failed: {err}"),
            ),
            None => PhaseResult::failed(Phase::Convert, 0, 0.0, "No converter configured"),
        };
        Self::record(&mut summary, result, observer);
        summary.finish(RunStatus::Completed, None)
    }
}

/// Run ids restricted to characters that are safe in a file name.
fn file_token(run_id: &str) -> String {
    run_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

/// Creates the report file exclusively so concurrent runs never share a path.
/// The short run id is tried first, then the whole id.
async fn claim_report_path(dir: &Path, prefix: &str, stamp: &str, run_id: &str) -> Result<PathBuf, StageError> {
    let token = file_token(run_id);
    let short: String = token.chars().take(8).collect();
    let mut names = vec![format!("{prefix}_{stamp}_{short}.md")];
    if token != short {
        names.push(format!("{prefix}_{stamp}_{token}.md"));
    }
    for name in names {
        let path = dir.join(name);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(_) => return Ok(path),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(StageError::io(&path, err)),
        }
    }
    Err(StageError::io(
        dir,
        std::io::Error::new(ErrorKind::AlreadyExists, format!("report name for run {run_id} is taken")),
    ))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
