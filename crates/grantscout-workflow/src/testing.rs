//! Scripted sources and stages shared by the pipeline and registry tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use grantscout_adapters::{AdapterError, RawRecord, SourceAdapter};
use grantscout_core::{KeywordSet, Opportunity, Phase, PhaseResult, ScoredOpportunity, Source};
use grantscout_storage::KeywordStore;
use tokio::sync::Notify;

use crate::pipeline::{Pipeline, PipelineSettings, RunObserver, RunSummary, Stages};
use crate::stages::{EnrichmentStage, FilterStage, ReportRequest, ReportStage, ScoringStage, StageError};

pub(crate) fn records(prefix: &str, n: usize) -> Vec<RawRecord> {
    (0..n)
        .map(|i| RawRecord {
            title: Some(format!("{prefix} {i}")),
            reference_number: Some(format!("{prefix}-{i}")),
            description: Some(format!("description of {prefix} {i}")),
            agency: Some("Department of Energy".to_string()),
            posted_date: Some("2025-01-02".to_string()),
            open_date: None,
            close_date: Some("2025-03-01".to_string()),
            link: Some(format!("https://{prefix}.example.gov/{i}")),
            source: prefix.to_string(),
        })
        .collect()
}

pub(crate) fn opportunity(url: Option<&str>, title: &str) -> Opportunity {
    let mut item = Opportunity::new(title, "test");
    item.url = url.map(str::to_string);
    item
}

pub(crate) fn scored_item(url: &str, title: &str) -> ScoredOpportunity {
    ScoredOpportunity {
        opportunity: opportunity(Some(url), title),
        feasibility_score: 8.0,
        impact_score: 6.0,
        alignment_score: 7.0,
        total_score: 7.0,
        justification: "solid fit".to_string(),
    }
}

pub(crate) fn hidden_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
                .count()
        })
        .unwrap_or(0)
}

pub(crate) struct StubAdapter {
    source: Source,
    outcome: Result<Vec<RawRecord>, String>,
    delay: Option<Duration>,
    echo_query: bool,
}

impl StubAdapter {
    pub(crate) fn ok(source: Source, records: Vec<RawRecord>) -> Arc<dyn SourceAdapter> {
        Arc::new(Self {
            source,
            outcome: Ok(records),
            delay: None,
            echo_query: false,
        })
    }

    /// Returns one record titled with the query it was given.
    pub(crate) fn echoing_query(source: Source) -> Arc<dyn SourceAdapter> {
        Arc::new(Self {
            source,
            outcome: Ok(Vec::new()),
            delay: None,
            echo_query: true,
        })
    }

    pub(crate) fn failing(source: Source, message: &str) -> Arc<dyn SourceAdapter> {
        Arc::new(Self {
            source,
            outcome: Err(message.to_string()),
            delay: None,
            echo_query: false,
        })
    }

    pub(crate) fn slow(source: Source, delay: Duration) -> Arc<dyn SourceAdapter> {
        Arc::new(Self {
            source,
            outcome: Ok(records("slow", 1)),
            delay: Some(delay),
            echo_query: false,
        })
    }
}

#[async_trait]
impl SourceAdapter for StubAdapter {
    fn source(&self) -> Source {
        self.source
    }

    fn default_limit(&self) -> usize {
        100
    }

    async fn search(
        &self,
        keywords: Option<&str>,
        _days_back: u32,
        _limit: usize,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.echo_query {
            return Ok(vec![RawRecord {
                title: Some(keywords.unwrap_or("<none>").to_string()),
                link: Some(format!("https://{}.example/echo", self.source)),
                source: self.source.display_name().to_string(),
                ..RawRecord::default()
            }]);
        }
        self.outcome.clone().map_err(AdapterError::Decode)
    }
}

/// Enrichment that fails or returns nothing. An optional gate holds the call
/// until released.
pub(crate) struct StubEnrichment {
    pub(crate) calls: AtomicUsize,
    mode: EnrichMode,
    pub(crate) gate: Option<Arc<Notify>>,
}

enum EnrichMode {
    Fail,
    Empty,
}

impl StubEnrichment {
    pub(crate) fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            mode: EnrichMode::Fail,
            gate: None,
        }
    }

    pub(crate) fn returning_nothing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            mode: EnrichMode::Empty,
            gate: None,
        }
    }

    pub(crate) fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::failing()
        }
    }
}

#[async_trait]
impl EnrichmentStage for StubEnrichment {
    async fn merge(&self, _items: &[Opportunity]) -> Result<Vec<Opportunity>, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        match self.mode {
            EnrichMode::Fail => Err(StageError::Unavailable("no model configured".to_string())),
            EnrichMode::Empty => Ok(Vec::new()),
        }
    }
}

pub(crate) struct PredicateFilter {
    pub(crate) calls: AtomicUsize,
    reject: fn(&Opportunity) -> bool,
    fail_on_call: Option<usize>,
    stall_on_call: Option<usize>,
}

impl PredicateFilter {
    pub(crate) fn dropping(reject: fn(&Opportunity) -> bool) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            reject,
            fail_on_call: None,
            stall_on_call: None,
        }
    }

    pub(crate) fn failing_on_call(call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::dropping(|_| false)
        }
    }

    /// Hangs on the given call well past any test stage timeout.
    pub(crate) fn stalling_on_call(call: usize) -> Self {
        Self {
            stall_on_call: Some(call),
            ..Self::dropping(|_| false)
        }
    }
}

#[async_trait]
impl FilterStage for PredicateFilter {
    async fn filter(&self, batch: &[Opportunity], _keywords: &KeywordSet) -> Result<Vec<Opportunity>, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_call == Some(call) {
            return Err(StageError::MalformedOutput("reply lacks an `opportunities` list".to_string()));
        }
        if self.stall_on_call == Some(call) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(batch
            .iter()
            .filter(|o| !(self.reject)(o))
            .cloned()
            .map(|mut o| {
                o.category = "Clean Energy".to_string();
                o
            })
            .collect())
    }
}

pub(crate) struct FixedScorer {
    pub(crate) calls: AtomicUsize,
    mode: ScoreMode,
}

enum ScoreMode {
    Fixed,
    Fail,
    Panic,
}

impl FixedScorer {
    pub(crate) fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            mode: ScoreMode::Fixed,
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            mode: ScoreMode::Fail,
            ..Self::new()
        }
    }

    pub(crate) fn panicking() -> Self {
        Self {
            mode: ScoreMode::Panic,
            ..Self::new()
        }
    }
}

#[async_trait]
impl ScoringStage for FixedScorer {
    async fn score(&self, items: &[Opportunity]) -> Result<Vec<ScoredOpportunity>, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            ScoreMode::Fixed => {}
            ScoreMode::Fail => return Err(StageError::Timeout(Duration::from_secs(1))),
            ScoreMode::Panic => panic!("scorer blew up"),
        }
        Ok(items
            .iter()
            .map(|o| ScoredOpportunity {
                opportunity: o.clone(),
                feasibility_score: 8.0,
                impact_score: 6.0,
                alignment_score: 7.0,
                total_score: 7.0,
                justification: format!("{} fits the portfolio", o.title),
            })
            .collect())
    }
}

pub(crate) struct FileReport {
    pub(crate) calls: AtomicUsize,
    pub(crate) saw_staging: AtomicBool,
    mode: ReportMode,
    delay: Option<Duration>,
}

enum ReportMode {
    Write,
    Fail,
    Silent,
}

impl FileReport {
    fn with_mode(mode: ReportMode) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            saw_staging: AtomicBool::new(false),
            mode,
            delay: None,
        }
    }

    pub(crate) fn new() -> Self {
        Self::with_mode(ReportMode::Write)
    }

    pub(crate) fn failing() -> Self {
        Self::with_mode(ReportMode::Fail)
    }

    pub(crate) fn silent() -> Self {
        Self::with_mode(ReportMode::Silent)
    }

    /// Writes normally after `delay`, holding the destination open meanwhile.
    pub(crate) fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new()
        }
    }
}

#[async_trait]
impl ReportStage for FileReport {
    async fn render(&self, request: &ReportRequest) -> Result<(), StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request.staging_path.is_file() {
            self.saw_staging.store(true, Ordering::SeqCst);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.mode {
            ReportMode::Write => {
                let body = format!(
                    "# {} report\n\n{} items scored.\n",
                    request.profile, request.item_count
                );
                std::fs::write(&request.destination, body).map_err(|e| StageError::io(&request.destination, e))
            }
            ReportMode::Fail => Err(StageError::Render("template exploded".to_string())),
            ReportMode::Silent => Ok(()),
        }
    }
}

/// Builds pipelines over scripted stages rooted in a temp directory.
pub(crate) struct Harness {
    root: PathBuf,
    pub(crate) stage_timeout: Duration,
    pub(crate) enrichment: Arc<StubEnrichment>,
    pub(crate) filter: Arc<PredicateFilter>,
    pub(crate) scoring: Arc<FixedScorer>,
    pub(crate) report: Arc<FileReport>,
}

impl Harness {
    pub(crate) fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            stage_timeout: Duration::from_secs(5),
            enrichment: Arc::new(StubEnrichment::failing()),
            filter: Arc::new(PredicateFilter::dropping(|_| false)),
            scoring: Arc::new(FixedScorer::new()),
            report: Arc::new(FileReport::new()),
        }
    }

    pub(crate) fn outputs_dir(&self) -> PathBuf {
        self.root.join("outputs")
    }

    pub(crate) fn pipeline(&self, adapters: Vec<Arc<dyn SourceAdapter>>) -> Pipeline {
        Pipeline::new(
            adapters,
            Stages {
                enrichment: self.enrichment.clone(),
                filter: self.filter.clone(),
                scoring: self.scoring.clone(),
                report: self.report.clone(),
            },
            KeywordStore::new(self.root.join("keywords.json")),
            PipelineSettings {
                outputs_dir: self.outputs_dir(),
                batch_size: 10,
                stage_timeout: self.stage_timeout,
                max_days_back: 30,
            },
        )
    }
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    started: Mutex<Vec<Phase>>,
}

impl RecordingObserver {
    pub(crate) fn started(&self) -> Vec<Phase> {
        self.started.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl RunObserver for RecordingObserver {
    fn phase_started(&self, phase: Phase) {
        if let Ok(mut started) = self.started.lock() {
            started.push(phase);
        }
    }

    fn phase_finished(&self, _result: &PhaseResult, _summary: &RunSummary) {}
}

/// Reports cancellation once `n` phases have finished.
pub(crate) struct CancelAfter {
    n: usize,
    finished: AtomicUsize,
}

impl CancelAfter {
    pub(crate) fn phases(n: usize) -> Self {
        Self {
            n,
            finished: AtomicUsize::new(0),
        }
    }
}

impl RunObserver for CancelAfter {
    fn phase_started(&self, _phase: Phase) {}

    fn phase_finished(&self, _result: &PhaseResult, _summary: &RunSummary) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.finished.load(Ordering::SeqCst) >= self.n
    }
}
