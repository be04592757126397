//! Core domain model for the opportunity discovery workflow.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod news;

pub const CRATE_NAME: &str = "grantscout-core";

/// Category carried by every item until the filter stage assigns one.
pub const UNCLASSIFIED: &str = "Unclassified";

/// Reserved keyword domain holding exclusion keywords.
pub const NEGATIVE_DOMAIN: &str = "Negative_Keywords_To_Exclude";

pub const FEASIBILITY_WEIGHT: f64 = 0.35;
pub const IMPACT_WEIGHT: f64 = 0.35;
pub const ALIGNMENT_WEIGHT: f64 = 0.30;

pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 10.0;

fn default_category() -> String {
    UNCLASSIFIED.to_string()
}

/// One discovered funding record, normalized from any source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub source: String,
    #[serde(default)]
    pub agency: Option<String>,
    #[serde(default = "default_category", alias = "sector")]
    pub category: String,
    #[serde(default)]
    pub published_date: Option<String>,
    #[serde(default, alias = "openDate")]
    pub open_date: Option<String>,
    #[serde(default, alias = "closeDate")]
    pub close_date: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl Opportunity {
    pub fn new(title: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            source: source.into(),
            agency: None,
            category: default_category(),
            published_date: None,
            open_date: None,
            close_date: None,
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// URL when present and non-blank.
    pub fn url_key(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }

    /// Natural identity: the URL, or the title when no URL is known.
    pub fn identity_key(&self) -> Option<&str> {
        self.url_key().or_else(|| {
            let title = self.title.trim();
            (!title.is_empty()).then_some(title)
        })
    }

    /// An item with neither URL nor title cannot be stored.
    pub fn is_persistable(&self) -> bool {
        self.identity_key().is_some()
    }
}

/// An opportunity annotated by the scoring stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredOpportunity {
    #[serde(flatten)]
    pub opportunity: Opportunity,
    pub feasibility_score: f64,
    pub impact_score: f64,
    pub alignment_score: f64,
    pub total_score: f64,
    #[serde(default)]
    pub justification: String,
}

impl ScoredOpportunity {
    pub fn weighted_total(&self) -> f64 {
        FEASIBILITY_WEIGHT * self.feasibility_score
            + IMPACT_WEIGHT * self.impact_score
            + ALIGNMENT_WEIGHT * self.alignment_score
    }

    pub fn scores_in_range(&self) -> bool {
        [
            self.feasibility_score,
            self.impact_score,
            self.alignment_score,
            self.total_score,
        ]
        .iter()
        .all(|s| s.is_finite() && (MIN_SCORE..=MAX_SCORE).contains(s))
    }

    pub fn total_matches_weights(&self, tolerance: f64) -> bool {
        (self.weighted_total() - self.total_score).abs() <= tolerance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    SimplerGrants,
    GrantsGov,
    SamGov,
    All,
    News,
    Twitter,
    Linkedin,
    Csis,
    AllNews,
}

impl Source {
    pub const GRANTS: [Source; 3] = [Source::SimplerGrants, Source::GrantsGov, Source::SamGov];
    pub const NEWS: [Source; 4] = [Source::News, Source::Twitter, Source::Linkedin, Source::Csis];
    /// Every source backed by an adapter, grants first.
    pub const CONCRETE: [Source; 7] = [
        Source::SimplerGrants,
        Source::GrantsGov,
        Source::SamGov,
        Source::News,
        Source::Twitter,
        Source::Linkedin,
        Source::Csis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::SimplerGrants => "simpler_grants",
            Source::GrantsGov => "grants_gov",
            Source::SamGov => "sam_gov",
            Source::All => "all",
            Source::News => "news",
            Source::Twitter => "twitter",
            Source::Linkedin => "linkedin",
            Source::Csis => "csis",
            Source::AllNews => "all_news",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Source::SimplerGrants => "Simpler.Grants.gov",
            Source::GrantsGov => "Grants.gov",
            Source::SamGov => "SAM.gov",
            Source::All => "All sources",
            Source::News => "News",
            Source::Twitter => "Twitter/X",
            Source::Linkedin => "LinkedIn",
            Source::Csis => "CSIS",
            Source::AllNews => "All news sources",
        }
    }

    pub fn profile(&self) -> RunProfile {
        match self {
            Source::SimplerGrants | Source::GrantsGov | Source::SamGov | Source::All => RunProfile::Grants,
            Source::News | Source::Twitter | Source::Linkedin | Source::Csis | Source::AllNews => {
                RunProfile::News
            }
        }
    }

    fn group(&self) -> Option<&'static [Source]> {
        match self {
            Source::All => Some(&Self::GRANTS),
            Source::AllNews => Some(&Self::NEWS),
            _ => None,
        }
    }

    pub fn is_group(&self) -> bool {
        self.group().is_some()
    }

    /// Expands the group selectors and drops repeats, keeping first-mention order.
    pub fn expand(selected: &[Source]) -> Vec<Source> {
        let mut out = Vec::new();
        for source in selected {
            let group: &[Source] = match source.group() {
                Some(group) => group,
                None => std::slice::from_ref(source),
            };
            for s in group {
                if !out.contains(s) {
                    out.push(*s);
                }
            }
        }
        out
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown source `{0}`")]
pub struct UnknownSource(pub String);

impl FromStr for Source {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "simpler_grants" => Ok(Source::SimplerGrants),
            "grants_gov" => Ok(Source::GrantsGov),
            "sam_gov" => Ok(Source::SamGov),
            "all" => Ok(Source::All),
            "news" => Ok(Source::News),
            "twitter" => Ok(Source::Twitter),
            "linkedin" => Ok(Source::Linkedin),
            "csis" => Ok(Source::Csis),
            "all_news" => Ok(Source::AllNews),
            other => Err(UnknownSource(other.to_string())),
        }
    }
}

/// Which kind of discovery a run performs. Decides the default sources and
/// how the report is named and written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunProfile {
    #[default]
    Grants,
    News,
}

impl RunProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunProfile::Grants => "grants",
            RunProfile::News => "news",
        }
    }

    pub fn default_sources(&self) -> Vec<Source> {
        match self {
            RunProfile::Grants => vec![Source::All],
            RunProfile::News => vec![Source::AllNews],
        }
    }

    pub fn report_prefix(&self) -> &'static str {
        match self {
            RunProfile::Grants => "Opportunity_Report",
            RunProfile::News => "Critical_Minerals_News",
        }
    }
}

impl fmt::Display for RunProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown profile `{0}`")]
pub struct UnknownProfile(pub String);

impl FromStr for RunProfile {
    type Err = UnknownProfile;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grants" => Ok(RunProfile::Grants),
            "news" => Ok(RunProfile::News),
            other => Err(UnknownProfile(other.to_string())),
        }
    }
}

/// Named step of a pipeline run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Fetch,
    Aggregate,
    Filter,
    Score,
    Report,
    Convert,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Fetch => "fetch",
            Phase::Aggregate => "aggregate",
            Phase::Filter => "filter",
            Phase::Score => "score",
            Phase::Report => "report",
            Phase::Convert => "convert",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Position in the lifecycle; terminal states share the top rank.
    pub fn rank(&self) -> u8 {
        match self {
            RunStatus::Pending => 0,
            RunStatus::Running => 1,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Completed,
    Failed,
}

/// Audit-trail entry appended once per executed phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub count: Option<usize>,
    pub duration_seconds: f64,
    pub message: Option<String>,
}

impl PhaseResult {
    pub fn completed(phase: Phase, count: usize, duration_seconds: f64, message: impl Into<String>) -> Self {
        Self {
            phase,
            status: PhaseStatus::Completed,
            count: Some(count),
            duration_seconds: round_seconds(duration_seconds),
            message: Some(message.into()),
        }
    }

    pub fn failed(phase: Phase, count: usize, duration_seconds: f64, message: impl Into<String>) -> Self {
        Self {
            phase,
            status: PhaseStatus::Failed,
            count: Some(count),
            duration_seconds: round_seconds(duration_seconds),
            message: Some(message.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == PhaseStatus::Failed
    }
}

fn round_seconds(secs: f64) -> f64 {
    (secs * 100.0).round() / 100.0
}

/// Snapshot of one pipeline execution as tracked by the run registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    #[serde(rename = "workflow_id")]
    pub id: String,
    pub status: RunStatus,
    pub current_phase: Option<Phase>,
    pub phases: Vec<PhaseResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_opportunities_found: Option<usize>,
    pub total_opportunities_scored: Option<usize>,
    pub report_path: Option<String>,
    pub converted_path: Option<String>,
    #[serde(default)]
    pub source_errors: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl WorkflowRun {
    pub fn pending(id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            status: RunStatus::Pending,
            current_phase: None,
            phases: Vec::new(),
            started_at,
            completed_at: None,
            total_opportunities_found: None,
            total_opportunities_scored: None,
            report_path: None,
            converted_path: None,
            source_errors: BTreeMap::new(),
            error: None,
        }
    }
}

pub const DEFAULT_DAYS_BACK: u32 = 7;
pub const MAX_DAYS_BACK: u32 = 30;

fn default_sources() -> Vec<Source> {
    vec![Source::All]
}

fn default_days_back() -> u32 {
    DEFAULT_DAYS_BACK
}

fn default_true() -> bool {
    true
}

/// Per-run knobs; anything left `None` falls back to the service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_sources")]
    pub sources: Vec<Source>,
    #[serde(default = "default_days_back")]
    pub days_back: u32,
    #[serde(default)]
    pub domains: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub generate_report: bool,
    #[serde(default = "default_true")]
    pub save_to_db: bool,
    #[serde(default = "default_true")]
    pub convert_report: bool,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub per_source_limit: Option<usize>,
    #[serde(default)]
    pub profile: RunProfile,
    /// Free-text search handed to every adapter; adapters fall back to
    /// their own default when absent.
    #[serde(default)]
    pub query: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            days_back: DEFAULT_DAYS_BACK,
            domains: None,
            generate_report: true,
            save_to_db: true,
            convert_report: true,
            batch_size: None,
            per_source_limit: None,
            profile: RunProfile::Grants,
            query: None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidRunConfig {
    #[error("days_back must be between 1 and {max}, got {got}")]
    DaysBack { got: u32, max: u32 },
    #[error("at least one source must be selected")]
    NoSources,
    #[error("batch_size must be at least 1")]
    BatchSize,
    #[error("source `{source_id}` is not available for the {profile} profile")]
    SourceProfile { source_id: Source, profile: RunProfile },
}

impl RunConfig {
    pub fn validate(&self, max_days_back: u32) -> Result<(), InvalidRunConfig> {
        if self.days_back < 1 || self.days_back > max_days_back {
            return Err(InvalidRunConfig::DaysBack {
                got: self.days_back,
                max: max_days_back,
            });
        }
        if self.sources.is_empty() {
            return Err(InvalidRunConfig::NoSources);
        }
        if self.batch_size == Some(0) {
            return Err(InvalidRunConfig::BatchSize);
        }
        if let Some(source) = self.sources.iter().find(|s| s.profile() != self.profile) {
            return Err(InvalidRunConfig::SourceProfile {
                source_id: *source,
                profile: self.profile,
            });
        }
        Ok(())
    }
}

/// Keywords handed to the filter stage for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeywordSet {
    pub domains: BTreeMap<String, Vec<String>>,
    pub negative: Vec<String>,
}

impl KeywordSet {
    pub fn positive_count(&self) -> usize {
        self.domains.values().map(Vec::len).sum()
    }
}
