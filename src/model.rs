use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// The business facts a research job tries to extract.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum TargetField {
    Industry,
    FoundingYear,
    Location,
    Leadership,
    Products,
    SocialLinks,
    CompanySize,
    Description,
}

impl TargetField {
    /// Default field set requested when the caller does not narrow it down.
    pub fn all() -> Vec<TargetField> {
        vec![
            TargetField::Industry,
            TargetField::FoundingYear,
            TargetField::Location,
            TargetField::Leadership,
            TargetField::Products,
            TargetField::SocialLinks,
            TargetField::CompanySize,
            TargetField::Description,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetField::Industry => "industry",
            TargetField::FoundingYear => "founding_year",
            TargetField::Location => "location",
            TargetField::Leadership => "leadership",
            TargetField::Products => "products",
            TargetField::SocialLinks => "social_links",
            TargetField::CompanySize => "company_size",
            TargetField::Description => "description",
        }
    }

    pub fn from_name(name: &str) -> Option<TargetField> {
        match name {
            "industry" => Some(TargetField::Industry),
            "founding_year" => Some(TargetField::FoundingYear),
            "location" => Some(TargetField::Location),
            "leadership" => Some(TargetField::Leadership),
            "products" => Some(TargetField::Products),
            "social_links" => Some(TargetField::SocialLinks),
            "company_size" => Some(TargetField::CompanySize),
            "description" => Some(TargetField::Description),
            _ => None,
        }
    }
}

impl std::fmt::Display for TargetField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four sequential stages of a research job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    LinkDiscovery,
    PageSelection,
    ContentExtraction,
    AiAnalysis,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::LinkDiscovery => "link_discovery",
            Phase::PageSelection => "page_selection",
            Phase::ContentExtraction => "content_extraction",
            Phase::AiAnalysis => "ai_analysis",
        }
    }

    /// Progress percentage reported when this phase starts.
    pub fn progress_percent(&self) -> u8 {
        match self {
            Phase::LinkDiscovery => 10,
            Phase::PageSelection => 30,
            Phase::ContentExtraction => 45,
            Phase::AiAnalysis => 75,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Running,
    Done,
    /// Finished, but some of its work was lost to failures (e.g. AI calls
    /// after the circuit opened).
    Partial,
    Failed,
}

/// One entry in a job's append-only phase log.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Phase-specific counts and scores (candidates found, pages fetched, …)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Where a candidate URL came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    Sitemap,
    Robots,
    Link,
    Seed,
}

/// A discovered page URL, not yet confirmed to contain useful content.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CandidateUrl {
    pub url: String,
    pub source: DiscoverySource,
    /// Heuristic relevance score assigned by the page selector
    pub score: f64,
    /// Target fields this URL is likely to satisfy, judged from its path
    pub likely_fields: Vec<TargetField>,
}

impl CandidateUrl {
    pub fn new(url: impl Into<String>, source: DiscoverySource) -> Self {
        Self {
            url: url.into(),
            source,
            score: 0.0,
            likely_fields: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Primary,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PageOutcome {
    Success,
    Failed,
    /// Never started because the fetch-phase deadline passed first.
    /// Not an error and not counted against the success ratio.
    Skipped,
}

/// Result of fetching and extracting one page. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PageResult {
    pub url: String,
    pub outcome: PageOutcome,
    /// Extracted prose; empty unless outcome is `success`
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<ExtractionMethod>,
    pub content_length: usize,
    pub fetch_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PageResult {
    pub fn skipped(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            outcome: PageOutcome::Skipped,
            text: String::new(),
            method: None,
            content_length: 0,
            fetch_ms: 0,
            error: None,
        }
    }

    pub fn failed(url: impl Into<String>, fetch_ms: u64, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            outcome: PageOutcome::Failed,
            text: String::new(),
            method: None,
            content_length: 0,
            fetch_ms,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == PageOutcome::Success
    }
}

/// One extracted fact with provenance.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FieldExtraction {
    pub field: TargetField,
    pub value: String,
    /// Model-reported confidence, clamped to 0..=1
    pub confidence: f64,
    /// Pages the value was read from; empty when `inferred` is true
    pub source_urls: Vec<String>,
    /// True when the model produced the value without citing a fetched page
    #[serde(default)]
    pub inferred: bool,
}

/// Token/cost accounting across all AI calls in a job.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, ToSchema)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_usd += other.cost_usd;
    }
}

/// Final output record of a research job.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CompanyIntelligence {
    pub company_name: String,
    pub website_url: String,
    pub fields: Vec<FieldExtraction>,
    /// fields extracted / fields requested
    pub completeness: f64,
    pub pages_attempted: usize,
    pub pages_succeeded: usize,
    pub pages_skipped: usize,
    pub usage: TokenUsage,
    /// Per-page provenance retained after the page text is dropped
    pub page_provenance: Vec<PageProvenance>,
}

/// Slimmed-down page result kept on the final record.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PageProvenance {
    pub url: String,
    pub outcome: PageOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<ExtractionMethod>,
    pub content_length: usize,
    pub fetch_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&PageResult> for PageProvenance {
    fn from(page: &PageResult) -> Self {
        Self {
            url: page.url.clone(),
            outcome: page.outcome,
            method: page.method,
            content_length: page.content_length,
            fetch_ms: page.fetch_ms,
            error: page.error.clone(),
        }
    }
}

/// One end-to-end research run for a single company.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResearchJob {
    pub id: Uuid,
    pub company_name: String,
    pub seed_url: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub phases: Vec<PhaseRecord>,
    pub requested_fields: Vec<TargetField>,
    pub usage: TokenUsage,
    /// Human-readable description of what the job is doing right now
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CompanyIntelligence>,
}

impl ResearchJob {
    pub fn new(company_name: String, seed_url: String, requested_fields: Vec<TargetField>) -> Self {
        Self {
            id: Uuid::new_v4(),
            company_name,
            seed_url,
            status: JobStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            phases: Vec::new(),
            requested_fields,
            usage: TokenUsage::default(),
            message: "queued".to_string(),
            error: None,
            result: None,
        }
    }

    pub fn current_phase(&self) -> Option<Phase> {
        self.phases.last().map(|record| record.phase)
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Progress percentage derived from status and the latest phase.
    pub fn progress_percent(&self) -> u8 {
        match self.status {
            JobStatus::Pending => 0,
            JobStatus::Running => self
                .current_phase()
                .map(|phase| phase.progress_percent())
                .unwrap_or(5),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_field_round_trips_through_name() {
        for field in TargetField::all() {
            assert_eq!(TargetField::from_name(field.as_str()), Some(field));
        }
        assert_eq!(TargetField::from_name("no_such_field"), None);
    }

    #[test]
    fn new_job_is_pending_with_no_phases() {
        let job = ResearchJob::new(
            "Acme".to_string(),
            "https://acme.example".to_string(),
            TargetField::all(),
        );
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.phases.is_empty());
        assert_eq!(job.progress_percent(), 0);
        assert!(!job.is_finished());
    }

    #[test]
    fn skipped_page_is_not_a_success() {
        let page = PageResult::skipped("https://acme.example/late");
        assert!(!page.is_success());
        assert!(page.error.is_none());
    }
}
