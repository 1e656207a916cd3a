use crate::ai::GuardedAiClient;
use crate::config::ResearchConfig;
use crate::error::PipelineError;
use crate::jobs::JobStore;
use crate::model::{
    CompanyIntelligence, FieldExtraction, JobStatus, PageOutcome, PageProvenance, PageResult,
    Phase, PhaseStatus, TokenUsage,
};
use crate::pipeline::analysis::AiAnalyzer;
use crate::pipeline::discovery::LinkDiscoverer;
use crate::pipeline::fetch::FetchPool;
use crate::pipeline::selection::PageSelector;
use chrono::Utc;
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;
use uuid::Uuid;

/// Extra time granted to in-flight AI calls once the job deadline passes.
const ANALYSIS_GRACE: Duration = Duration::from_secs(10);

/// Drives the four phases of a research job in order and owns the
/// job-level deadline. The orchestrator is the only writer of its job's
/// state; progress readers poll the store concurrently.
pub struct Orchestrator {
    store: JobStore,
    client: Client,
    ai: Option<Arc<GuardedAiClient>>,
    config: ResearchConfig,
}

/// Everything gathered so far, carried across phases so a timeout or
/// cancellation can still produce an auditable record.
#[derive(Default)]
struct Gathered {
    pages: Vec<PageResult>,
    fields: Vec<FieldExtraction>,
    usage: TokenUsage,
    analysis_partial: bool,
}

impl Orchestrator {
    pub fn new(
        store: JobStore,
        client: Client,
        ai: Option<Arc<GuardedAiClient>>,
        config: ResearchConfig,
    ) -> Self {
        Self {
            store,
            client,
            ai,
            config,
        }
    }

    /// Run one job to completion. Never panics and never returns an error:
    /// every outcome, including timeout and cancellation, lands in the
    /// store as a terminal job state.
    #[tracing::instrument(skip(self, cancelled), fields(job_id = %job_id))]
    pub async fn run(&self, job_id: Uuid, cancelled: Arc<AtomicBool>) {
        let Some(job) = self.store.snapshot(job_id).await else {
            tracing::error!("job vanished before the orchestrator started");
            return;
        };
        let seed_url = match Url::parse(&job.seed_url) {
            Ok(url) => url,
            Err(e) => {
                self.fail(job_id, PipelineError::FatalDiscovery(format!(
                    "invalid seed URL {}: {}",
                    job.seed_url, e
                )), Gathered::default(), &job.company_name, &job.seed_url)
                .await;
                return;
            }
        };

        let deadline = Instant::now() + self.config.job_timeout();
        let mut gathered = Gathered::default();

        // ---- Phase 1: link discovery ----
        self.store
            .begin_phase(job_id, Phase::LinkDiscovery, "discovering candidate pages")
            .await;
        let discoverer = LinkDiscoverer::new(self.client.clone(), &self.config);
        let candidates = match self
            .phase_bounded(deadline, Duration::ZERO, discoverer.discover(&seed_url))
            .await
        {
            PhaseResult::Done(Ok(candidates)) => {
                self.store
                    .finish_phase(
                        job_id,
                        Phase::LinkDiscovery,
                        PhaseStatus::Done,
                        serde_json::json!({ "candidates": candidates.len() }),
                        None,
                    )
                    .await;
                candidates
            }
            PhaseResult::Done(Err(e)) => {
                self.store
                    .finish_phase(
                        job_id,
                        Phase::LinkDiscovery,
                        PhaseStatus::Failed,
                        serde_json::Value::Null,
                        Some(e.to_string()),
                    )
                    .await;
                self.fail(job_id, e, gathered, &job.company_name, &job.seed_url)
                    .await;
                return;
            }
            PhaseResult::TimedOut => {
                self.timeout(job_id, Phase::LinkDiscovery, gathered, &job).await;
                return;
            }
        };
        if self.check_cancelled(job_id, &cancelled, &gathered, &job).await {
            return;
        }

        // ---- Phase 2: page selection ----
        self.store
            .begin_phase(job_id, Phase::PageSelection, "ranking candidate pages")
            .await;
        let selector = PageSelector::new(self.config.max_pages_to_fetch);
        let ranked = selector.rank(candidates, &job.requested_fields);
        let heuristic_count = ranked.len();
        // The AI pass is optional and strictly additive; skip it when the
        // deadline is close enough that fetching matters more.
        let remaining = deadline.saturating_duration_since(Instant::now());
        let (selected, ai_reranked) = match (&self.ai, self.config.ai_rerank) {
            (Some(ai), true) if remaining > Duration::from_secs(20) => {
                let reranked = selector
                    .ai_rerank(ai, ranked, &job.requested_fields)
                    .await;
                let changed = reranked.len() != heuristic_count;
                (reranked, changed)
            }
            _ => (ranked, false),
        };
        self.store
            .finish_phase(
                job_id,
                Phase::PageSelection,
                PhaseStatus::Done,
                serde_json::json!({ "selected": selected.len(), "ai_pruned": ai_reranked }),
                None,
            )
            .await;
        if self.check_cancelled(job_id, &cancelled, &gathered, &job).await {
            return;
        }

        // ---- Phase 3: content extraction ----
        self.store
            .begin_phase(job_id, Phase::ContentExtraction, "fetching and extracting pages")
            .await;
        let urls: Vec<String> = selected.iter().map(|c| c.url.clone()).collect();
        let pool = FetchPool::new(self.client.clone(), &self.config);
        // The pool polices the deadline itself by skipping unstarted URLs,
        // so the outer bound only catches a wedged worker.
        match self
            .phase_bounded(
                deadline,
                Duration::from_secs(5),
                pool.fetch_all(urls, deadline, Arc::clone(&cancelled)),
            )
            .await
        {
            PhaseResult::Done(pages) => {
                gathered.pages = pages;
                let succeeded = gathered.pages.iter().filter(|p| p.is_success()).count();
                let skipped = gathered
                    .pages
                    .iter()
                    .filter(|p| p.outcome == PageOutcome::Skipped)
                    .count();
                let fallback = gathered
                    .pages
                    .iter()
                    .filter(|p| p.method == Some(crate::model::ExtractionMethod::Fallback))
                    .count();
                self.store
                    .finish_phase(
                        job_id,
                        Phase::ContentExtraction,
                        PhaseStatus::Done,
                        serde_json::json!({
                            "attempted": gathered.pages.len() - skipped,
                            "succeeded": succeeded,
                            "skipped": skipped,
                            "fallback_extractions": fallback,
                        }),
                        None,
                    )
                    .await;
            }
            PhaseResult::TimedOut => {
                self.timeout(job_id, Phase::ContentExtraction, gathered, &job).await;
                return;
            }
        }
        if self.check_cancelled(job_id, &cancelled, &gathered, &job).await {
            return;
        }

        // ---- Phase 4: AI analysis ----
        self.store
            .begin_phase(job_id, Phase::AiAnalysis, "synthesizing company facts")
            .await;
        match &self.ai {
            Some(ai) => {
                let analyzer = AiAnalyzer::new(ai);
                match self
                    .phase_bounded(
                        deadline,
                        ANALYSIS_GRACE,
                        analyzer.analyze(&job.company_name, &gathered.pages, &job.requested_fields),
                    )
                    .await
                {
                    PhaseResult::Done(outcome) => {
                        gathered.fields = outcome.fields;
                        gathered.usage.add(outcome.usage);
                        gathered.analysis_partial = outcome.partial;
                        let status = if outcome.partial {
                            PhaseStatus::Partial
                        } else {
                            PhaseStatus::Done
                        };
                        self.store
                            .finish_phase(
                                job_id,
                                Phase::AiAnalysis,
                                status,
                                serde_json::json!({
                                    "fields_extracted": gathered.fields.len(),
                                    "calls_made": outcome.calls_made,
                                    "calls_failed": outcome.calls_failed,
                                    "parse_failures": outcome.parse_failures,
                                }),
                                None,
                            )
                            .await;
                    }
                    PhaseResult::TimedOut => {
                        // In-flight call results past the grace window are
                        // discarded; earlier phases' data survives.
                        self.timeout(job_id, Phase::AiAnalysis, gathered, &job).await;
                        return;
                    }
                }
            }
            None => {
                tracing::warn!("no AI backend configured, skipping analysis");
                self.store
                    .finish_phase(
                        job_id,
                        Phase::AiAnalysis,
                        PhaseStatus::Failed,
                        serde_json::Value::Null,
                        Some("no AI backend configured".to_string()),
                    )
                    .await;
                gathered.analysis_partial = true;
            }
        }

        // ---- Finalize ----
        let intelligence = build_record(
            &job.company_name,
            &job.seed_url,
            &job.requested_fields,
            &gathered,
        );
        let completeness = intelligence.completeness;
        self.store
            .update(job_id, |job| {
                job.status = JobStatus::Completed;
                job.finished_at = Some(Utc::now());
                job.usage = intelligence.usage;
                job.message = format!(
                    "completed: {}/{} fields extracted",
                    intelligence.fields.len(),
                    job.requested_fields.len()
                );
                job.result = Some(intelligence);
            })
            .await;
        tracing::info!(job_id = %job_id, completeness, "research job completed");
    }

    /// Bound a phase future by whatever remains of the job deadline plus
    /// `grace`. A deadline that already passed yields `TimedOut` without
    /// polling the future.
    async fn phase_bounded<T>(
        &self,
        deadline: Instant,
        grace: Duration,
        work: impl std::future::Future<Output = T>,
    ) -> PhaseResult<T> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() && grace.is_zero() {
            return PhaseResult::TimedOut;
        }
        match tokio::time::timeout(remaining + grace, work).await {
            Ok(value) => PhaseResult::Done(value),
            Err(_) => PhaseResult::TimedOut,
        }
    }

    async fn check_cancelled(
        &self,
        job_id: Uuid,
        cancelled: &AtomicBool,
        gathered: &Gathered,
        job: &crate::model::ResearchJob,
    ) -> bool {
        if !cancelled.load(Ordering::Relaxed) {
            return false;
        }
        tracing::info!(job_id = %job_id, "job cancelled");
        let record = build_record(
            &job.company_name,
            &job.seed_url,
            &job.requested_fields,
            gathered,
        );
        self.store
            .update(job_id, |job| {
                job.status = JobStatus::Cancelled;
                job.finished_at = Some(Utc::now());
                job.message = "cancelled by caller".to_string();
                job.result = Some(record);
            })
            .await;
        true
    }

    async fn timeout(
        &self,
        job_id: Uuid,
        phase: Phase,
        gathered: Gathered,
        job: &crate::model::ResearchJob,
    ) {
        let error = PipelineError::JobTimeout(phase.to_string());
        self.store
            .finish_phase(
                job_id,
                phase,
                PhaseStatus::Failed,
                serde_json::Value::Null,
                Some(error.to_string()),
            )
            .await;
        self.fail(job_id, error, gathered, &job.company_name, &job.seed_url)
            .await;
    }

    /// Terminal failure. Partial results gathered before the failure stay
    /// on the record.
    async fn fail(
        &self,
        job_id: Uuid,
        error: PipelineError,
        gathered: Gathered,
        company_name: &str,
        seed_url: &str,
    ) {
        tracing::warn!(job_id = %job_id, "research job failed: {}", error);
        let requested = self
            .store
            .snapshot(job_id)
            .await
            .map(|j| j.requested_fields)
            .unwrap_or_default();
        let record = build_record(company_name, seed_url, &requested, &gathered);
        self.store
            .update(job_id, |job| {
                job.status = JobStatus::Failed;
                job.finished_at = Some(Utc::now());
                job.error = Some(error.to_string());
                job.message = error.to_string();
                job.usage = record.usage;
                job.result = Some(record);
            })
            .await;
    }
}

enum PhaseResult<T> {
    Done(T),
    TimedOut,
}

/// Assemble the final record from whatever was gathered. Also used for
/// failed and cancelled jobs, where it captures the partial state.
fn build_record(
    company_name: &str,
    seed_url: &str,
    requested: &[crate::model::TargetField],
    gathered: &Gathered,
) -> CompanyIntelligence {
    let attempted = gathered
        .pages
        .iter()
        .filter(|p| p.outcome != PageOutcome::Skipped)
        .count();
    let succeeded = gathered.pages.iter().filter(|p| p.is_success()).count();
    let skipped = gathered.pages.len() - attempted;
    let completeness = if requested.is_empty() {
        0.0
    } else {
        gathered.fields.len() as f64 / requested.len() as f64
    };

    CompanyIntelligence {
        company_name: company_name.to_string(),
        website_url: seed_url.to_string(),
        fields: gathered.fields.clone(),
        completeness,
        pages_attempted: attempted,
        pages_succeeded: succeeded,
        pages_skipped: skipped,
        usage: gathered.usage,
        page_provenance: gathered.pages.iter().map(PageProvenance::from).collect(),
    }
}
