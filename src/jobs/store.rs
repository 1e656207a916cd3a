use crate::model::{JobStatus, Phase, PhaseRecord, PhaseStatus, ResearchJob};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-memory store of research jobs.
///
/// Concurrency contract: one writer per job (the orchestrator task that
/// owns it), any number of readers. Reads return snapshot clones and never
/// observe a half-applied update; every phase transition is visible to
/// readers before the phase does any meaningful work, because `update`
/// returns only after the write lock is released.
#[derive(Clone, Default)]
pub struct JobStore {
    inner: Arc<RwLock<HashMap<Uuid, ResearchJob>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: ResearchJob) -> Uuid {
        let id = job.id;
        self.inner.write().await.insert(id, job);
        id
    }

    /// Snapshot clone of one job, safe to serialize outside any lock.
    pub async fn snapshot(&self, id: Uuid) -> Option<ResearchJob> {
        self.inner.read().await.get(&id).cloned()
    }

    /// Apply a mutation to one job. Returns false if the job is gone
    /// (e.g. swept by TTL while its orchestrator was still running).
    pub async fn update<F>(&self, id: Uuid, mutate: F) -> bool
    where
        F: FnOnce(&mut ResearchJob),
    {
        let mut jobs = self.inner.write().await;
        match jobs.get_mut(&id) {
            Some(job) => {
                mutate(job);
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: Uuid) -> Option<ResearchJob> {
        self.inner.write().await.remove(&id)
    }

    /// Append a running phase record and advance the job status. Published
    /// before the caller starts the phase's work.
    pub async fn begin_phase(&self, id: Uuid, phase: Phase, message: &str) {
        let message = message.to_string();
        self.update(id, |job| {
            job.status = JobStatus::Running;
            job.message = message;
            job.phases.push(PhaseRecord {
                phase,
                status: PhaseStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
                details: serde_json::Value::Null,
                error: None,
            });
        })
        .await;
        tracing::info!(job_id = %id, phase = %phase, "phase started");
    }

    /// Close out the most recent record for `phase`. Status may only move
    /// running → done/partial/failed; records are otherwise append-only.
    pub async fn finish_phase(
        &self,
        id: Uuid,
        phase: Phase,
        status: PhaseStatus,
        details: serde_json::Value,
        error: Option<String>,
    ) {
        self.update(id, |job| {
            if let Some(record) = job
                .phases
                .iter_mut()
                .rev()
                .find(|r| r.phase == phase && r.status == PhaseStatus::Running)
            {
                record.status = status;
                record.finished_at = Some(Utc::now());
                record.details = details;
                record.error = error;
            }
        })
        .await;
        tracing::info!(job_id = %id, phase = %phase, ?status, "phase finished");
    }

    /// Drop finished jobs older than `ttl`. Running jobs are never swept.
    pub async fn sweep_expired(&self, ttl: Duration) -> usize {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(1));
        let mut jobs = self.inner.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.is_finished() && job.finished_at.map(|at| at < cutoff).unwrap_or(false))
        });
        before - jobs.len()
    }

    /// Background sweeper in the style of a worker tick loop.
    pub fn spawn_sweeper(&self, ttl: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let swept = store.sweep_expired(ttl).await;
                if swept > 0 {
                    tracing::info!(swept, "archived expired jobs");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TargetField;

    fn job() -> ResearchJob {
        ResearchJob::new(
            "Acme".to_string(),
            "https://acme.example".to_string(),
            TargetField::all(),
        )
    }

    #[tokio::test]
    async fn phase_transition_is_visible_before_work_begins() {
        let store = JobStore::new();
        let id = store.insert(job()).await;

        store
            .begin_phase(id, Phase::LinkDiscovery, "discovering links")
            .await;

        // A concurrent reader polling right now must already see it.
        let snapshot = store.snapshot(id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Running);
        assert_eq!(snapshot.current_phase(), Some(Phase::LinkDiscovery));
        assert_eq!(snapshot.phases[0].status, PhaseStatus::Running);
    }

    #[tokio::test]
    async fn finish_phase_closes_only_the_running_record() {
        let store = JobStore::new();
        let id = store.insert(job()).await;

        store.begin_phase(id, Phase::LinkDiscovery, "discovering").await;
        store
            .finish_phase(
                id,
                Phase::LinkDiscovery,
                PhaseStatus::Done,
                serde_json::json!({"candidates": 42}),
                None,
            )
            .await;
        store.begin_phase(id, Phase::PageSelection, "selecting").await;

        let snapshot = store.snapshot(id).await.unwrap();
        assert_eq!(snapshot.phases.len(), 2);
        assert_eq!(snapshot.phases[0].status, PhaseStatus::Done);
        assert_eq!(snapshot.phases[0].details["candidates"], 42);
        assert!(snapshot.phases[0].finished_at.is_some());
        assert_eq!(snapshot.phases[1].status, PhaseStatus::Running);
    }

    #[tokio::test]
    async fn snapshots_are_isolated_from_later_writes() {
        let store = JobStore::new();
        let id = store.insert(job()).await;

        let before = store.snapshot(id).await.unwrap();
        store.begin_phase(id, Phase::LinkDiscovery, "discovering").await;

        assert!(before.phases.is_empty());
        assert_eq!(store.snapshot(id).await.unwrap().phases.len(), 1);
    }

    #[tokio::test]
    async fn sweeper_drops_only_finished_jobs() {
        let store = JobStore::new();
        let running_id = store.insert(job()).await;

        let mut done = job();
        done.status = JobStatus::Completed;
        done.finished_at = Some(Utc::now() - ChronoDuration::hours(2));
        let done_id = store.insert(done).await;

        let swept = store.sweep_expired(Duration::from_secs(3600)).await;
        assert_eq!(swept, 1);
        assert!(store.snapshot(running_id).await.is_some());
        assert!(store.snapshot(done_id).await.is_none());
    }
}
