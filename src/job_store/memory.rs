//! In-process job store, used by tests and `REPO_UPDATER_JOB_STORE=memory`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Completion, JobStore};
use crate::error::{JobStoreError, SyncError};
use crate::types::{JobId, JobOutcome, JobState, RepoId, SyncJob, TriggerKind};

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, SyncJob>,
    /// Job ids per repository in attempt order.
    by_repo: HashMap<RepoId, Vec<JobId>>,
    in_flight: HashMap<RepoId, JobId>,
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }
}

impl MemoryState {
    fn repo_jobs(&self, repo_id: RepoId) -> impl DoubleEndedIterator<Item = &SyncJob> {
        self.by_repo
            .get(&repo_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.jobs.get(id))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn begin(
        &self,
        repo_id: RepoId,
        trigger: TriggerKind,
        requested_at: DateTime<Utc>,
    ) -> Result<SyncJob, JobStoreError> {
        self.with_state(|state| {
            if state.in_flight.contains_key(&repo_id) {
                return Err(JobStoreError::AlreadyRunning { repo_id });
            }

            let attempt = state.by_repo.get(&repo_id).map_or(0, Vec::len) as u64 + 1;
            let job = SyncJob::new(repo_id, attempt, trigger, requested_at);

            state.in_flight.insert(repo_id, job.id);
            state.by_repo.entry(repo_id).or_default().push(job.id);
            state.jobs.insert(job.id, job.clone());
            Ok(job)
        })
    }

    async fn mark_running(
        &self,
        job_id: JobId,
        started_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        self.with_state(|state| {
            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or(JobStoreError::UnknownJob { job_id })?;

            match job.state {
                JobState::Queued => {
                    job.state = JobState::Running;
                    job.started_at = Some(started_at);
                    Ok(())
                }
                JobState::Running => Ok(()),
                other => Err(JobStoreError::NotQueued {
                    job_id,
                    state: other,
                }),
            }
        })
    }

    async fn complete(
        &self,
        job_id: JobId,
        outcome: &JobOutcome,
        finished_at: DateTime<Utc>,
    ) -> Result<Completion, JobStoreError> {
        self.with_state(|state| {
            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or(JobStoreError::UnknownJob { job_id })?;

            if job.state.is_terminal() {
                return Ok(Completion::Duplicate);
            }

            job.finished_at = Some(finished_at);
            match outcome {
                JobOutcome::Completed(summary) => {
                    job.state = JobState::Completed;
                    job.changes = Some(summary.changes);
                }
                JobOutcome::Errored(err) => {
                    job.state = JobState::Errored;
                    job.error = Some(err.clone());
                }
            }

            let repo_id = job.repo_id;
            if state.in_flight.get(&repo_id) == Some(&job_id) {
                state.in_flight.remove(&repo_id);
            }
            Ok(Completion::Recorded)
        })
    }

    async fn last_outcome(&self, repo_id: RepoId) -> Result<Option<SyncJob>, JobStoreError> {
        Ok(self.with_state(|state| {
            state
                .repo_jobs(repo_id)
                .rev()
                .find(|job| job.state.is_terminal())
                .cloned()
        }))
    }

    async fn consecutive_failures(&self, repo_id: RepoId) -> Result<u32, JobStoreError> {
        Ok(self.with_state(|state| {
            state
                .repo_jobs(repo_id)
                .rev()
                .filter(|job| job.state.is_terminal())
                .take_while(|job| job.state == JobState::Errored)
                .count() as u32
        }))
    }

    async fn in_flight(&self, repo_id: RepoId) -> Result<Option<SyncJob>, JobStoreError> {
        Ok(self.with_state(|state| {
            state
                .in_flight
                .get(&repo_id)
                .and_then(|id| state.jobs.get(id))
                .cloned()
        }))
    }

    async fn history(&self, repo_id: RepoId, limit: usize) -> Result<Vec<SyncJob>, JobStoreError> {
        Ok(self.with_state(|state| {
            state
                .repo_jobs(repo_id)
                .rev()
                .take(limit)
                .cloned()
                .collect()
        }))
    }

    async fn abandon_in_flight(
        &self,
        error: &SyncError,
        finished_at: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        Ok(self.with_state(|state| {
            let in_flight: Vec<JobId> = state.in_flight.drain().map(|(_, id)| id).collect();
            for job_id in &in_flight {
                if let Some(job) = state.jobs.get_mut(job_id) {
                    job.state = JobState::Errored;
                    job.finished_at = Some(finished_at);
                    job.error = Some(error.clone());
                }
            }
            in_flight.len() as u64
        }))
    }
}
