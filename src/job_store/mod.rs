//! # Job Store
//!
//! Durable record of sync attempts. Each repository has at most one
//! non-terminal job at a time and terminal jobs are never mutated; the next
//! attempt appends a new record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{JobStoreError, SyncError};
use crate::types::{JobId, JobOutcome, RepoId, SyncJob, TriggerKind};

pub mod memory;
pub mod sql;

pub use memory::MemoryJobStore;
pub use sql::SqlJobStore;

/// Result of reporting a job's completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// First report for the job; the outcome was persisted.
    Recorded,
    /// The job was already terminal; the report was ignored.
    Duplicate,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Append a `queued` job for the repository.
    ///
    /// Atomic with respect to other callers: while a non-terminal job exists
    /// for `repo_id` every further call fails with
    /// [`JobStoreError::AlreadyRunning`].
    async fn begin(
        &self,
        repo_id: RepoId,
        trigger: TriggerKind,
        requested_at: DateTime<Utc>,
    ) -> Result<SyncJob, JobStoreError>;

    /// Move a `queued` job to `running`.
    async fn mark_running(
        &self,
        job_id: JobId,
        started_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// Record the terminal outcome. Only the first report per job counts.
    async fn complete(
        &self,
        job_id: JobId,
        outcome: &JobOutcome,
        finished_at: DateTime<Utc>,
    ) -> Result<Completion, JobStoreError>;

    /// Most recent terminal job for the repository.
    async fn last_outcome(&self, repo_id: RepoId) -> Result<Option<SyncJob>, JobStoreError>;

    /// Errored jobs since the last completed one.
    async fn consecutive_failures(&self, repo_id: RepoId) -> Result<u32, JobStoreError>;

    /// The repository's non-terminal job, if any.
    async fn in_flight(&self, repo_id: RepoId) -> Result<Option<SyncJob>, JobStoreError>;

    /// Up to `limit` jobs, newest first.
    async fn history(&self, repo_id: RepoId, limit: usize) -> Result<Vec<SyncJob>, JobStoreError>;

    /// Fail every non-terminal job with `error`, returning how many were closed.
    ///
    /// Called once at startup: jobs left in flight by a previous process would
    /// otherwise block their repositories forever.
    async fn abandon_in_flight(
        &self,
        error: &SyncError,
        finished_at: DateTime<Utc>,
    ) -> Result<u64, JobStoreError>;
}
