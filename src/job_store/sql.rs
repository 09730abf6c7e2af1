//! SeaORM-backed job store over the `sync_jobs` table.
//!
//! The at-most-one-in-flight rule is enforced by the partial unique index
//! `idx_sync_jobs_repo_in_flight`; losing an insert race surfaces as a
//! unique violation and maps to [`JobStoreError::AlreadyRunning`].

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, RuntimeErr, Set, SqlErr,
};
use tracing::{debug, instrument};

use super::{Completion, JobStore};
use crate::error::{JobStoreError, SyncError};
use crate::models::sync_job::{self, ActiveModel as SyncJobActiveModel, Entity as SyncJobEntity};
use crate::types::{JobId, JobOutcome, JobState, RepoId, SyncJob, TriggerKind};

const IN_FLIGHT_UNIQUE_INDEX: &str = "idx_sync_jobs_repo_in_flight";
const NON_TERMINAL_STATES: [&str; 2] = ["queued", "running"];
const TERMINAL_STATES: [&str; 2] = ["completed", "errored"];

#[derive(Debug, Clone)]
pub struct SqlJobStore {
    db: DatabaseConnection,
}

impl SqlJobStore {
    /// Wraps a connection whose schema has been migrated.
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn find_job(&self, job_id: JobId) -> Result<sync_job::Model, JobStoreError> {
        SyncJobEntity::find_by_id(job_id)
            .one(&self.db)
            .await?
            .ok_or(JobStoreError::UnknownJob { job_id })
    }
}

#[async_trait]
impl JobStore for SqlJobStore {
    #[instrument(skip(self), fields(repo_id = %repo_id, trigger = trigger.as_str()))]
    async fn begin(
        &self,
        repo_id: RepoId,
        trigger: TriggerKind,
        requested_at: DateTime<Utc>,
    ) -> Result<SyncJob, JobStoreError> {
        let previous_attempt = SyncJobEntity::find()
            .filter(sync_job::Column::RepoId.eq(repo_id.0))
            .order_by_desc(sync_job::Column::Attempt)
            .one(&self.db)
            .await?
            .map_or(0, |model| model.attempt);

        let job = SyncJob::new(
            repo_id,
            previous_attempt.max(0) as u64 + 1,
            trigger,
            requested_at,
        );

        let model = SyncJobActiveModel {
            id: Set(job.id),
            repo_id: Set(repo_id.0),
            attempt: Set(job.attempt as i64),
            trigger: Set(trigger.as_str().to_string()),
            state: Set(JobState::Queued.as_str().to_string()),
            requested_at: Set(to_db_time(requested_at)),
            started_at: Set(None),
            finished_at: Set(None),
            changes: Set(None),
            error: Set(None),
            created_at: Set(to_db_time(Utc::now())),
        };

        match SyncJobEntity::insert(model)
            .exec_without_returning(&self.db)
            .await
        {
            Ok(_) => Ok(job),
            // A racing begin claimed either the in-flight slot or the attempt number.
            Err(err) if is_unique_violation(&err) => {
                debug!("In-flight job already exists; rejecting begin");
                Err(JobStoreError::AlreadyRunning { repo_id })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn mark_running(
        &self,
        job_id: JobId,
        started_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let result = SyncJobEntity::update_many()
            .col_expr(
                sync_job::Column::State,
                Expr::value(JobState::Running.as_str()),
            )
            .col_expr(
                sync_job::Column::StartedAt,
                Expr::value(to_db_time(started_at)),
            )
            .filter(sync_job::Column::Id.eq(job_id))
            .filter(sync_job::Column::State.eq(JobState::Queued.as_str()))
            .exec(&self.db)
            .await?;

        if result.rows_affected > 0 {
            return Ok(());
        }

        let model = self.find_job(job_id).await?;
        match parse_state(&model)? {
            JobState::Running => Ok(()),
            state => Err(JobStoreError::NotQueued { job_id, state }),
        }
    }

    #[instrument(skip(self, outcome), fields(job_id = %job_id, outcome = outcome.label()))]
    async fn complete(
        &self,
        job_id: JobId,
        outcome: &JobOutcome,
        finished_at: DateTime<Utc>,
    ) -> Result<Completion, JobStoreError> {
        let mut update = SyncJobEntity::update_many().col_expr(
            sync_job::Column::FinishedAt,
            Expr::value(to_db_time(finished_at)),
        );

        update = match outcome {
            JobOutcome::Completed(summary) => update
                .col_expr(
                    sync_job::Column::State,
                    Expr::value(JobState::Completed.as_str()),
                )
                .col_expr(
                    sync_job::Column::Changes,
                    Expr::value(summary.changes.min(i64::MAX as u64) as i64),
                ),
            JobOutcome::Errored(err) => {
                let error_json = serde_json::to_value(err).map_err(|e| {
                    JobStoreError::CorruptRecord {
                        job_id,
                        details: format!("failed to serialize error: {e}"),
                    }
                })?;
                update
                    .col_expr(
                        sync_job::Column::State,
                        Expr::value(JobState::Errored.as_str()),
                    )
                    .col_expr(sync_job::Column::Error, Expr::value(error_json))
            }
        };

        let result = update
            .filter(sync_job::Column::Id.eq(job_id))
            .filter(sync_job::Column::State.is_in(NON_TERMINAL_STATES))
            .exec(&self.db)
            .await?;

        if result.rows_affected > 0 {
            return Ok(Completion::Recorded);
        }

        // Distinguish a repeated report from an id we never issued.
        self.find_job(job_id).await?;
        debug!("Ignoring duplicate completion report");
        Ok(Completion::Duplicate)
    }

    async fn last_outcome(&self, repo_id: RepoId) -> Result<Option<SyncJob>, JobStoreError> {
        SyncJobEntity::find()
            .filter(sync_job::Column::RepoId.eq(repo_id.0))
            .filter(sync_job::Column::State.is_in(TERMINAL_STATES))
            .order_by_desc(sync_job::Column::Attempt)
            .one(&self.db)
            .await?
            .map(to_domain)
            .transpose()
    }

    async fn consecutive_failures(&self, repo_id: RepoId) -> Result<u32, JobStoreError> {
        let last_success_attempt = SyncJobEntity::find()
            .filter(sync_job::Column::RepoId.eq(repo_id.0))
            .filter(sync_job::Column::State.eq(JobState::Completed.as_str()))
            .order_by_desc(sync_job::Column::Attempt)
            .one(&self.db)
            .await?
            .map_or(0, |model| model.attempt);

        let failures = SyncJobEntity::find()
            .filter(sync_job::Column::RepoId.eq(repo_id.0))
            .filter(sync_job::Column::State.eq(JobState::Errored.as_str()))
            .filter(sync_job::Column::Attempt.gt(last_success_attempt))
            .count(&self.db)
            .await?;

        Ok(failures.min(u32::MAX as u64) as u32)
    }

    async fn in_flight(&self, repo_id: RepoId) -> Result<Option<SyncJob>, JobStoreError> {
        SyncJobEntity::find()
            .filter(sync_job::Column::RepoId.eq(repo_id.0))
            .filter(sync_job::Column::State.is_in(NON_TERMINAL_STATES))
            .one(&self.db)
            .await?
            .map(to_domain)
            .transpose()
    }

    async fn history(&self, repo_id: RepoId, limit: usize) -> Result<Vec<SyncJob>, JobStoreError> {
        SyncJobEntity::find()
            .filter(sync_job::Column::RepoId.eq(repo_id.0))
            .order_by_desc(sync_job::Column::Attempt)
            .limit(limit as u64)
            .all(&self.db)
            .await?
            .into_iter()
            .map(to_domain)
            .collect()
    }

    #[instrument(skip(self, error))]
    async fn abandon_in_flight(
        &self,
        error: &SyncError,
        finished_at: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let error_json = serde_json::to_value(error)
            .map_err(|e| JobStoreError::Database(format!("failed to serialize error: {e}")))?;

        let result = SyncJobEntity::update_many()
            .col_expr(
                sync_job::Column::State,
                Expr::value(JobState::Errored.as_str()),
            )
            .col_expr(
                sync_job::Column::FinishedAt,
                Expr::value(to_db_time(finished_at)),
            )
            .col_expr(sync_job::Column::Error, Expr::value(error_json))
            .filter(sync_job::Column::State.is_in(NON_TERMINAL_STATES))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected)
    }
}

fn parse_state(model: &sync_job::Model) -> Result<JobState, JobStoreError> {
    model
        .state
        .parse()
        .map_err(|details| JobStoreError::CorruptRecord {
            job_id: model.id,
            details,
        })
}

fn to_domain(model: sync_job::Model) -> Result<SyncJob, JobStoreError> {
    let state = parse_state(&model)?;
    let trigger: TriggerKind =
        model
            .trigger
            .parse()
            .map_err(|details| JobStoreError::CorruptRecord {
                job_id: model.id,
                details,
            })?;
    let error = model
        .error
        .map(serde_json::from_value::<SyncError>)
        .transpose()
        .map_err(|e| JobStoreError::CorruptRecord {
            job_id: model.id,
            details: format!("unreadable error detail: {e}"),
        })?;

    Ok(SyncJob {
        id: model.id,
        repo_id: RepoId(model.repo_id),
        attempt: model.attempt.max(0) as u64,
        trigger,
        state,
        requested_at: model.requested_at.with_timezone(&Utc),
        started_at: model.started_at.map(|at| at.with_timezone(&Utc)),
        finished_at: model.finished_at.map(|at| at.with_timezone(&Utc)),
        changes: model.changes.map(|changes| changes.max(0) as u64),
        error,
    })
}

fn is_unique_violation(err: &DbErr) -> bool {
    if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
        return true;
    }

    match err {
        DbErr::Exec(RuntimeErr::SqlxError(sea_orm::SqlxError::Database(db_err)))
        | DbErr::Query(RuntimeErr::SqlxError(sea_orm::SqlxError::Database(db_err))) => {
            let code = db_err.code();
            let constraint = db_err.constraint();
            matches!(constraint, Some(IN_FLIGHT_UNIQUE_INDEX))
                || matches!(code.as_deref(), Some("23505") | Some("2067") | Some("1555"))
        }
        _ => false,
    }
}

fn to_db_time(dt: DateTime<Utc>) -> DateTime<FixedOffset> {
    dt.fixed_offset()
}
