//! Core domain types shared by the scheduler, the job stores and the strategies.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;

/// Stable repository identifier assigned by the external source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(pub i64);

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Origin-qualified repository name, e.g. `github.com/acme/widgets` or `npm/left-pad`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoName(String);

impl RepoName {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RepoName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Classification of a repository's origin; selects the sync strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    /// Conventional git remote.
    Git,
    /// Package published to an npm-compatible registry.
    Npm,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::Git, Family::Npm];

    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Git => "git",
            Family::Npm => "npm",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Family {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "git" => Ok(Family::Git),
            "npm" => Ok(Family::Npm),
            other => Err(format!("unknown repository family '{other}'")),
        }
    }
}

/// Why a sync job was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// User traffic asked for the repository to be refreshed now.
    Manual,
    /// The repository's due time elapsed.
    Auto,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Auto => "auto",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerKind::Manual),
            "auto" => Ok(TriggerKind::Auto),
            other => Err(format!("unknown trigger kind '{other}'")),
        }
    }
}

/// Lifecycle of a single sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Errored,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Errored => "errored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Errored)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "errored" => Ok(JobState::Errored),
            other => Err(format!("unknown job state '{other}'")),
        }
    }
}

/// Identifier of a sync job record.
pub type JobId = Uuid;

/// What a successful sync changed locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdateSummary {
    /// Refs (git) or files (artifacts) that changed.
    pub changes: u64,
    /// The strategy declared the operation a no-op for its family.
    pub no_op: bool,
}

impl UpdateSummary {
    pub fn changed(changes: u64) -> Self {
        Self {
            changes,
            no_op: false,
        }
    }

    pub fn no_op() -> Self {
        Self {
            changes: 0,
            no_op: true,
        }
    }
}

/// Result of one sync attempt as handed back to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(UpdateSummary),
    Errored(SyncError),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed(_))
    }

    pub fn error(&self) -> Option<&SyncError> {
        match self {
            JobOutcome::Completed(_) => None,
            JobOutcome::Errored(err) => Some(err),
        }
    }

    /// Label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Completed(_) => "success",
            JobOutcome::Errored(err) => err.kind.as_str(),
        }
    }
}

impl From<Result<UpdateSummary, SyncError>> for JobOutcome {
    fn from(result: Result<UpdateSummary, SyncError>) -> Self {
        match result {
            Ok(summary) => JobOutcome::Completed(summary),
            Err(err) => JobOutcome::Errored(err),
        }
    }
}

/// One synchronization attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: JobId,
    pub repo_id: RepoId,
    /// 1-based position of this job in the repository's history.
    pub attempt: u64,
    pub trigger: TriggerKind,
    pub state: JobState,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub changes: Option<u64>,
    pub error: Option<SyncError>,
}

impl SyncJob {
    pub fn new(
        repo_id: RepoId,
        attempt: u64,
        trigger: TriggerKind,
        requested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            repo_id,
            attempt,
            trigger,
            state: JobState::Queued,
            requested_at,
            started_at: None,
            finished_at: None,
            changes: None,
            error: None,
        }
    }
}

/// A repository as reported by an external source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSpec {
    pub id: RepoId,
    pub name: RepoName,
    pub family: Family,
    /// Clone URL for `git`, `name@version` coordinate for `npm`.
    pub origin: String,
}

/// A repository tracked by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Repository {
    pub id: RepoId,
    pub name: RepoName,
    pub family: Family,
    pub origin: String,
    pub cloneable: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Next time the repository is eligible for an automatic sync.
    pub next_due_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Repository {
    pub fn from_spec(spec: RepoSpec) -> Self {
        Self {
            id: spec.id,
            name: spec.name,
            family: spec.family,
            origin: spec.origin,
            cloneable: true,
            last_synced_at: None,
            next_due_at: None,
            deleted_at: None,
        }
    }

    pub fn is_removed(&self) -> bool {
        self.deleted_at.is_some()
    }
}
