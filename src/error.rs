//! # Error Handling
//!
//! Error taxonomy for sync attempts plus the error types of the job store,
//! scheduler and storage layers. Sync errors are serializable so they can be
//! persisted alongside job records.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{JobState, RepoId};

/// Classification driving backoff and operator visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Origin temporarily unavailable.
    Unreachable,
    /// Origin does not know the repository or artifact.
    NotFound,
    /// Origin rejected our identity.
    PermissionDenied,
    /// The in-flight operation exceeded its deadline and was abandoned.
    Timeout,
    /// Local materialize, update or purge failure.
    Storage,
    /// A scheduling invariant was about to be broken (e.g. a duplicate begin).
    InvariantViolation,
}

impl SyncErrorKind {
    pub const ALL: [SyncErrorKind; 6] = [
        SyncErrorKind::Unreachable,
        SyncErrorKind::NotFound,
        SyncErrorKind::PermissionDenied,
        SyncErrorKind::Timeout,
        SyncErrorKind::Storage,
        SyncErrorKind::InvariantViolation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorKind::Unreachable => "unreachable",
            SyncErrorKind::NotFound => "not_found",
            SyncErrorKind::PermissionDenied => "permission_denied",
            SyncErrorKind::Timeout => "timeout",
            SyncErrorKind::Storage => "storage_error",
            SyncErrorKind::InvariantViolation => "invariant_violation",
        }
    }
}

impl std::fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SyncErrorKind::Unreachable => "Unreachable",
            SyncErrorKind::NotFound => "Not found",
            SyncErrorKind::PermissionDenied => "Permission denied",
            SyncErrorKind::Timeout => "Timed out",
            SyncErrorKind::Storage => "Storage error",
            SyncErrorKind::InvariantViolation => "Invariant violation",
        };
        f.write_str(text)
    }
}

/// Failure of a sync strategy operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct SyncError {
    pub kind: SyncErrorKind,
    pub message: String,
}

impl SyncError {
    pub fn new<S: Into<String>>(kind: SyncErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unreachable<S: Into<String>>(message: S) -> Self {
        Self::new(SyncErrorKind::Unreachable, message)
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(SyncErrorKind::NotFound, message)
    }

    pub fn permission_denied<S: Into<String>>(message: S) -> Self {
        Self::new(SyncErrorKind::PermissionDenied, message)
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::new(SyncErrorKind::Timeout, message)
    }

    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::new(SyncErrorKind::Storage, message)
    }

    pub fn invariant<S: Into<String>>(message: S) -> Self {
        Self::new(SyncErrorKind::InvariantViolation, message)
    }

    /// The origin rejected the identity; an operator most likely has to act.
    pub fn needs_attention(&self) -> bool {
        matches!(
            self.kind,
            SyncErrorKind::NotFound | SyncErrorKind::PermissionDenied
        )
    }

    /// Classify an HTTP status returned by a registry or forge.
    pub fn from_status(status: u16, context: &str) -> Self {
        match status {
            404 | 410 => Self::not_found(format!("{context}: HTTP {status}")),
            401 | 403 => Self::permission_denied(format!("{context}: HTTP {status}")),
            _ => Self::unreachable(format!("{context}: HTTP {status}")),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::storage(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return SyncError::timeout(err.to_string());
        }
        match err.status() {
            Some(status) => SyncError::from_status(status.as_u16(), "registry request failed"),
            None => SyncError::unreachable(err.to_string()),
        }
    }
}

/// Errors returned by a [`crate::job_store::JobStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobStoreError {
    #[error("repository {repo_id} already has a sync job in flight")]
    AlreadyRunning { repo_id: RepoId },
    #[error("sync job {job_id} not found")]
    UnknownJob { job_id: uuid::Uuid },
    #[error("sync job {job_id} cannot start from state {state}")]
    NotQueued { job_id: uuid::Uuid, state: JobState },
    #[error("job store database error: {0}")]
    Database(String),
    #[error("corrupt job record {job_id}: {details}")]
    CorruptRecord { job_id: uuid::Uuid, details: String },
}

impl From<sea_orm::DbErr> for JobStoreError {
    fn from(err: sea_orm::DbErr) -> Self {
        JobStoreError::Database(err.to_string())
    }
}

/// Errors returned by the scheduler's public operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("repository {repo_id} is already syncing")]
    AlreadySyncing { repo_id: RepoId },
    #[error("repository {repo_id} is not tracked")]
    UnknownRepository { repo_id: RepoId },
}

/// Errors raised while enumerating or removing materialized repositories.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("repository name '{name}' cannot be mapped to a storage path")]
    InvalidName { name: String },
    #[error("storage I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to walk storage root: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Errors raised while reading a repository source listing.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read repository list {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid repository list {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("repository id {repo_id} is listed more than once")]
    DuplicateId { repo_id: RepoId },
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        SyncError::storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(
            SyncError::from_status(404, "lookup").kind,
            SyncErrorKind::NotFound
        );
        assert_eq!(
            SyncError::from_status(403, "lookup").kind,
            SyncErrorKind::PermissionDenied
        );
        assert_eq!(
            SyncError::from_status(502, "lookup").kind,
            SyncErrorKind::Unreachable
        );
    }

    #[test]
    fn attention_only_for_identity_rejections() {
        assert!(SyncError::not_found("gone").needs_attention());
        assert!(SyncError::permission_denied("nope").needs_attention());
        assert!(!SyncError::unreachable("down").needs_attention());
        assert!(!SyncError::timeout("slow").needs_attention());
    }

    #[test]
    fn sync_error_round_trips_through_json() {
        let err = SyncError::unreachable("connection refused");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "unreachable");
        let back: SyncError = serde_json::from_value(value).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn io_errors_normalize_to_storage() {
        let err: SyncError = std::io::Error::other("disk full").into();
        assert_eq!(err.kind, SyncErrorKind::Storage);
    }
}
