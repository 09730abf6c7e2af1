//! Sync strategies
//!
//! One [`SyncStrategy`] implementation per repository [`Family`]. The
//! scheduler never sees family differences; it asks the
//! [`StrategyRegistry`] for the strategy matching a repository and the
//! executor drives it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::SyncError;
use crate::types::{Family, UpdateSummary};

pub mod command;
pub mod git;
pub mod npm;
pub mod registry;

pub use command::GitCommand;
pub use git::GitStrategy;
pub use npm::NpmStrategy;
pub use registry::StrategyRegistry;

/// Lightweight description of a remote, produced without materializing it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteInfo {
    /// Commit the remote's HEAD points at (git) or the artifact shasum (npm).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Where a strategy writes one repository.
#[derive(Debug, Clone)]
pub struct Destination {
    path: PathBuf,
    staging_root: PathBuf,
}

impl Destination {
    pub fn new(path: impl Into<PathBuf>, staging_root: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            staging_root: staging_root.into(),
        }
    }

    /// Final, reader-visible location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Private directory materializations are built under before publishing.
    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    pub fn is_materialized(&self) -> bool {
        crate::storage::is_repository_dir(&self.path)
    }
}

#[async_trait]
pub trait SyncStrategy: Send + Sync {
    fn family(&self) -> Family;

    /// Cheap check that the origin exists and is readable. Never touches local state.
    async fn is_cloneable(&self, origin: &str) -> Result<(), SyncError>;

    /// Produces the full local representation at `destination`.
    ///
    /// Builds under the staging root and publishes with one rename, so a
    /// failure leaves nothing visible at `destination.path()`. Calling it on
    /// an already materialized destination returns [`UpdateSummary::no_op`].
    async fn materialize(
        &self,
        origin: &str,
        destination: &Destination,
    ) -> Result<UpdateSummary, SyncError>;

    /// Applies whatever changed at the origin since the last sync.
    async fn incremental_update(
        &self,
        origin: &str,
        destination: &Destination,
    ) -> Result<UpdateSummary, SyncError>;

    async fn describe_remote(&self, origin: &str) -> Result<RemoteInfo, SyncError>;
}
