//! External repository sources.
//!
//! A [`RepoSource`] reports the full set of repositories that should be
//! mirrored. The [`SourceSyncer`] diffs each listing against the scheduler:
//! every listed repository is registered and every active one missing from
//! the listing is deregistered.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::error::SourceError;
use crate::scheduler::Scheduler;
use crate::types::RepoSpec;

#[async_trait]
pub trait RepoSource: Send + Sync {
    async fn list(&self) -> Result<Vec<RepoSpec>, SourceError>;
}

/// Reads a JSON array of `{id, name, family, origin}` objects.
#[derive(Debug, Clone)]
pub struct FileRepoSource {
    path: PathBuf,
}

impl FileRepoSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RepoSource for FileRepoSource {
    async fn list(&self) -> Result<Vec<RepoSpec>, SourceError> {
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|source| SourceError::Read {
                path: self.path.clone(),
                source,
            })?;
        serde_json::from_slice(&raw).map_err(|source| SourceError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceSyncStats {
    pub listed: usize,
    /// Repositories that were new (or revived) and got queued.
    pub registered: usize,
    pub deregistered: usize,
}

pub struct SourceSyncer {
    source: Arc<dyn RepoSource>,
    scheduler: Arc<Scheduler>,
    interval: Duration,
}

impl SourceSyncer {
    pub fn new(source: Arc<dyn RepoSource>, scheduler: Arc<Scheduler>, interval: Duration) -> Self {
        Self {
            source,
            scheduler,
            interval,
        }
    }

    /// Apply one listing. A listing that fails to load or names an id twice
    /// changes nothing.
    #[instrument(skip(self))]
    pub async fn sync_once(&self) -> Result<SourceSyncStats, SourceError> {
        let specs = self.source.list().await?;

        let mut listed = HashSet::with_capacity(specs.len());
        for spec in &specs {
            if !listed.insert(spec.id) {
                return Err(SourceError::DuplicateId { repo_id: spec.id });
            }
        }

        let mut stats = SourceSyncStats {
            listed: specs.len(),
            ..SourceSyncStats::default()
        };
        for spec in specs {
            if self.scheduler.register(spec) {
                stats.registered += 1;
            }
        }
        for repo_id in self.scheduler.active_ids() {
            if !listed.contains(&repo_id) && self.scheduler.deregister(repo_id) {
                stats.deregistered += 1;
            }
        }

        Ok(stats)
    }

    /// Sync now, then every `interval` until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Starting source syncer");

        loop {
            match self.sync_once().await {
                Ok(stats) => info!(
                    listed = stats.listed,
                    registered = stats.registered,
                    deregistered = stats.deregistered,
                    "Repository source synced"
                ),
                Err(err) => error!(error = %err, "Repository source sync failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.interval) => {}
            }
        }

        info!("Source syncer stopped");
    }
}
