//! # Service Wiring
//!
//! Builds the job store, storage, strategies, scheduler and background
//! workers from an [`AppConfig`] and runs them until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::clock::SystemClock;
use crate::config::{AppConfig, JobStoreKind};
use crate::db;
use crate::error::SyncError;
use crate::job_store::{JobStore, MemoryJobStore, SqlJobStore};
use crate::observability::SyncMetrics;
use crate::purge::PurgeWorker;
use crate::scheduler::Scheduler;
use crate::sources::{FileRepoSource, SourceSyncer};
use crate::storage::{FsRepoStorage, RepoStorage};
use crate::strategy::{GitCommand, StrategyRegistry};
use crate::sync_executor::{ExecutorConfig, SyncExecutor};

/// Connects the configured job store, migrating SQL schemas first.
pub async fn build_job_store(config: &AppConfig) -> Result<Arc<dyn JobStore>> {
    Ok(match config.job_store {
        JobStoreKind::Sql => {
            let db = db::connect_and_migrate(config).await?;
            Arc::new(SqlJobStore::new(db))
        }
        JobStoreKind::Memory => {
            warn!("Using the in-memory job store; job history is lost on restart");
            Arc::new(MemoryJobStore::new())
        }
    })
}

/// Run every background component until `shutdown` fires.
pub async fn run_service(config: AppConfig, shutdown: CancellationToken) -> Result<()> {
    let job_store = build_job_store(&config).await?;

    let interrupted = SyncError::storage("process stopped before the job finished");
    let abandoned = job_store
        .abandon_in_flight(&interrupted, Utc::now())
        .await
        .context("failed to close jobs left in flight")?;
    if abandoned > 0 {
        warn!(abandoned, "Closed sync jobs left in flight by a previous run");
    }

    let storage = FsRepoStorage::new(&config.repos_dir);
    storage
        .prepare()
        .await
        .with_context(|| format!("failed to prepare {}", storage.root().display()))?;
    let storage: Arc<dyn RepoStorage> = Arc::new(storage);

    let git = GitCommand::new(config.git_binary.clone());
    if !git.is_available().await {
        warn!(git = %git.binary(), "git binary is not executable; every sync will fail");
    }
    let registry = StrategyRegistry::from_config(&config)?;

    let metrics = SyncMetrics::new();
    let scheduler = Arc::new(Scheduler::new(
        job_store.clone(),
        BackoffPolicy::new(config.backoff.clone(), &config.scheduler),
        metrics.clone(),
        Arc::new(SystemClock),
        &config.scheduler,
    ));

    let mut tasks = JoinSet::new();

    let executor = SyncExecutor::new(
        scheduler.clone(),
        registry,
        storage.clone(),
        metrics.clone(),
        ExecutorConfig::from_scheduler(&config.scheduler),
    );
    tasks.spawn(executor.run(shutdown.clone()));

    if config.purge.enabled {
        let purge = PurgeWorker::new(
            scheduler.clone(),
            job_store.clone(),
            storage.clone(),
            metrics.clone(),
            Duration::from_secs(config.purge.interval_seconds),
        );
        tasks.spawn(purge.run(shutdown.clone()));
    }

    match &config.repos_file {
        Some(path) => {
            let syncer = SourceSyncer::new(
                Arc::new(FileRepoSource::new(path)),
                scheduler.clone(),
                Duration::from_secs(config.source_sync_interval_seconds),
            );
            tasks.spawn(syncer.run(shutdown.clone()));
        }
        None => warn!("REPO_UPDATER_REPOS_FILE is not set; no repositories will be registered"),
    }

    info!(
        profile = %config.profile,
        repos_dir = %config.repos_dir.display(),
        "repo-updater running"
    );

    while let Some(result) = tasks.join_next().await {
        if let Err(err) = result {
            error!(error = %err, "Background task failed");
        }
    }

    info!("repo-updater stopped");
    Ok(())
}
