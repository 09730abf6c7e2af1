//! # Purge Worker
//!
//! Reclaims storage held by repositories the scheduler no longer tracks.
//! Each sweep works from one scheduler snapshot and claims every candidate
//! name from the scheduler before deleting it, so no job can start on that
//! name until the removal is over. A failed removal is counted and retried
//! on the next sweep.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::StorageError;
use crate::job_store::JobStore;
use crate::observability::SyncMetrics;
use crate::scheduler::{PurgeSnapshot, Scheduler};
use crate::storage::RepoStorage;
use crate::types::RepoName;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    /// Materialized repositories no tracked repository owns.
    pub orphans: usize,
    pub removed: usize,
    pub failed: usize,
    /// Orphans left alone because a job may still be writing to them.
    pub skipped: usize,
    /// Removed repositories hard-removed from the scheduler.
    pub forgotten: usize,
}

pub struct PurgeWorker {
    scheduler: Arc<Scheduler>,
    job_store: Arc<dyn JobStore>,
    storage: Arc<dyn RepoStorage>,
    metrics: SyncMetrics,
    interval: Duration,
}

impl PurgeWorker {
    pub fn new(
        scheduler: Arc<Scheduler>,
        job_store: Arc<dyn JobStore>,
        storage: Arc<dyn RepoStorage>,
        metrics: SyncMetrics,
        interval: Duration,
    ) -> Self {
        Self {
            scheduler,
            job_store,
            storage,
            metrics,
            interval,
        }
    }

    /// Sweep every `interval` until `shutdown` fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Starting purge worker");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Purge worker shutdown requested");
                    break;
                }
                _ = sleep(self.interval) => {
                    match self.sweep().await {
                        Ok(stats) if stats == PurgeStats::default() => {}
                        Ok(stats) => info!(
                            orphans = stats.orphans,
                            removed = stats.removed,
                            failed = stats.failed,
                            skipped = stats.skipped,
                            forgotten = stats.forgotten,
                            "Purge sweep completed"
                        ),
                        Err(err) => {
                            self.metrics.purge_failed();
                            error!(error = %err, "Purge sweep failed");
                        }
                    }
                }
            }
        }

        info!("Purge worker stopped");
    }

    pub async fn sweep(&self) -> Result<PurgeStats, StorageError> {
        let snapshot = self.scheduler.purge_snapshot();
        let materialized = self.storage.list_materialized().await?;
        let mut stats = PurgeStats::default();

        for name in materialized {
            if snapshot.tracked.contains(&name) {
                continue;
            }
            stats.orphans += 1;

            if snapshot.running.contains(&name) || !self.scheduler.claim_purge(&name) {
                debug!(repo = %name, "Skipping purge; repository may still be syncing");
                stats.skipped += 1;
                continue;
            }
            let claim = scopeguard::guard(&name, |name| self.scheduler.release_purge(name));

            if !self.owners_idle(&name, &snapshot).await {
                debug!(repo = %name, "Skipping purge; repository may still be syncing");
                stats.skipped += 1;
                continue;
            }

            let removal = self.storage.remove(&name).await;
            drop(claim);
            match removal {
                Ok(()) => {
                    stats.removed += 1;
                    self.metrics.purge_succeeded();
                    info!(repo = %name, "Purged untracked repository");
                }
                Err(err) => {
                    stats.failed += 1;
                    self.metrics.purge_failed();
                    warn!(repo = %name, error = %err, "Failed to purge repository");
                }
            }
        }

        for (repo_id, name) in &snapshot.removed {
            // A tracked repository reusing the name owns that data now.
            let reclaimed = if snapshot.tracked.contains(name) {
                true
            } else {
                match self.storage.is_materialized(name).await {
                    Ok(materialized) => !materialized,
                    Err(err) => {
                        warn!(repo = %name, error = %err, "Failed to check repository storage");
                        false
                    }
                }
            };

            if reclaimed && self.scheduler.forget(*repo_id) {
                stats.forgotten += 1;
            }
        }

        Ok(stats)
    }

    /// No removed owner of `name` has a job the store still holds open.
    async fn owners_idle(&self, name: &RepoName, snapshot: &PurgeSnapshot) -> bool {
        let owners: HashSet<_> = snapshot
            .removed
            .iter()
            .filter(|(_, removed)| removed == name)
            .map(|(repo_id, _)| *repo_id)
            .collect();

        for repo_id in owners {
            match self.job_store.in_flight(repo_id).await {
                Ok(None) => {}
                Ok(Some(job)) => {
                    debug!(repo = %name, job_id = %job.id, "Job store reports an in-flight job");
                    return false;
                }
                Err(err) => {
                    warn!(repo = %name, error = %err, "Failed to check in-flight jobs; skipping purge");
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::clock::SystemClock;
    use crate::config::{BackoffPolicyConfig, SchedulerConfig};
    use crate::job_store::MemoryJobStore;
    use crate::observability::LocalCollector;
    use crate::scheduler::TickOutcome;
    use crate::storage::FsRepoStorage;
    use crate::types::{Family, JobOutcome, RepoId, RepoSpec, TriggerKind, UpdateSummary};
    use chrono::Utc;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: std::path::PathBuf,
        scheduler: Arc<Scheduler>,
        store: Arc<MemoryJobStore>,
        worker: PurgeWorker,
        collector: LocalCollector,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let config = SchedulerConfig::default();
        let store = Arc::new(MemoryJobStore::new());
        let collector = LocalCollector::new();
        let metrics = SyncMetrics::with_recorder(&collector);
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            BackoffPolicy::new(BackoffPolicyConfig::default(), &config),
            metrics.clone(),
            Arc::new(SystemClock),
            &config,
        ));
        let worker = PurgeWorker::new(
            scheduler.clone(),
            store.clone(),
            Arc::new(FsRepoStorage::new(&root)),
            metrics,
            Duration::from_secs(600),
        );
        Fixture {
            _dir: dir,
            root,
            scheduler,
            store,
            worker,
            collector,
        }
    }

    fn materialize(root: &Path, name: &str) {
        let path = root.join(name);
        std::fs::create_dir_all(path.join("objects")).unwrap();
        std::fs::write(path.join("HEAD"), "ref: refs/heads/main\n").unwrap();
    }

    fn spec(id: i64, name: &str) -> RepoSpec {
        RepoSpec {
            id: RepoId(id),
            name: RepoName::new(name),
            family: Family::Git,
            origin: format!("https://{name}.git"),
        }
    }

    #[tokio::test]
    async fn removes_orphans_and_keeps_tracked() {
        let f = fixture();
        materialize(&f.root, "github.com/acme/kept");
        materialize(&f.root, "github.com/acme/orphan");
        f.scheduler.register(spec(1, "github.com/acme/kept"));

        let stats = f.worker.sweep().await.unwrap();
        assert_eq!(stats.orphans, 1);
        assert_eq!(stats.removed, 1);
        assert!(f.root.join("github.com/acme/kept").exists());
        assert!(!f.root.join("github.com/acme/orphan").exists());
        assert_eq!(f.collector.counter("repo_updater_purge_success_total", &[]), 1);
    }

    #[tokio::test]
    async fn never_touches_a_repository_with_a_running_job() {
        let f = fixture();
        materialize(&f.root, "github.com/acme/busy");
        f.scheduler.register(spec(1, "github.com/acme/busy"));
        let TickOutcome::Dispatched(dispatch) = f.scheduler.tick().await else {
            panic!("expected a dispatch");
        };
        f.scheduler.deregister(RepoId(1));

        let stats = f.worker.sweep().await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert!(f.root.join("github.com/acme/busy").exists());

        let outcome = JobOutcome::Completed(UpdateSummary::changed(1));
        f.scheduler.record_outcome(&dispatch, &outcome).await;

        let stats = f.worker.sweep().await.unwrap();
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.forgotten, 1);
        assert!(f.scheduler.status(RepoId(1)).is_none());
    }

    #[tokio::test]
    async fn respects_in_flight_jobs_reported_by_the_store() {
        let f = fixture();
        materialize(&f.root, "npm/left-pad");
        f.scheduler.register(spec(2, "npm/left-pad"));
        f.scheduler.deregister(RepoId(2));
        f.store
            .begin(RepoId(2), TriggerKind::Auto, Utc::now())
            .await
            .unwrap();

        let stats = f.worker.sweep().await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.forgotten, 0);
        assert!(f.root.join("npm/left-pad").exists());
    }

    /// Registers and ticks a repository under the same name while its
    /// directory is being removed.
    struct RegisteringStorage {
        inner: FsRepoStorage,
        scheduler: Arc<Scheduler>,
        spec: RepoSpec,
        tick: std::sync::Mutex<Option<TickOutcome>>,
    }

    #[async_trait::async_trait]
    impl RepoStorage for RegisteringStorage {
        fn path_for(&self, name: &RepoName) -> Result<std::path::PathBuf, StorageError> {
            self.inner.path_for(name)
        }

        fn staging_root(&self) -> std::path::PathBuf {
            self.inner.staging_root()
        }

        async fn is_materialized(&self, name: &RepoName) -> Result<bool, StorageError> {
            self.inner.is_materialized(name).await
        }

        async fn list_materialized(&self) -> Result<Vec<RepoName>, StorageError> {
            self.inner.list_materialized().await
        }

        async fn remove(&self, name: &RepoName) -> Result<(), StorageError> {
            self.scheduler.register(self.spec.clone());
            let outcome = self.scheduler.tick().await;
            *self.tick.lock().unwrap() = Some(outcome);
            self.inner.remove(name).await
        }
    }

    #[tokio::test]
    async fn no_job_starts_on_a_name_while_it_is_removed() {
        let f = fixture();
        materialize(&f.root, "github.com/acme/reused");
        let storage = Arc::new(RegisteringStorage {
            inner: FsRepoStorage::new(&f.root),
            scheduler: f.scheduler.clone(),
            spec: spec(4, "github.com/acme/reused"),
            tick: std::sync::Mutex::new(None),
        });
        let worker = PurgeWorker::new(
            f.scheduler.clone(),
            f.store.clone(),
            storage.clone(),
            SyncMetrics::new(),
            Duration::from_secs(600),
        );

        let stats = worker.sweep().await.unwrap();
        assert_eq!(stats.removed, 1);
        assert_eq!(
            storage.tick.lock().unwrap().clone(),
            Some(TickOutcome::Deferred { repo_id: RepoId(4) })
        );
        assert!(f.store.history(RepoId(4), 10).await.unwrap().is_empty());

        // The claim is released once the sweep returns.
        assert!(format!("{:?}", f.scheduler).contains("purging: 0"));
        f.scheduler.request_immediate_sync(RepoId(4)).unwrap();
        let TickOutcome::Dispatched(dispatch) = f.scheduler.tick().await else {
            panic!("expected a dispatch");
        };
        assert_eq!(dispatch.repo.id, RepoId(4));
    }

    #[tokio::test]
    async fn forgets_removed_repositories_without_data() {
        let f = fixture();
        f.scheduler.register(spec(3, "github.com/acme/never-cloned"));
        f.scheduler.deregister(RepoId(3));

        let stats = f.worker.sweep().await.unwrap();
        assert_eq!(stats.forgotten, 1);
        assert!(f.scheduler.status(RepoId(3)).is_none());
    }
}
