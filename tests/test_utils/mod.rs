//! Shared fixtures for the integration tests.
//!
//! In-memory SQLite job stores, scheduler and executor builders, a scripted
//! sync strategy and an npm tarball builder.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use migration::{Migrator, MigratorTrait};
use repo_updater::backoff::BackoffPolicy;
use repo_updater::clock::Clock;
use repo_updater::config::{BackoffPolicyConfig, SchedulerConfig};
use repo_updater::error::SyncError;
use repo_updater::job_store::JobStore;
use repo_updater::observability::SyncMetrics;
use repo_updater::scheduler::Scheduler;
use repo_updater::storage::FsRepoStorage;
use repo_updater::strategy::{
    Destination, GitCommand, RemoteInfo, StrategyRegistry, SyncStrategy,
};
use repo_updater::sync_executor::{ExecutorConfig, SyncExecutor};
use repo_updater::types::{Family, RepoId, RepoName, RepoSpec, UpdateSummary};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};

/// Sets up an in-memory SQLite database with all migrations applied.
///
/// Every pooled SQLite connection would get its own in-memory database, so
/// the pool is pinned to a single connection.
#[allow(dead_code)]
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1).sqlx_logging(false);
    let db = Database::connect(options).await?;

    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Whether a usable `git` binary is on `PATH`.
#[allow(dead_code)]
pub async fn git_available() -> bool {
    GitCommand::new("git").is_available().await
}

#[allow(dead_code)]
pub fn git_spec(id: i64, name: &str) -> RepoSpec {
    RepoSpec {
        id: RepoId(id),
        name: RepoName::new(name),
        family: Family::Git,
        origin: format!("https://{name}.git"),
    }
}

#[allow(dead_code)]
pub fn npm_spec(id: i64, coordinate: &str) -> RepoSpec {
    let name = coordinate
        .rsplit_once('@')
        .map_or(coordinate, |(name, _)| name)
        .trim_start_matches('@');
    RepoSpec {
        id: RepoId(id),
        name: RepoName::new(format!("npm/{name}")),
        family: Family::Npm,
        origin: coordinate.to_string(),
    }
}

#[allow(dead_code)]
pub fn build_scheduler(
    store: Arc<dyn JobStore>,
    metrics: SyncMetrics,
    clock: Arc<dyn Clock>,
) -> Arc<Scheduler> {
    let config = SchedulerConfig::default();
    Arc::new(Scheduler::new(
        store,
        BackoffPolicy::new(BackoffPolicyConfig::default(), &config),
        metrics,
        clock,
        &config,
    ))
}

#[allow(dead_code)]
pub fn build_executor(
    scheduler: Arc<Scheduler>,
    registry: StrategyRegistry,
    root: &Path,
    metrics: SyncMetrics,
    config: ExecutorConfig,
) -> SyncExecutor {
    SyncExecutor::new(
        scheduler,
        registry,
        Arc::new(FsRepoStorage::new(root)),
        metrics,
        config,
    )
}

#[allow(dead_code)]
pub fn fast_executor_config() -> ExecutorConfig {
    ExecutorConfig {
        tick_interval: Duration::from_millis(10),
        max_concurrent_jobs: 4,
        job_timeout: Duration::from_secs(5),
    }
}

/// Marks `path` as a materialized bare repository.
#[allow(dead_code)]
pub fn fake_bare_repo(path: &Path) {
    std::fs::create_dir_all(path.join("objects")).unwrap();
    std::fs::write(path.join("HEAD"), "ref: refs/heads/main\n").unwrap();
}

/// Which strategy operation a scripted call went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Materialize,
    Incremental,
}

/// Strategy that replays scripted results and records its calls.
///
/// Successful materializations create a fake bare repository at the
/// destination so later syncs take the incremental path.
#[allow(dead_code)]
pub struct ScriptedStrategy {
    family: Family,
    delay: Duration,
    results: Mutex<VecDeque<Result<UpdateSummary, SyncError>>>,
    calls: Mutex<Vec<Call>>,
    panic_on_call: bool,
}

#[allow(dead_code)]
impl ScriptedStrategy {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            delay: Duration::ZERO,
            results: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            panic_on_call: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panic_on_call = true;
        self
    }

    pub fn push_result(&self, result: Result<UpdateSummary, SyncError>) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    async fn respond(&self, call: Call) -> Result<UpdateSummary, SyncError> {
        self.calls.lock().unwrap().push(call);
        if self.panic_on_call {
            panic!("scripted strategy panic");
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.results.lock().unwrap().pop_front();
        next.unwrap_or(Ok(UpdateSummary::changed(1)))
    }
}

#[async_trait]
impl SyncStrategy for ScriptedStrategy {
    fn family(&self) -> Family {
        self.family
    }

    async fn is_cloneable(&self, _origin: &str) -> Result<(), SyncError> {
        Ok(())
    }

    async fn materialize(
        &self,
        _origin: &str,
        destination: &Destination,
    ) -> Result<UpdateSummary, SyncError> {
        let result = self.respond(Call::Materialize).await;
        if result.is_ok() {
            fake_bare_repo(destination.path());
        }
        result
    }

    async fn incremental_update(
        &self,
        _origin: &str,
        _destination: &Destination,
    ) -> Result<UpdateSummary, SyncError> {
        self.respond(Call::Incremental).await
    }

    async fn describe_remote(&self, _origin: &str) -> Result<RemoteInfo, SyncError> {
        Ok(RemoteInfo::default())
    }
}

/// Gzipped tarball laid out like `npm pack` output (`package/<path>`).
#[allow(dead_code)]
pub fn build_npm_tarball(files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("package/{path}"), contents.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Subresource-integrity string for `bytes`.
#[allow(dead_code)]
pub fn sha512_integrity(bytes: &[u8]) -> String {
    use base64::Engine as _;
    use sha2::{Digest, Sha512};
    format!(
        "sha512-{}",
        base64::engine::general_purpose::STANDARD.encode(Sha512::digest(bytes))
    )
}
