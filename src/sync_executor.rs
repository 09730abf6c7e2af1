//! Sync Executor
//!
//! Bounded worker pool that pulls dispatches from the [`Scheduler`], runs
//! the matching [`SyncStrategy`](crate::strategy::SyncStrategy) under a per-job
//! deadline and hands the outcome back. Strategy errors, panics and timeouts
//! all become job outcomes; nothing escapes the executor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::SyncError;
use crate::observability::SyncMetrics;
use crate::scheduler::{Dispatch, Scheduler, TickOutcome};
use crate::storage::RepoStorage;
use crate::strategy::{Destination, StrategyRegistry};
use crate::telemetry::job_span;
use crate::types::JobOutcome;

/// Configuration for the sync executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Idle wait between scheduler ticks
    pub tick_interval: Duration,
    /// Maximum number of concurrent jobs
    pub max_concurrent_jobs: usize,
    /// Deadline for a single strategy invocation
    pub job_timeout: Duration,
}

impl ExecutorConfig {
    pub fn from_scheduler(config: &SchedulerConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            max_concurrent_jobs: config.max_concurrent_jobs.max(1),
            job_timeout: config.job_timeout(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_scheduler(&SchedulerConfig::default())
    }
}

/// Sync executor responsible for running background sync jobs
#[derive(Clone)]
pub struct SyncExecutor {
    scheduler: Arc<Scheduler>,
    registry: StrategyRegistry,
    storage: Arc<dyn RepoStorage>,
    metrics: SyncMetrics,
    config: ExecutorConfig,
    permits: Arc<Semaphore>,
}

impl SyncExecutor {
    pub fn new(
        scheduler: Arc<Scheduler>,
        registry: StrategyRegistry,
        storage: Arc<dyn RepoStorage>,
        metrics: SyncMetrics,
        config: ExecutorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            scheduler,
            registry,
            storage,
            metrics,
            config,
            permits,
        }
    }

    /// Dispatch work until `shutdown` fires, then wait for in-flight jobs.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting sync executor with config: {:?}", self.config);
        let mut tasks = JoinSet::new();

        'ticks: loop {
            // Drain everything that is due while worker slots remain.
            loop {
                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break 'ticks,
                    permit = self.permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'ticks,
                    },
                };

                match self.scheduler.tick().await {
                    TickOutcome::Dispatched(dispatch) => {
                        let span = job_span(
                            dispatch.job.id,
                            dispatch.repo.id,
                            dispatch.repo.family,
                            dispatch.trigger,
                        );
                        let executor = self.clone();
                        tasks.spawn(
                            async move {
                                let _permit = permit;
                                executor.execute(dispatch).await;
                            }
                            .instrument(span),
                        );
                    }
                    TickOutcome::Deferred { repo_id } => {
                        debug!(repo_id = %repo_id, "Dispatch deferred");
                    }
                    TickOutcome::Idle => break,
                }

                while let Some(result) = tasks.try_join_next() {
                    log_task_result(result);
                }
            }

            // Wake for the next due entry when it comes before the regular tick.
            let idle = match self.scheduler.until_next_due() {
                Some(due) if !due.is_zero() => due.min(self.config.tick_interval),
                _ => self.config.tick_interval,
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.scheduler.notified() => {}
                _ = sleep(idle) => {}
                Some(result) = tasks.join_next(), if !tasks.is_empty() => log_task_result(result),
            }
        }

        info!(in_flight = tasks.len(), "Sync executor shutdown requested");
        while let Some(result) = tasks.join_next().await {
            log_task_result(result);
        }
        info!("Sync executor stopped");
    }

    /// Run one dispatch to completion and report its outcome to the scheduler.
    pub async fn execute(&self, dispatch: Dispatch) -> JobOutcome {
        let timer = Instant::now();
        self.scheduler.start(&dispatch).await;
        info!(
            "Starting sync job {} (attempt {})",
            dispatch.job.id, dispatch.job.attempt
        );

        let outcome = self.run_strategy(&dispatch).await;
        let elapsed = timer.elapsed().as_secs_f64();

        self.metrics
            .sync_duration(outcome.is_success(), dispatch.repo.family, elapsed);
        self.metrics.sync_attempt(outcome.label(), dispatch.trigger);

        match &outcome {
            JobOutcome::Completed(summary) => info!(
                changes = summary.changes,
                no_op = summary.no_op,
                "Sync job {} finished in {:.2}s",
                dispatch.job.id,
                elapsed
            ),
            JobOutcome::Errored(err) => warn!(
                kind = err.kind.as_str(),
                error = %err,
                "Sync job {} failed after {:.2}s",
                dispatch.job.id,
                elapsed
            ),
        }

        self.scheduler.record_outcome(&dispatch, &outcome).await;
        outcome
    }

    async fn run_strategy(&self, dispatch: &Dispatch) -> JobOutcome {
        let strategy = match self.registry.get(dispatch.repo.family) {
            Ok(strategy) => strategy,
            Err(err) => return JobOutcome::Errored(err),
        };
        let destination = match self.storage.path_for(&dispatch.repo.name) {
            Ok(path) => Destination::new(path, self.storage.staging_root()),
            Err(err) => return JobOutcome::Errored(err.into()),
        };
        let origin = dispatch.repo.origin.clone();

        // A separate task: a panicking strategy surfaces as a JoinError and an
        // expired deadline aborts it, killing any child process.
        let mut handle = tokio::spawn(
            async move {
                if destination.is_materialized() {
                    strategy.incremental_update(&origin, &destination).await
                } else {
                    strategy.materialize(&origin, &destination).await
                }
            }
            .in_current_span(),
        );

        match timeout(self.config.job_timeout, &mut handle).await {
            Ok(Ok(result)) => result.into(),
            Ok(Err(join_err)) => JobOutcome::Errored(SyncError::storage(format!(
                "sync task did not complete: {join_err}"
            ))),
            Err(_) => {
                handle.abort();
                JobOutcome::Errored(SyncError::timeout(format!(
                    "sync exceeded its {:.0?} deadline",
                    self.config.job_timeout
                )))
            }
        }
    }
}

fn log_task_result(result: Result<(), JoinError>) {
    if let Err(err) = result {
        error!(error = %err, "Sync job task failed");
    }
}
