//! Executor and scheduler working together over scripted strategies.

mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use repo_updater::clock::SystemClock;
use repo_updater::error::{SchedulerError, SyncError, SyncErrorKind};
use repo_updater::job_store::{JobStore, MemoryJobStore};
use repo_updater::observability::{LocalCollector, SyncMetrics};
use repo_updater::scheduler::{RepoLifecycle, TickOutcome};
use repo_updater::strategy::StrategyRegistry;
use repo_updater::sync_executor::ExecutorConfig;
use repo_updater::types::{Family, JobState, RepoId};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use test_utils::{
    Call, ScriptedStrategy, build_executor, build_scheduler, fast_executor_config, git_spec,
};

fn registry_with(strategy: Arc<ScriptedStrategy>) -> StrategyRegistry {
    let mut registry = StrategyRegistry::new();
    registry.register(strategy);
    registry
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

#[tokio::test]
async fn unreachable_origin_backs_off_by_base_delay() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let scheduler = build_scheduler(store.clone(), SyncMetrics::new(), Arc::new(SystemClock));
    let strategy = Arc::new(ScriptedStrategy::new(Family::Git));
    strategy.push_result(Err(SyncError::unreachable("connection refused")));
    let executor = build_executor(
        scheduler.clone(),
        registry_with(strategy.clone()),
        dir.path(),
        SyncMetrics::new(),
        fast_executor_config(),
    );

    scheduler.register(git_spec(1, "github.com/acme/widgets"));
    let TickOutcome::Dispatched(dispatch) = scheduler.tick().await else {
        panic!("expected a dispatch");
    };
    let before = Utc::now();
    let outcome = executor.execute(dispatch).await;
    let after = Utc::now();

    assert_eq!(outcome.error().map(|e| e.kind), Some(SyncErrorKind::Unreachable));
    let status = scheduler.status(RepoId(1)).unwrap();
    assert_eq!(status.consecutive_failures, 1);
    assert_eq!(status.state, RepoLifecycle::Idle);
    let next_due = status.next_due.unwrap();
    assert!(next_due >= before + chrono::Duration::seconds(30));
    assert!(next_due <= after + chrono::Duration::seconds(30));

    let last = store.last_outcome(RepoId(1)).await.unwrap().unwrap();
    assert_eq!(last.state, JobState::Errored);
    assert!(last.started_at.is_some());
    assert!(!dir.path().join("github.com/acme/widgets").exists());
}

#[tokio::test]
async fn immediate_sync_while_running_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let scheduler = build_scheduler(store.clone(), SyncMetrics::new(), Arc::new(SystemClock));
    let strategy =
        Arc::new(ScriptedStrategy::new(Family::Git).with_delay(Duration::from_millis(200)));
    let executor = build_executor(
        scheduler.clone(),
        registry_with(strategy.clone()),
        dir.path(),
        SyncMetrics::new(),
        fast_executor_config(),
    );

    scheduler.register(git_spec(1, "github.com/acme/widgets"));
    let TickOutcome::Dispatched(dispatch) = scheduler.tick().await else {
        panic!("expected a dispatch");
    };
    let running = tokio::spawn({
        let executor = executor.clone();
        async move { executor.execute(dispatch).await }
    });

    assert_eq!(
        scheduler.request_immediate_sync(RepoId(1)),
        Err(SchedulerError::AlreadySyncing { repo_id: RepoId(1) })
    );
    assert!(running.await.unwrap().is_success());

    // Accepted again once the job is done.
    scheduler.request_immediate_sync(RepoId(1)).unwrap();
    assert_eq!(store.history(RepoId(1), 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn run_loop_materializes_then_updates_and_stops_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let collector = LocalCollector::new();
    let metrics = SyncMetrics::with_recorder(&collector);
    let scheduler = build_scheduler(store.clone(), metrics.clone(), Arc::new(SystemClock));
    let strategy = Arc::new(ScriptedStrategy::new(Family::Git));
    let executor = build_executor(
        scheduler.clone(),
        registry_with(strategy.clone()),
        dir.path(),
        metrics,
        fast_executor_config(),
    );

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(executor.run(shutdown.clone()));

    scheduler.register(git_spec(1, "github.com/acme/widgets"));
    wait_for(|| strategy.calls().len() == 1 && !scheduler.is_running(RepoId(1))).await;
    assert!(dir.path().join("github.com/acme/widgets/HEAD").exists());

    scheduler.request_immediate_sync(RepoId(1)).unwrap();
    wait_for(|| strategy.calls().len() == 2 && !scheduler.is_running(RepoId(1))).await;
    assert_eq!(strategy.calls(), vec![Call::Materialize, Call::Incremental]);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("executor stops after shutdown")
        .unwrap();

    let history = store.history(RepoId(1), 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|job| job.state == JobState::Completed));
    assert_eq!(
        collector.counter(
            "repo_updater_sync_attempts_total",
            &[("outcome", "success"), ("trigger", "manual")]
        ),
        1
    );
    assert_eq!(
        collector
            .histogram(
                "repo_updater_sync_duration_seconds",
                &[("success", "true"), ("family", "git")]
            )
            .len(),
        2
    );
}

#[tokio::test]
async fn slow_strategy_times_out() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let scheduler = build_scheduler(store.clone(), SyncMetrics::new(), Arc::new(SystemClock));
    let strategy = Arc::new(ScriptedStrategy::new(Family::Git).with_delay(Duration::from_secs(30)));
    let executor = build_executor(
        scheduler.clone(),
        registry_with(strategy),
        dir.path(),
        SyncMetrics::new(),
        ExecutorConfig {
            job_timeout: Duration::from_millis(50),
            ..fast_executor_config()
        },
    );

    scheduler.register(git_spec(1, "github.com/acme/slow"));
    let TickOutcome::Dispatched(dispatch) = scheduler.tick().await else {
        panic!("expected a dispatch");
    };
    let outcome = executor.execute(dispatch).await;

    assert_eq!(outcome.error().map(|e| e.kind), Some(SyncErrorKind::Timeout));
    let status = scheduler.status(RepoId(1)).unwrap();
    assert_eq!(status.consecutive_failures, 1);
    assert!(store.in_flight(RepoId(1)).await.unwrap().is_none());
}

#[tokio::test]
async fn missing_strategy_and_panics_become_outcomes() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let scheduler = build_scheduler(store.clone(), SyncMetrics::new(), Arc::new(SystemClock));
    let strategy = Arc::new(ScriptedStrategy::new(Family::Git).panicking());
    let executor = build_executor(
        scheduler.clone(),
        registry_with(strategy),
        dir.path(),
        SyncMetrics::new(),
        fast_executor_config(),
    );

    scheduler.register(test_utils::npm_spec(1, "left-pad@1.3.0"));
    scheduler.register(git_spec(2, "github.com/acme/boom"));

    let TickOutcome::Dispatched(npm) = scheduler.tick().await else {
        panic!("expected a dispatch");
    };
    let outcome = executor.execute(npm).await;
    assert_eq!(outcome.error().map(|e| e.kind), Some(SyncErrorKind::Storage));

    let TickOutcome::Dispatched(git) = scheduler.tick().await else {
        panic!("expected a dispatch");
    };
    let outcome = executor.execute(git).await;
    let err = outcome.error().expect("panic becomes an error outcome");
    assert_eq!(err.kind, SyncErrorKind::Storage);
    assert!(err.message.contains("did not complete"), "{err}");
    assert_eq!(
        store.last_outcome(RepoId(2)).await.unwrap().unwrap().error.map(|e| e.kind),
        Some(SyncErrorKind::Storage)
    );

    for repo in [RepoId(1), RepoId(2)] {
        assert!(!scheduler.is_running(repo));
        assert_eq!(scheduler.status(repo).unwrap().consecutive_failures, 1);
    }
}

#[tokio::test]
async fn jobs_for_one_repository_never_overlap() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let scheduler = build_scheduler(store.clone(), SyncMetrics::new(), Arc::new(SystemClock));
    let strategy =
        Arc::new(ScriptedStrategy::new(Family::Git).with_delay(Duration::from_millis(100)));
    let executor = build_executor(
        scheduler.clone(),
        registry_with(strategy.clone()),
        dir.path(),
        SyncMetrics::new(),
        fast_executor_config(),
    );

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(executor.run(shutdown.clone()));

    scheduler.register(git_spec(1, "github.com/acme/widgets"));
    wait_for(|| scheduler.is_running(RepoId(1))).await;
    // Re-registering an active repository does not queue another sync.
    assert!(!scheduler.register(git_spec(1, "github.com/acme/widgets")));
    assert!(store.in_flight(RepoId(1)).await.unwrap().is_some());

    wait_for(|| !scheduler.is_running(RepoId(1))).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(strategy.calls().len(), 1);
    let outcome = store.last_outcome(RepoId(1)).await.unwrap().unwrap();
    assert_eq!(outcome.changes, Some(1));
}
