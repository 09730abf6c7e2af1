//! npm strategy against a mocked registry.
//!
//! Tests that commit the synthesized tree need a `git` binary and return
//! early without one.

mod test_utils;

use std::path::Path;
use std::sync::Arc;

use repo_updater::clock::SystemClock;
use repo_updater::error::SyncErrorKind;
use repo_updater::job_store::MemoryJobStore;
use repo_updater::observability::SyncMetrics;
use repo_updater::scheduler::TickOutcome;
use repo_updater::storage::STAGING_DIR;
use repo_updater::strategy::npm::{COORDINATE_FILE, NpmStrategy};
use repo_updater::strategy::{Destination, GitCommand, StrategyRegistry, SyncStrategy};
use repo_updater::types::{JobOutcome, RepoId, UpdateSummary};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use test_utils::{
    build_executor, build_npm_tarball, build_scheduler, fast_executor_config, git_available,
    npm_spec, sha512_integrity,
};

const ORIGIN: &str = "left-pad@1.3.0";

struct Registry {
    server: MockServer,
}

impl Registry {
    /// Serves `left-pad@1.3.0`; `integrity` overrides the published digest.
    async fn start(integrity: Option<String>) -> Self {
        let server = MockServer::start().await;
        let tarball = build_npm_tarball(&[
            ("package.json", r#"{"name":"left-pad","version":"1.3.0"}"#),
            ("index.js", "module.exports = leftPad;\n"),
            ("lib/pad.js", "function leftPad() {}\n"),
        ]);
        let integrity = integrity.unwrap_or_else(|| sha512_integrity(&tarball));

        Mock::given(method("GET"))
            .and(path("/left-pad/1.3.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "left-pad",
                "version": "1.3.0",
                "description": "String left pad",
                "dist": {
                    "tarball": format!("{}/tarballs/left-pad-1.3.0.tgz", server.uri()),
                    "integrity": integrity,
                    "shasum": "5b51c77a4b9c3f6e8e4e4e5b3f2d0a15d2c3aa11"
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tarballs/left-pad-1.3.0.tgz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(tarball))
            .mount(&server)
            .await;

        Self { server }
    }

    fn strategy(&self) -> NpmStrategy {
        NpmStrategy::new(&self.server.uri(), GitCommand::new("git")).unwrap()
    }
}

fn destination(root: &Path, name: &str) -> Destination {
    Destination::new(root.join(name), root.join(STAGING_DIR))
}

fn git_output(dir: &Path, args: &[&str]) -> String {
    let output = std::process::Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .unwrap();
    assert!(output.status.success(), "git {args:?} failed");
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

fn staging_is_empty(root: &Path) -> bool {
    match std::fs::read_dir(root.join(STAGING_DIR)) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

#[tokio::test]
async fn materialized_trees_are_deterministic() {
    if !git_available().await {
        return;
    }
    let registry = Registry::start(None).await;
    let strategy = registry.strategy();
    let root = TempDir::new().unwrap();

    let first = destination(root.path(), "npm/left-pad");
    let second = destination(root.path(), "mirror/left-pad");
    let summary = strategy.materialize(ORIGIN, &first).await.unwrap();
    assert_eq!(summary, UpdateSummary::changed(4));
    strategy.materialize(ORIGIN, &second).await.unwrap();

    let head = git_output(first.path(), &["rev-parse", "HEAD"]);
    assert_eq!(head, git_output(second.path(), &["rev-parse", "HEAD"]));
    assert_eq!(git_output(first.path(), &["tag", "--list"]), "v1.3.0");
    assert!(first.path().join("lib/pad.js").exists());

    let coordinate: serde_json::Value =
        serde_json::from_slice(&std::fs::read(first.path().join(COORDINATE_FILE)).unwrap())
            .unwrap();
    assert_eq!(
        coordinate,
        json!({"kind": "npm", "name": "left-pad", "version": "1.3.0"})
    );
    assert!(staging_is_empty(root.path()));
}

#[tokio::test]
async fn incremental_update_is_a_no_op() {
    let registry = Registry::start(None).await;
    let root = TempDir::new().unwrap();

    let summary = registry
        .strategy()
        .incremental_update(ORIGIN, &destination(root.path(), "npm/left-pad"))
        .await
        .unwrap();
    assert_eq!(summary, UpdateSummary::no_op());
    // Nothing was fetched.
    assert!(registry.server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn unpublished_versions_are_not_found() {
    let registry = Registry::start(None).await;
    let strategy = registry.strategy();
    let root = TempDir::new().unwrap();

    let err = strategy
        .materialize("left-pad@9.9.9", &destination(root.path(), "npm/left-pad"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, SyncErrorKind::NotFound);
    assert!(err.needs_attention());

    let err = strategy.is_cloneable("left-pad@9.9.9").await.unwrap_err();
    assert_eq!(err.kind, SyncErrorKind::NotFound);
    strategy.is_cloneable(ORIGIN).await.unwrap();
}

#[tokio::test]
async fn integrity_mismatch_leaves_nothing_behind() {
    let registry = Registry::start(Some(sha512_integrity(b"something else"))).await;
    let root = TempDir::new().unwrap();
    let destination = destination(root.path(), "npm/left-pad");

    let err = registry
        .strategy()
        .materialize(ORIGIN, &destination)
        .await
        .unwrap_err();
    assert!(err.message.contains("integrity mismatch"), "{err}");
    assert!(!destination.path().exists());
    assert!(staging_is_empty(root.path()));
}

#[tokio::test]
async fn describe_remote_reports_the_published_version() {
    let registry = Registry::start(None).await;

    let info = registry.strategy().describe_remote(ORIGIN).await.unwrap();
    assert_eq!(info.version.as_deref(), Some("1.3.0"));
    assert_eq!(info.description.as_deref(), Some("String left pad"));
    assert!(info.head.is_some());
    assert!(info.default_branch.is_none());
}

#[tokio::test]
async fn artifact_repository_syncs_then_stays_unchanged() {
    if !git_available().await {
        return;
    }
    let registry = Registry::start(None).await;
    let root = TempDir::new().unwrap();
    let scheduler = build_scheduler(
        Arc::new(MemoryJobStore::new()),
        SyncMetrics::new(),
        Arc::new(SystemClock),
    );
    let mut strategies = StrategyRegistry::new();
    strategies.register(Arc::new(registry.strategy()));
    let executor = build_executor(
        scheduler.clone(),
        strategies,
        root.path(),
        SyncMetrics::new(),
        fast_executor_config(),
    );

    scheduler.register(npm_spec(1, ORIGIN));
    let TickOutcome::Dispatched(first) = scheduler.tick().await else {
        panic!("expected a dispatch");
    };
    let outcome = executor.execute(first).await;
    assert_eq!(outcome, JobOutcome::Completed(UpdateSummary::changed(4)));
    assert!(root.path().join("npm/left-pad/.git").is_dir());

    scheduler.request_immediate_sync(RepoId(1)).unwrap();
    let TickOutcome::Dispatched(second) = scheduler.tick().await else {
        panic!("expected a dispatch");
    };
    let outcome = executor.execute(second).await;
    assert_eq!(outcome, JobOutcome::Completed(UpdateSummary::no_op()));
    assert_eq!(scheduler.status(RepoId(1)).unwrap().consecutive_failures, 0);
}
