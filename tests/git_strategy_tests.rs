//! Git strategy against local source repositories.
//!
//! Every test needs a `git` binary and returns early without one.

mod test_utils;

use std::path::Path;
use std::process::Command;

use repo_updater::error::SyncErrorKind;
use repo_updater::storage::STAGING_DIR;
use repo_updater::strategy::git::GitStrategy;
use repo_updater::strategy::{Destination, GitCommand, SyncStrategy};
use tempfile::TempDir;

use test_utils::git_available;

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
        .args(["-c", "commit.gpgsign=false"])
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?}: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

/// A source repository on `main` with one commit.
fn source_repo(dir: &Path) -> String {
    std::fs::create_dir_all(dir).unwrap();
    git(dir, &["init", "-q"]);
    git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    commit(dir, "README.md", "# widgets\n");
    dir.to_string_lossy().into_owned()
}

fn commit(dir: &Path, file: &str, contents: &str) {
    std::fs::write(dir.join(file), contents).unwrap();
    git(dir, &["add", file]);
    git(dir, &["commit", "-q", "-m", &format!("update {file}")]);
}

fn strategy() -> GitStrategy {
    GitStrategy::new(GitCommand::new("git"))
}

#[tokio::test]
async fn mirrors_then_fetches_new_commits() {
    if !git_available().await {
        return;
    }
    let workspace = TempDir::new().unwrap();
    let source = workspace.path().join("source");
    let origin = source_repo(&source);
    let root = workspace.path().join("repos");
    let destination = Destination::new(root.join("local/widgets"), root.join(STAGING_DIR));

    let summary = strategy().materialize(&origin, &destination).await.unwrap();
    assert!(summary.changes >= 1);
    assert!(destination.is_materialized());
    assert_eq!(
        git(destination.path(), &["rev-parse", "refs/heads/main"]),
        git(&source, &["rev-parse", "HEAD"])
    );

    let summary = strategy()
        .incremental_update(&origin, &destination)
        .await
        .unwrap();
    assert_eq!(summary.changes, 0);

    commit(&source, "lib.rs", "pub fn widget() {}\n");
    git(&source, &["branch", "feature"]);
    let summary = strategy()
        .incremental_update(&origin, &destination)
        .await
        .unwrap();
    assert_eq!(summary.changes, 2);
    assert_eq!(
        git(destination.path(), &["rev-parse", "refs/heads/feature"]),
        git(&source, &["rev-parse", "HEAD"])
    );

    // Deleted branches are pruned and counted.
    git(&source, &["branch", "-D", "feature"]);
    let summary = strategy()
        .incremental_update(&origin, &destination)
        .await
        .unwrap();
    assert_eq!(summary.changes, 1);
}

#[tokio::test]
async fn checks_and_describes_the_remote() {
    if !git_available().await {
        return;
    }
    let workspace = TempDir::new().unwrap();
    let source = workspace.path().join("source");
    let origin = source_repo(&source);

    strategy().is_cloneable(&origin).await.unwrap();

    let info = strategy().describe_remote(&origin).await.unwrap();
    assert_eq!(info.default_branch.as_deref(), Some("main"));
    assert_eq!(info.head, Some(git(&source, &["rev-parse", "HEAD"])));
}

#[tokio::test]
async fn missing_and_unreachable_origins_are_classified() {
    if !git_available().await {
        return;
    }
    let workspace = TempDir::new().unwrap();
    let root = workspace.path().join("repos");

    let missing = workspace.path().join("does-not-exist");
    let err = strategy()
        .is_cloneable(&missing.to_string_lossy())
        .await
        .unwrap_err();
    assert_eq!(err.kind, SyncErrorKind::NotFound);

    let destination = Destination::new(root.join("local/offline"), root.join(STAGING_DIR));
    let err = strategy()
        .materialize("https://127.0.0.1:1/x.git", &destination)
        .await
        .unwrap_err();
    assert_eq!(err.kind, SyncErrorKind::Unreachable);
    assert!(!destination.path().exists());
    let staged: Vec<_> = std::fs::read_dir(root.join(STAGING_DIR))
        .map(|entries| entries.collect())
        .unwrap_or_default();
    assert!(staged.is_empty());
}
