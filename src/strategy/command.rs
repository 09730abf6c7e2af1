//! Thin async wrapper around the `git` binary.
//!
//! Every invocation runs non-interactively (no terminal or askpass prompts,
//! stdin closed) and is killed if its future is dropped, so a job timeout
//! never leaves a `git` process behind.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::{SyncError, SyncErrorKind};

/// Author and committer date of synthetic revisions (2000-01-01T00:00:00Z).
pub const SYNTHETIC_DATE: &str = "946684800 +0000";
pub const SYNTHETIC_NAME: &str = "repo-updater";
pub const SYNTHETIC_EMAIL: &str = "repo-updater@localhost";

/// Branch synthetic revisions are committed to.
pub const SYNTHETIC_BRANCH: &str = "main";

#[derive(Debug, Clone)]
pub struct GitCommand {
    binary: String,
}

impl GitCommand {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Whether the configured binary can be executed at all.
    pub async fn is_available(&self) -> bool {
        self.base_command(None)
            .arg("--version")
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Runs a command that talks to a remote; unclassified failures are `Unreachable`.
    pub async fn run_remote(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String, SyncError> {
        self.run(cwd, args, SyncErrorKind::Unreachable).await
    }

    /// Runs a purely local command; unclassified failures are `Storage`.
    pub async fn run_local(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String, SyncError> {
        self.run(cwd, args, SyncErrorKind::Storage).await
    }

    async fn run(
        &self,
        cwd: Option<&Path>,
        args: &[&str],
        fallback: SyncErrorKind,
    ) -> Result<String, SyncError> {
        debug!(git = %self.binary, ?args, "Running git");

        let output = self.base_command(cwd).args(args).output().await.map_err(|err| {
            SyncError::storage(format!("failed to execute {}: {err}", self.binary))
        })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let subcommand = args.first().copied().unwrap_or("git");
        let message = if stderr.is_empty() {
            format!("git {subcommand} exited with {}", output.status)
        } else {
            format!("git {subcommand}: {stderr}")
        };

        Err(SyncError::new(classify_stderr(stderr, fallback), message))
    }

    /// Commits the whole of `worktree` as a single deterministic revision on
    /// [`SYNTHETIC_BRANCH`] and tags it.
    ///
    /// Identity, dates and config are pinned so the same tree always yields
    /// the same commit id.
    pub async fn commit_snapshot(
        &self,
        worktree: &Path,
        message: &str,
        tag: &str,
    ) -> Result<(), SyncError> {
        let head_ref = format!("refs/heads/{SYNTHETIC_BRANCH}");

        self.run_local(Some(worktree), &["init", "-q", "--template="])
            .await?;
        self.run_local(Some(worktree), &["symbolic-ref", "HEAD", &head_ref])
            .await?;
        self.run_local(Some(worktree), &["add", "-A", "-f", "--", "."])
            .await?;

        self.run_local(
            Some(worktree),
            &["commit", "-q", "--no-verify", "--allow-empty", "-m", message],
        )
        .await?;

        self.run_local(Some(worktree), &["tag", tag]).await?;
        Ok(())
    }

    /// `refname -> object id` for every ref in `git_dir`.
    pub async fn refs(&self, git_dir: &Path) -> Result<BTreeMap<String, String>, SyncError> {
        let git_dir = git_dir.to_string_lossy();
        let stdout = self
            .run_local(
                None,
                &[
                    "--git-dir",
                    &git_dir,
                    "for-each-ref",
                    "--format=%(objectname) %(refname)",
                ],
            )
            .await?;

        Ok(stdout
            .lines()
            .filter_map(|line| line.split_once(' '))
            .map(|(object, refname)| (refname.to_string(), object.to_string()))
            .collect())
    }

    fn base_command(&self, cwd: Option<&Path>) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args([
                "-c",
                "core.autocrlf=false",
                "-c",
                "commit.gpgsign=false",
                "-c",
                "tag.gpgsign=false",
            ])
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_ASKPASS", "")
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("GIT_AUTHOR_NAME", SYNTHETIC_NAME)
            .env("GIT_AUTHOR_EMAIL", SYNTHETIC_EMAIL)
            .env("GIT_AUTHOR_DATE", SYNTHETIC_DATE)
            .env("GIT_COMMITTER_NAME", SYNTHETIC_NAME)
            .env("GIT_COMMITTER_EMAIL", SYNTHETIC_EMAIL)
            .env("GIT_COMMITTER_DATE", SYNTHETIC_DATE)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if std::env::var_os("GIT_SSH_COMMAND").is_none() {
            command.env("GIT_SSH_COMMAND", "ssh -o BatchMode=yes");
        }
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        command
    }
}

/// Maps `git` stderr onto the sync error taxonomy.
pub fn classify_stderr(stderr: &str, fallback: SyncErrorKind) -> SyncErrorKind {
    let stderr = stderr.to_ascii_lowercase();

    const PERMISSION: [&str; 6] = [
        "authentication failed",
        "permission denied",
        "could not read username",
        "terminal prompts disabled",
        "the requested url returned error: 401",
        "the requested url returned error: 403",
    ];
    const NOT_FOUND: [&str; 5] = [
        "repository not found",
        "does not appear to be a git repository",
        "the requested url returned error: 404",
        "not found",
        "does not exist",
    ];
    const UNREACHABLE: [&str; 7] = [
        "could not resolve host",
        "connection refused",
        "connection timed out",
        "network is unreachable",
        "temporary failure in name resolution",
        "failed to connect",
        "the remote end hung up unexpectedly",
    ];

    if PERMISSION.iter().any(|p| stderr.contains(p)) {
        SyncErrorKind::PermissionDenied
    } else if NOT_FOUND.iter().any(|p| stderr.contains(p)) {
        SyncErrorKind::NotFound
    } else if UNREACHABLE.iter().any(|p| stderr.contains(p)) {
        SyncErrorKind::Unreachable
    } else {
        fallback
    }
}
