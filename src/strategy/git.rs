//! Conventional git remotes, mirrored as bare repositories.

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::{Destination, GitCommand, RemoteInfo, SyncStrategy};
use crate::error::SyncError;
use crate::storage::{create_staging_dir, publish};
use crate::types::{Family, UpdateSummary};

#[derive(Debug, Clone)]
pub struct GitStrategy {
    git: GitCommand,
}

impl GitStrategy {
    pub fn new(git: GitCommand) -> Self {
        Self { git }
    }
}

#[async_trait]
impl SyncStrategy for GitStrategy {
    fn family(&self) -> Family {
        Family::Git
    }

    #[instrument(skip(self))]
    async fn is_cloneable(&self, origin: &str) -> Result<(), SyncError> {
        check_origin(origin)?;
        self.git
            .run_remote(None, &["ls-remote", "--exit-code", origin, "HEAD"])
            .await
            .map(|_| ())
    }

    #[instrument(skip(self, destination), fields(destination = %destination.path().display()))]
    async fn materialize(
        &self,
        origin: &str,
        destination: &Destination,
    ) -> Result<UpdateSummary, SyncError> {
        check_origin(origin)?;
        if destination.is_materialized() {
            debug!("Mirror already present; nothing to materialize");
            return Ok(UpdateSummary::no_op());
        }

        let staged = create_staging_dir(destination.staging_root()).await?;
        let staged = scopeguard::guard(staged, |path| {
            if let Err(err) = std::fs::remove_dir_all(&path) {
                warn!(path = %path.display(), error = %err, "Failed to clean up staging directory");
            }
        });

        let staged_str = staged.to_string_lossy().into_owned();
        self.git
            .run_remote(None, &["clone", "--mirror", "--quiet", "--", origin, &staged_str])
            .await?;

        let refs = self.git.refs(&staged).await?;
        publish(&staged, destination.path()).await?;
        // Published: nothing left to clean up.
        let _ = scopeguard::ScopeGuard::into_inner(staged);

        info!(refs = refs.len(), "Mirrored repository");
        Ok(UpdateSummary::changed(refs.len() as u64))
    }

    #[instrument(skip(self, destination), fields(destination = %destination.path().display()))]
    async fn incremental_update(
        &self,
        origin: &str,
        destination: &Destination,
    ) -> Result<UpdateSummary, SyncError> {
        check_origin(origin)?;
        let git_dir = destination.path();
        let before = self.git.refs(git_dir).await?;

        // The origin URL may have been rotated since the mirror was made.
        self.git
            .run_local(Some(git_dir), &["remote", "set-url", "origin", origin])
            .await?;
        self.git
            .run_remote(Some(git_dir), &["remote", "update", "--prune"])
            .await?;

        let after = self.git.refs(git_dir).await?;
        let changed = after
            .iter()
            .filter(|(name, object)| before.get(*name) != Some(*object))
            .count()
            + before.keys().filter(|name| !after.contains_key(*name)).count();

        debug!(changed, "Fetched remote updates");
        Ok(UpdateSummary::changed(changed as u64))
    }

    #[instrument(skip(self))]
    async fn describe_remote(&self, origin: &str) -> Result<RemoteInfo, SyncError> {
        check_origin(origin)?;
        let stdout = self
            .git
            .run_remote(None, &["ls-remote", "--symref", origin, "HEAD"])
            .await?;
        Ok(parse_symref_listing(&stdout))
    }
}

/// Origins are passed to git positionally and must not parse as options.
fn check_origin(origin: &str) -> Result<(), SyncError> {
    if origin.is_empty() || origin.starts_with('-') {
        return Err(SyncError::not_found(format!("invalid git origin '{origin}'")));
    }
    Ok(())
}

/// Parses `git ls-remote --symref <origin> HEAD` output.
fn parse_symref_listing(stdout: &str) -> RemoteInfo {
    let mut info = RemoteInfo::default();
    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix("ref: ") {
            if let Some((target, _)) = rest.split_once('\t') {
                info.default_branch = Some(
                    target
                        .strip_prefix("refs/heads/")
                        .unwrap_or(target)
                        .to_string(),
                );
            }
        } else if let Some((object, name)) = line.split_once('\t') {
            if name == "HEAD" {
                info.head = Some(object.to_string());
            }
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_symref_listing() {
        let stdout = "ref: refs/heads/trunk\tHEAD\n\
                      3f786850e387550fdab836ed7e6dc881de23001b\tHEAD\n";
        let info = parse_symref_listing(stdout);
        assert_eq!(info.default_branch.as_deref(), Some("trunk"));
        assert_eq!(
            info.head.as_deref(),
            Some("3f786850e387550fdab836ed7e6dc881de23001b")
        );
        assert!(info.version.is_none());
    }

    #[test]
    fn option_like_origins_are_rejected() {
        assert!(check_origin("--upload-pack=touch /tmp/pwned").is_err());
        assert!(check_origin("").is_err());
        assert!(check_origin("https://github.com/acme/widgets.git").is_ok());
    }

    #[test]
    fn detached_remote_head_has_no_branch() {
        let info = parse_symref_listing("3f786850e387550fdab836ed7e6dc881de23001b\tHEAD\n");
        assert!(info.default_branch.is_none());
        assert!(info.head.is_some());
    }
}
