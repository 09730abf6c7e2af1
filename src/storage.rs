//! On-disk layout of materialized repositories.
//!
//! Repositories live at `<root>/<name>` where `name` is the origin-qualified
//! repository name (`github.com/acme/widgets`, `npm/left-pad`). Strategies
//! build into `<root>/.tmp/<uuid>` and publish with a single rename.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::StorageError;
use crate::types::RepoName;

/// Staging directory name under the storage root; never a repository.
pub const STAGING_DIR: &str = ".tmp";

const PUBLISH_ATTEMPTS: u32 = 3;

#[async_trait]
pub trait RepoStorage: Send + Sync {
    fn path_for(&self, name: &RepoName) -> Result<PathBuf, StorageError>;

    /// Root that strategies stage under.
    fn staging_root(&self) -> PathBuf;

    async fn is_materialized(&self, name: &RepoName) -> Result<bool, StorageError>;

    /// Every published repository found under the root.
    async fn list_materialized(&self) -> Result<Vec<RepoName>, StorageError>;

    async fn remove(&self, name: &RepoName) -> Result<(), StorageError>;
}

/// Filesystem-backed storage rooted at `REPO_UPDATER_REPOS_DIR`.
#[derive(Debug, Clone)]
pub struct FsRepoStorage {
    root: PathBuf,
}

impl FsRepoStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the root and staging directories, and clears stale staging
    /// directories left by an interrupted process.
    pub async fn prepare(&self) -> Result<(), StorageError> {
        let staging = self.staging_root();
        if fs::try_exists(&staging).await.unwrap_or(false) {
            fs::remove_dir_all(&staging)
                .await
                .map_err(|source| io_error(&staging, source))?;
        }
        fs::create_dir_all(&staging)
            .await
            .map_err(|source| io_error(&staging, source))
    }
}

#[async_trait]
impl RepoStorage for FsRepoStorage {
    fn path_for(&self, name: &RepoName) -> Result<PathBuf, StorageError> {
        let invalid = || StorageError::InvalidName {
            name: name.to_string(),
        };

        let mut path = self.root.clone();
        let mut components = 0;
        for part in name.as_str().split('/') {
            if part.is_empty()
                || part.starts_with('.')
                || part.contains('\\')
                || !matches!(Path::new(part).components().next(), Some(Component::Normal(_)))
            {
                return Err(invalid());
            }
            path.push(part);
            components += 1;
        }

        if components == 0 {
            return Err(invalid());
        }
        Ok(path)
    }

    fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    async fn is_materialized(&self, name: &RepoName) -> Result<bool, StorageError> {
        let path = self.path_for(name)?;
        fs::try_exists(&path)
            .await
            .map_err(|source| io_error(&path, source))
    }

    async fn list_materialized(&self) -> Result<Vec<RepoName>, StorageError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || scan_repositories(&root))
            .await
            .map_err(|err| StorageError::Io {
                path: self.root.clone(),
                source: std::io::Error::other(err),
            })?
    }

    async fn remove(&self, name: &RepoName) -> Result<(), StorageError> {
        let path = self.path_for(name)?;
        match fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(io_error(&path, source)),
        }

        // Drop empty parents such as `github.com/acme` once their last repo is gone.
        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir == self.root {
                break;
            }
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            parent = dir.parent();
        }

        debug!(repo = %name, path = %path.display(), "Removed repository data");
        Ok(())
    }
}

/// A directory holds a repository when it is a bare clone (`HEAD` plus
/// `objects/`) or a working tree with a `.git` directory.
pub fn is_repository_dir(path: &Path) -> bool {
    path.join(".git").is_dir() || (path.join("HEAD").is_file() && path.join("objects").is_dir())
}

fn scan_repositories(root: &Path) -> Result<Vec<RepoName>, StorageError> {
    let mut names = Vec::new();
    if !root.exists() {
        return Ok(names);
    }

    let mut entries = WalkDir::new(root).min_depth(1).follow_links(false).into_iter();
    while let Some(entry) = entries.next() {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }

        if entry.depth() == 1 && entry.file_name() == STAGING_DIR {
            entries.skip_current_dir();
            continue;
        }

        if !is_repository_dir(entry.path()) {
            continue;
        }

        match entry
            .path()
            .strip_prefix(root)
            .ok()
            .and_then(relative_name)
        {
            Some(name) => names.push(name),
            None => warn!(path = %entry.path().display(), "Skipping repository with a non UTF-8 path"),
        }
        entries.skip_current_dir();
    }

    names.sort();
    Ok(names)
}

fn relative_name(relative: &Path) -> Option<RepoName> {
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    parts.map(|parts| RepoName::new(parts.join("/")))
}

/// Fresh private build directory under `staging_root`.
pub async fn create_staging_dir(staging_root: &Path) -> Result<PathBuf, StorageError> {
    let path = staging_root.join(Uuid::new_v4().to_string());
    fs::create_dir_all(&path)
        .await
        .map_err(|source| io_error(&path, source))?;
    Ok(path)
}

/// Moves a fully built directory into place.
///
/// Removing a sibling repository prunes empty parents, which can race with
/// creating them here; a vanished parent is recreated and the move retried.
pub async fn publish(staged: &Path, destination: &Path) -> Result<(), StorageError> {
    let mut attempt = 1;
    loop {
        match move_into_place(staged, destination).await {
            Ok(()) => return Ok(()),
            Err(err)
                if err.kind() == std::io::ErrorKind::NotFound
                    && attempt < PUBLISH_ATTEMPTS
                    && fs::try_exists(staged).await.unwrap_or(false) =>
            {
                debug!(
                    path = %destination.display(),
                    attempt,
                    "Destination parent vanished; retrying publish"
                );
                attempt += 1;
            }
            Err(source) => return Err(io_error(destination, source)),
        }
    }
}

async fn move_into_place(staged: &Path, destination: &Path) -> std::io::Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::rename(staged, destination).await
}

fn io_error(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}
