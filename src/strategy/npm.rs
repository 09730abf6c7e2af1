//! Repositories synthesized from npm package tarballs.
//!
//! An origin is a package coordinate (`left-pad@1.3.0`,
//! `@scope/pkg@2.0.0`). Materializing downloads the immutable tarball,
//! verifies its integrity digest, unpacks it, writes
//! `package-coordinate.json` and commits the tree as one deterministic
//! revision tagged `v<version>`. Published versions never change, so
//! incremental updates are a no-op.

use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use flate2::read::GzDecoder;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tar::{Archive, EntryType};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{Destination, GitCommand, RemoteInfo, SyncStrategy};
use crate::error::SyncError;
use crate::storage::{create_staging_dir, publish};
use crate::types::{Family, UpdateSummary};

/// Family metadata file written at the root of every synthesized tree.
pub const COORDINATE_FILE: &str = "package-coordinate.json";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// `name@version` split from an npm origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageCoordinate {
    pub name: String,
    pub version: String,
}

impl PackageCoordinate {
    pub fn parse(origin: &str) -> Result<Self, SyncError> {
        let origin = origin.trim();
        let invalid = || SyncError::not_found(format!("invalid npm coordinate '{origin}'"));

        // A leading '@' belongs to the scope, not the version separator.
        let (name, version) = match origin.rfind('@') {
            Some(idx) if idx > 0 => (&origin[..idx], &origin[idx + 1..]),
            _ => return Err(invalid()),
        };

        let valid_name = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~' | '/' | '@'))
            && name.rfind('@').is_none_or(|idx| idx == 0)
            && !name.contains("..")
            && !name.starts_with('.')
            && name.split('/').count() <= 2
            && (!name.contains('/') || name.starts_with('@'));
        let valid_version = !version.is_empty()
            && version
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+' | '_'));

        if !valid_name || !valid_version {
            return Err(invalid());
        }

        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
        })
    }

    /// Registry path segment; scoped names keep their `/` percent-encoded.
    fn registry_path(&self) -> String {
        format!("{}/{}", self.name.replace('/', "%2f"), self.version)
    }
}

impl std::fmt::Display for PackageCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

#[derive(Debug, Deserialize)]
struct VersionManifest {
    #[serde(default)]
    description: Option<String>,
    dist: DistInfo,
}

#[derive(Debug, Deserialize)]
struct DistInfo {
    tarball: String,
    #[serde(default)]
    integrity: Option<String>,
    #[serde(default)]
    shasum: Option<String>,
}

#[derive(Debug, Serialize)]
struct CoordinateFile<'a> {
    kind: &'static str,
    name: &'a str,
    version: &'a str,
}

#[derive(Debug, Clone)]
pub struct NpmStrategy {
    client: Client,
    registry: Url,
    git: GitCommand,
}

impl NpmStrategy {
    pub fn new(registry_url: &str, git: GitCommand) -> Result<Self, SyncError> {
        let mut registry = Url::parse(registry_url)
            .map_err(|err| SyncError::storage(format!("invalid npm registry URL: {err}")))?;
        if !registry.path().ends_with('/') {
            let path = format!("{}/", registry.path());
            registry.set_path(&path);
        }

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("repo-updater/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| SyncError::storage(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            client,
            registry,
            git,
        })
    }

    async fn fetch_manifest(
        &self,
        coordinate: &PackageCoordinate,
    ) -> Result<VersionManifest, SyncError> {
        let url = self
            .registry
            .join(&coordinate.registry_path())
            .map_err(|err| SyncError::not_found(format!("{coordinate}: {err}")))?;

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::from_status(
                status.as_u16(),
                &format!("registry lookup for {coordinate}"),
            ));
        }

        response
            .json::<VersionManifest>()
            .await
            .map_err(|err| SyncError::unreachable(format!("malformed manifest for {coordinate}: {err}")))
    }

    async fn download_tarball(
        &self,
        coordinate: &PackageCoordinate,
        dist: &DistInfo,
    ) -> Result<Vec<u8>, SyncError> {
        let response = self.client.get(&dist.tarball).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::from_status(
                status.as_u16(),
                &format!("tarball download for {coordinate}"),
            ));
        }
        let bytes = response.bytes().await?;
        verify_integrity(coordinate, dist, &bytes)?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl SyncStrategy for NpmStrategy {
    fn family(&self) -> Family {
        Family::Npm
    }

    #[instrument(skip(self))]
    async fn is_cloneable(&self, origin: &str) -> Result<(), SyncError> {
        let coordinate = PackageCoordinate::parse(origin)?;
        self.fetch_manifest(&coordinate).await.map(|_| ())
    }

    #[instrument(skip(self, destination), fields(destination = %destination.path().display()))]
    async fn materialize(
        &self,
        origin: &str,
        destination: &Destination,
    ) -> Result<UpdateSummary, SyncError> {
        let coordinate = PackageCoordinate::parse(origin)?;
        if destination.is_materialized() {
            debug!(%coordinate, "Package already materialized");
            return Ok(UpdateSummary::no_op());
        }

        let manifest = self.fetch_manifest(&coordinate).await?;
        let tarball = self.download_tarball(&coordinate, &manifest.dist).await?;

        let staged = create_staging_dir(destination.staging_root()).await?;
        let staged = scopeguard::guard(staged, |path| {
            if let Err(err) = std::fs::remove_dir_all(&path) {
                warn!(path = %path.display(), error = %err, "Failed to clean up staging directory");
            }
        });

        let target = staged.clone();
        let files = tokio::task::spawn_blocking(move || unpack_package(&tarball, &target))
            .await
            .map_err(|err| SyncError::storage(format!("unpack task failed: {err}")))??;

        let metadata = CoordinateFile {
            kind: "npm",
            name: &coordinate.name,
            version: &coordinate.version,
        };
        let mut contents = serde_json::to_vec_pretty(&metadata)
            .map_err(|err| SyncError::storage(format!("failed to encode {COORDINATE_FILE}: {err}")))?;
        contents.push(b'\n');
        tokio::fs::write(staged.join(COORDINATE_FILE), contents).await?;

        self.git
            .commit_snapshot(
                &staged,
                &coordinate.to_string(),
                &format!("v{}", coordinate.version),
            )
            .await?;

        publish(&staged, destination.path()).await?;
        let _ = scopeguard::ScopeGuard::into_inner(staged);

        info!(%coordinate, files, "Materialized package");
        Ok(UpdateSummary::changed(files as u64 + 1))
    }

    /// Published versions are immutable: there is never anything to fetch.
    async fn incremental_update(
        &self,
        origin: &str,
        _destination: &Destination,
    ) -> Result<UpdateSummary, SyncError> {
        PackageCoordinate::parse(origin)?;
        Ok(UpdateSummary::no_op())
    }

    #[instrument(skip(self))]
    async fn describe_remote(&self, origin: &str) -> Result<RemoteInfo, SyncError> {
        let coordinate = PackageCoordinate::parse(origin)?;
        let manifest = self.fetch_manifest(&coordinate).await?;
        Ok(RemoteInfo {
            head: manifest.dist.shasum,
            default_branch: None,
            version: Some(coordinate.version),
            description: manifest.description,
        })
    }
}

/// Checks `dist.integrity` when it carries a sha512 digest.
fn verify_integrity(
    coordinate: &PackageCoordinate,
    dist: &DistInfo,
    bytes: &[u8],
) -> Result<(), SyncError> {
    let Some(integrity) = dist.integrity.as_deref() else {
        debug!(%coordinate, "Registry published no integrity digest");
        return Ok(());
    };

    // Subresource-integrity strings may list several digests.
    let Some(expected) = integrity
        .split_whitespace()
        .find_map(|entry| entry.strip_prefix("sha512-"))
    else {
        debug!(%coordinate, integrity, "No sha512 digest to verify");
        return Ok(());
    };

    let actual = STANDARD.encode(Sha512::digest(bytes));
    if actual != expected {
        return Err(SyncError::unreachable(format!(
            "integrity mismatch for {coordinate}: expected sha512-{expected}, got sha512-{actual}"
        )));
    }
    Ok(())
}

/// Unpacks an npm tarball into `target`, dropping the leading directory
/// (conventionally `package/`). Returns the number of files written.
fn unpack_package(tarball: &[u8], target: &Path) -> Result<usize, SyncError> {
    let mut archive = Archive::new(GzDecoder::new(tarball));
    archive.set_preserve_permissions(false);
    archive.set_overwrite(true);

    let mut files = 0;
    for entry in archive
        .entries()
        .map_err(|err| SyncError::unreachable(format!("unreadable package tarball: {err}")))?
    {
        let mut entry =
            entry.map_err(|err| SyncError::unreachable(format!("corrupt tarball entry: {err}")))?;

        let entry_type = entry.header().entry_type();
        if !matches!(entry_type, EntryType::Regular | EntryType::Directory) {
            // Links could point outside the tree; npm never publishes them.
            continue;
        }

        let path = entry
            .path()
            .map_err(|err| SyncError::unreachable(format!("invalid tarball path: {err}")))?
            .into_owned();
        let Some(relative) = strip_package_root(&path)? else {
            continue;
        };

        let dest = target.join(&relative);
        if entry_type == EntryType::Directory {
            std::fs::create_dir_all(&dest)?;
            continue;
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).map_err(|err| {
            SyncError::unreachable(format!("truncated tarball entry {}: {err}", path.display()))
        })?;
        std::fs::write(&dest, contents)?;
        files += 1;
    }

    Ok(files)
}

fn strip_package_root(path: &Path) -> Result<Option<PathBuf>, SyncError> {
    let mut relative = PathBuf::new();
    for (idx, component) in path.components().enumerate() {
        match component {
            Component::Normal(part) if idx > 0 => relative.push(part),
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(SyncError::unreachable(format!(
                    "tarball entry escapes package root: {}",
                    path.display()
                )));
            }
        }
    }

    // The package root itself, or the git metadata of a careless publish.
    if relative.as_os_str().is_empty() || relative.starts_with(".git") {
        return Ok(None);
    }
    Ok(Some(relative))
}
