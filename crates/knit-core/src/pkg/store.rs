//! Content store and the registry-backed [`FetchGate`].
//!
//! Each package identity owns one directory:
//!
//! ```text
//! <store>/<identity>/package/     unpacked content
//! <store>/<identity>/index.json   file index + integrity
//! ```
//!
//! The index is written last, so a directory without one is an interrupted
//! unpack and is fetched again.
//!
//! `<store>/usages.json` lists the projects linked to each identity; the
//! number of projects is the identity's reference count.

use super::dep_path;
use super::error::PkgError;
use super::fetch::{
    ready, spawn_shared, FetchGate, FetchHandles, FileEntry, PackageContentInfo, ResolveHints,
    ResolvedPackage,
};
use super::lockfile::{DirectoryTag, GitTag, LockResolution};
use super::manifest::Manifest;
use super::registry::{get_integrity, get_tarball_url, get_version_manifest, RegistryClient};
use super::spec::{PackageSpec, SpecKind};
use super::tarball::{download_tarball, extract_tgz_atomic, read_local_tarball};
use super::version::resolve_version;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use walkdir::WalkDir;

const INDEX_FILE: &str = "index.json";
const USAGES_FILE: &str = "usages.json";

/// Where the unpacked content of `id` lives.
#[must_use]
pub fn package_dir(store: &Path, id: &str) -> PathBuf {
    store.join(dep_path::sanitize(id)).join("package")
}

fn index_path(store: &Path, id: &str) -> PathBuf {
    store.join(dep_path::sanitize(id)).join(INDEX_FILE)
}

/// What `index.json` records for one package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreIndex {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    pub files: BTreeMap<String, FileEntry>,
}

/// Read the index of `id`, or `None` if the package is not fully stored.
///
/// # Errors
/// Returns `PKG_STORE_ERROR` if an index exists but cannot be parsed.
pub fn read_index(store: &Path, id: &str) -> Result<Option<StoreIndex>, PkgError> {
    let path = index_path(store, id);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !package_dir(store, id).is_dir() {
        return Ok(None);
    }
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| PkgError::store_error(format!("Corrupt index {}: {e}", path.display())))
}

/// Identity → projects whose `node_modules` hold it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreUsages(BTreeMap<String, BTreeSet<PathBuf>>);

impl StoreUsages {
    /// # Errors
    /// Returns `PKG_STORE_ERROR` if the file exists but cannot be parsed.
    pub fn read(store: &Path) -> Result<Self, PkgError> {
        let path = store.join(USAGES_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(PkgError::store_error(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        serde_json::from_str(&content)
            .map_err(|e| PkgError::store_error(format!("Corrupt {}: {e}", path.display())))
    }

    /// # Errors
    /// Returns `PKG_STORE_ERROR` if the file cannot be written.
    pub fn write(&self, store: &Path) -> Result<(), PkgError> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| PkgError::store_error(format!("Failed to serialize usages: {e}")))?;
        knit_util::fs::atomic_write(&store.join(USAGES_FILE), &json)
            .map_err(|e| PkgError::store_error(format!("Failed to write usages: {e}")))
    }

    #[must_use]
    pub fn count(&self, id: &str) -> usize {
        self.0.get(id).map_or(0, BTreeSet::len)
    }

    fn add(&mut self, id: &str, project: &Path) -> bool {
        self.0
            .entry(id.to_string())
            .or_default()
            .insert(project.to_path_buf())
    }

    fn remove(&mut self, id: &str, project: &Path) -> bool {
        let Some(projects) = self.0.get_mut(id) else {
            return false;
        };
        let removed = projects.remove(project);
        if projects.is_empty() {
            self.0.remove(id);
        }
        removed
    }
}

/// Count `project` as a user of every id.
///
/// # Errors
/// Returns `PKG_STORE_ERROR` if the usages file cannot be read or written.
pub fn add_references(store: &Path, project: &Path, ids: &[String]) -> Result<(), PkgError> {
    let mut usages = StoreUsages::read(store)?;
    let mut changed = false;
    for id in ids {
        changed |= usages.add(id, project);
    }
    if changed {
        usages.write(store)?;
    }
    Ok(())
}

/// Stop counting `project` as a user of every id.
///
/// # Errors
/// Returns `PKG_STORE_ERROR` if the usages file cannot be read or written.
pub fn remove_references(store: &Path, project: &Path, ids: &[String]) -> Result<(), PkgError> {
    let mut usages = StoreUsages::read(store)?;
    let mut changed = false;
    for id in ids {
        if usages.remove(id, project) {
            tracing::debug!(id = %id, left = usages.count(id), "released store reference");
            changed = true;
        }
    }
    if changed {
        usages.write(store)?;
    }
    Ok(())
}

/// Persist the index of `id`.
///
/// # Errors
/// Returns `PKG_STORE_ERROR` if the file cannot be written.
pub fn write_index(store: &Path, id: &str, index: &StoreIndex) -> Result<(), PkgError> {
    let json = serde_json::to_vec_pretty(index)
        .map_err(|e| PkgError::store_error(format!("Failed to serialize index: {e}")))?;
    knit_util::fs::atomic_write(&index_path(store, id), &json)
        .map_err(|e| PkgError::store_error(format!("Failed to write index for {id}: {e}")))
}

/// Walk an unpacked package and record every regular file.
///
/// Keys use `/` separators on every platform.
///
/// # Errors
/// Returns `PKG_STORE_ERROR` if the directory cannot be walked.
pub fn build_index(dir: &Path) -> Result<BTreeMap<String, FileEntry>, PkgError> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| PkgError::store_error(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let metadata = entry
            .metadata()
            .map_err(|e| PkgError::store_error(e.to_string()))?;
        files.insert(
            key,
            FileEntry {
                size: metadata.len(),
                mode: file_mode(&metadata),
            },
        );
    }
    Ok(files)
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

/// A git dependency: clone URL plus an optional committish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSpec {
    pub repo: String,
    pub committish: Option<String>,
}

/// Expand the git forms npm accepts into a clone URL.
#[must_use]
pub fn parse_git_spec(raw: &str) -> GitSpec {
    let (url, committish) = match raw.split_once('#') {
        Some((u, c)) if !c.is_empty() => (u, Some(c.to_string())),
        Some((u, _)) => (u, None),
        None => (raw, None),
    };

    let hosted = |host: &str, path: &str| format!("https://{host}/{}.git", path.trim_end_matches(".git"));
    let repo = if let Some(path) = url.strip_prefix("github:") {
        hosted("github.com", path)
    } else if let Some(path) = url.strip_prefix("gitlab:") {
        hosted("gitlab.com", path)
    } else if let Some(path) = url.strip_prefix("bitbucket:") {
        hosted("bitbucket.org", path)
    } else if let Some(path) = url.strip_prefix("gist:") {
        hosted("gist.github.com", path)
    } else if let Some(rest) = url.strip_prefix("git+") {
        rest.to_string()
    } else if url.contains("://") || url.starts_with("git@") {
        url.to_string()
    } else {
        hosted("github.com", url)
    };

    GitSpec { repo, committish }
}

/// `<host>/<path>/<commit>` for a clone URL.
#[must_use]
pub fn git_package_id(repo: &str, commit: &str) -> String {
    let without_scheme = repo.split_once("://").map_or(repo, |(_, rest)| rest);
    let without_user = without_scheme
        .split_once('@')
        .map_or(without_scheme, |(_, rest)| rest);
    let path = without_user.replacen(':', "/", 1);
    format!("{}/{commit}", path.trim_end_matches('/').trim_end_matches(".git"))
}

fn is_commit_hash(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

async fn git(args: &[&str], cwd: Option<&Path>) -> Result<String, PkgError> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let output = cmd
        .output()
        .await
        .map_err(|e| PkgError::fetch_failed(format!("Failed to run git: {e}")))?;
    if !output.status.success() {
        return Err(PkgError::fetch_failed(format!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Store-backed gate: resolves against npm registries, git remotes, tarball
/// URLs and local paths, and unpacks content into the store.
#[derive(Debug, Clone)]
pub struct StoreFetchGate {
    client: RegistryClient,
    store: PathBuf,
    /// Project root; `file:` specs and tarballs resolve against it.
    prefix: PathBuf,
}

impl StoreFetchGate {
    #[must_use]
    pub fn new(client: RegistryClient, store: PathBuf, prefix: PathBuf) -> Self {
        Self {
            client,
            store,
            prefix,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Path {
        &self.store
    }

    async fn resolve_registry(
        &self,
        spec: &PackageSpec,
        registry: &str,
    ) -> Result<ResolvedPackage, PkgError> {
        let name = spec.registry_name();
        let packument = self.client.fetch_packument(registry, name).await?;
        let version = resolve_version(&packument, spec.registry_range())?;
        let raw_manifest = get_version_manifest(&packument, &version)
            .cloned()
            .ok_or_else(|| PkgError::version_not_found(name, &version))?;
        let mut manifest: Manifest = serde_json::from_value(raw_manifest).map_err(|e| {
            PkgError::package_json_invalid(format!("Invalid manifest for {name}@{version}: {e}"))
        })?;
        if manifest.name.is_empty() {
            manifest.name = name.to_string();
        }
        if manifest.version.is_empty() {
            manifest.version.clone_from(&version);
        }

        let tarball = get_tarball_url(&packument, &version).map_or_else(
            || super::registry::default_tarball_url(registry, name, &version),
            str::to_string,
        );

        Ok(ResolvedPackage {
            id: format!("{}/{name}/{version}", dep_path::registry_host(registry)),
            resolution: LockResolution::Tarball {
                integrity: get_integrity(&packument, &version),
                tarball: Some(tarball),
                registry: Some(registry.to_string()),
            },
            manifest: Some(manifest),
            is_local: false,
        })
    }

    async fn resolve_git(&self, raw_range: &str) -> Result<ResolvedPackage, PkgError> {
        let GitSpec { repo, committish } = parse_git_spec(raw_range);
        let commit = match committish {
            Some(c) if is_commit_hash(&c) => c,
            other => {
                let wanted = other.unwrap_or_else(|| "HEAD".to_string());
                let out = git(&["ls-remote", &repo, &wanted], None).await?;
                out.lines()
                    .find_map(|line| line.split_whitespace().next())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        PkgError::resolution_failed(format!("{repo} has no ref named {wanted}"))
                    })?
            }
        };
        Ok(ResolvedPackage {
            id: git_package_id(&repo, &commit),
            resolution: LockResolution::Git {
                kind: GitTag::Git,
                repo,
                commit,
            },
            manifest: None,
            is_local: false,
        })
    }

    fn resolve_remote(url: &str) -> ResolvedPackage {
        let id = url.split_once("://").map_or(url, |(_, rest)| rest);
        ResolvedPackage {
            id: id.to_string(),
            resolution: LockResolution::Tarball {
                integrity: None,
                tarball: Some(url.to_string()),
                registry: None,
            },
            manifest: None,
            is_local: false,
        }
    }

    async fn resolve_file(&self, raw_range: &str) -> Result<ResolvedPackage, PkgError> {
        let rel = raw_range
            .strip_prefix("file:")
            .or_else(|| raw_range.strip_prefix("link:"))
            .unwrap_or(raw_range);
        let path = self.prefix.join(rel);
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
            PkgError::resolution_failed(format!("Cannot resolve {}: {e}", path.display()))
        })?;

        if metadata.is_dir() {
            let manifest = Manifest::read_from_dir(&path)?
                .ok_or_else(|| PkgError::package_json_not_found(&path.join("package.json")))?;
            return Ok(ResolvedPackage {
                id: format!("link:{rel}"),
                resolution: LockResolution::Directory {
                    kind: DirectoryTag::Directory,
                    directory: rel.to_string(),
                },
                manifest: Some(manifest),
                is_local: true,
            });
        }

        let canonical = std::fs::canonicalize(&path).unwrap_or(path);
        Ok(ResolvedPackage {
            id: format!(
                "local/{}",
                knit_util::hash::short_hash(&canonical.to_string_lossy())
            ),
            resolution: LockResolution::Tarball {
                integrity: None,
                tarball: Some(format!("file:{rel}")),
                registry: None,
            },
            manifest: None,
            is_local: false,
        })
    }
}

#[async_trait]
impl FetchGate for StoreFetchGate {
    async fn resolve(
        &self,
        spec: &PackageSpec,
        hints: &ResolveHints,
    ) -> Result<ResolvedPackage, PkgError> {
        if spec.kind == SpecKind::File {
            return self.resolve_file(&spec.raw_range).await;
        }

        if !hints.update {
            if let (Some(id), Some(resolution)) = (&hints.pkg_id, &hints.resolution) {
                if !matches!(resolution, LockResolution::Directory { .. }) {
                    return Ok(ResolvedPackage {
                        id: id.clone(),
                        resolution: resolution.clone(),
                        manifest: None,
                        is_local: false,
                    });
                }
            }
        }

        match &spec.kind {
            SpecKind::Git => self.resolve_git(&spec.raw_range).await,
            SpecKind::Remote => Ok(Self::resolve_remote(&spec.raw_range)),
            _ => self.resolve_registry(spec, &hints.registry).await,
        }
    }

    fn fetch(&self, resolved: &ResolvedPackage) -> FetchHandles {
        let gate = self.clone();
        let id = resolved.id.clone();
        let resolution = resolved.resolution.clone();
        let files = spawn_shared(async move { gate.fetch_files(&id, &resolution).await });

        let manifest = match &resolved.manifest {
            Some(m) => ready(Ok(Arc::new(m.clone()))),
            None => {
                let files = files.clone();
                let dir = self.package_path(&resolved.id);
                spawn_shared(async move {
                    files.await?;
                    let manifest = Manifest::read_from_dir(&dir)?
                        .ok_or_else(|| PkgError::package_json_not_found(&dir.join("package.json")))?;
                    Ok(Arc::new(manifest))
                })
            }
        };

        let integrity = {
            let files = files.clone();
            spawn_shared(async move { files.await.map(|_| ()) })
        };

        FetchHandles {
            manifest,
            files,
            integrity,
        }
    }

    fn package_path(&self, id: &str) -> PathBuf {
        package_dir(&self.store, id)
    }

    fn add_references(&self, ids: &[String]) -> Result<(), PkgError> {
        add_references(&self.store, &self.prefix, ids)
    }

    fn remove_references(&self, ids: &[String]) -> Result<(), PkgError> {
        remove_references(&self.store, &self.prefix, ids)
    }
}

impl StoreFetchGate {
    async fn fetch_files(
        &self,
        id: &str,
        resolution: &LockResolution,
    ) -> Result<Arc<PackageContentInfo>, PkgError> {
        if let Some(index) = read_index(&self.store, id)? {
            return Ok(Arc::new(PackageContentInfo {
                is_new: false,
                index: index.files,
            }));
        }

        let dest = package_dir(&self.store, id);
        let integrity = match resolution {
            LockResolution::Tarball {
                tarball: Some(url),
                integrity,
                ..
            } => {
                let bytes = if url.starts_with("file:") {
                    read_local_tarball(&self.prefix, url).await?
                } else {
                    download_tarball(&self.client, url).await?
                };
                let target = dest.clone();
                tokio::task::spawn_blocking(move || extract_tgz_atomic(&bytes, &target))
                    .await
                    .map_err(|e| PkgError::extract_failed(e.to_string()))??;
                integrity.clone()
            }
            LockResolution::Git { repo, commit, .. } => {
                self.clone_commit(repo, commit, &dest).await?;
                None
            }
            LockResolution::Tarball { tarball: None, .. } | LockResolution::Directory { .. } => {
                return Err(PkgError::fetch_failed(format!(
                    "{id} has no fetchable resolution"
                )));
            }
        };

        let dir = dest.clone();
        let files = tokio::task::spawn_blocking(move || build_index(&dir))
            .await
            .map_err(|e| PkgError::store_error(e.to_string()))??;
        write_index(
            &self.store,
            id,
            &StoreIndex {
                integrity,
                files: files.clone(),
            },
        )?;
        tracing::debug!(id, files = files.len(), "stored package");

        Ok(Arc::new(PackageContentInfo {
            is_new: true,
            index: files,
        }))
    }

    async fn clone_commit(&self, repo: &str, commit: &str, dest: &Path) -> Result<(), PkgError> {
        if dest.is_dir() {
            return Ok(());
        }
        let parent = dest
            .parent()
            .ok_or_else(|| PkgError::store_error("Store path has no parent"))?;
        tokio::fs::create_dir_all(parent).await?;
        let temp = parent.join(format!(".git-{}", std::process::id()));
        let _ = tokio::fs::remove_dir_all(&temp).await;

        let temp_str = temp.to_string_lossy().into_owned();
        git(&["clone", "--quiet", repo, &temp_str], None).await?;
        git(&["checkout", "--quiet", commit], Some(&temp)).await?;
        tokio::fs::remove_dir_all(temp.join(".git")).await?;
        tokio::fs::rename(&temp, dest).await?;
        Ok(())
    }
}
