//! The fetch gate: how the installer turns specs into package identities and
//! content.
//!
//! The engine never talks to a registry or a store directly. It asks a
//! [`FetchGate`] to resolve a spec to an identity, then asks it once per
//! identity for [`FetchHandles`]: shared futures for the manifest, the
//! content index and the integrity record. Handles are spawned onto the
//! runtime, so a resolution branch that is abandoned never cancels a download
//! other branches are waiting on.

use super::error::PkgError;
use super::lockfile::LockResolution;
use super::manifest::Manifest;
use super::spec::PackageSpec;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

/// A result shared between every consumer of one fetch.
pub type SharedResult<T> = Shared<BoxFuture<'static, Result<T, PkgError>>>;

/// One file of an unpacked package.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FileEntry {
    pub size: u64,
    /// Unix permission bits.
    pub mode: u32,
}

/// What the store knows about a package's files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageContentInfo {
    /// True when the content was unpacked during this run.
    pub is_new: bool,
    /// Relative path → entry, enough to hardlink the package without reading it.
    pub index: BTreeMap<String, FileEntry>,
}

/// Handles for an in-flight fetch.
#[derive(Clone)]
pub struct FetchHandles {
    pub manifest: SharedResult<Arc<Manifest>>,
    pub files: SharedResult<Arc<PackageContentInfo>>,
    pub integrity: SharedResult<()>,
}

impl std::fmt::Debug for FetchHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchHandles").finish_non_exhaustive()
    }
}

impl FetchHandles {
    /// Spawn the three futures and wrap them for sharing.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn spawn<M, F, I>(manifest: M, files: F, integrity: I) -> Self
    where
        M: Future<Output = Result<Arc<Manifest>, PkgError>> + Send + 'static,
        F: Future<Output = Result<Arc<PackageContentInfo>, PkgError>> + Send + 'static,
        I: Future<Output = Result<(), PkgError>> + Send + 'static,
    {
        Self {
            manifest: spawn_shared(manifest),
            files: spawn_shared(files),
            integrity: spawn_shared(integrity),
        }
    }
}

/// Run `fut` on the runtime and hand out a cloneable handle to its result.
pub fn spawn_shared<T, F>(fut: F) -> SharedResult<T>
where
    T: Clone + Send + Sync + 'static,
    F: Future<Output = Result<T, PkgError>> + Send + 'static,
{
    let task = tokio::spawn(fut);
    async move {
        task.await
            .map_err(|e| PkgError::fetch_failed(format!("fetch task failed: {e}")))?
    }
    .boxed()
    .shared()
}

/// Already-known value as a shared result.
#[must_use]
pub fn ready<T>(value: Result<T, PkgError>) -> SharedResult<T>
where
    T: Clone + Send + Sync + 'static,
{
    futures::future::ready(value).boxed().shared()
}

/// What the installer already knows about a dependency from the lockfile.
#[derive(Debug, Clone, Default)]
pub struct ResolveHints {
    /// Identity recorded in the wanted lockfile.
    pub pkg_id: Option<String>,
    /// Resolution recorded in the wanted lockfile, with absolute URLs.
    pub resolution: Option<LockResolution>,
    /// Re-resolve against the registry even when the lockfile has an answer.
    pub update: bool,
    /// Registry serving this package.
    pub registry: String,
}

/// A spec resolved to an identity.
#[derive(Debug, Clone)]
pub struct ResolvedPackage {
    pub id: String,
    pub resolution: LockResolution,
    /// Manifest when resolution already produced it (registry packuments,
    /// local directories).
    pub manifest: Option<Manifest>,
    /// A `file:` directory: linked in place, never fetched.
    pub is_local: bool,
}

/// Consumed collaborator: resolves specs and fetches content.
#[async_trait]
pub trait FetchGate: Send + Sync {
    /// Resolve `spec` to an identity and resolution.
    async fn resolve(&self, spec: &PackageSpec, hints: &ResolveHints)
        -> Result<ResolvedPackage, PkgError>;

    /// Start fetching a resolved package. Called at most once per identity
    /// per install; the returned handles are already running.
    fn fetch(&self, resolved: &ResolvedPackage) -> FetchHandles;

    /// Where the unpacked content of `id` lives.
    fn package_path(&self, id: &str) -> PathBuf;

    /// Count this project as a user of the stored content of `ids`.
    fn add_references(&self, ids: &[String]) -> Result<(), PkgError>;

    /// Drop this project's reference to `ids`.
    fn remove_references(&self, ids: &[String]) -> Result<(), PkgError>;
}
