//! In-memory [`FetchGate`] for tests.
//!
//! Packages are published as JSON manifests; fetching writes `package.json`
//! and any declared bin files into a private temp store and counts how often
//! each identity was fetched.

use super::dep_path;
use super::error::PkgError;
use super::fetch::{FetchGate, FetchHandles, PackageContentInfo, ResolveHints, ResolvedPackage};
use super::lockfile::{DirectoryTag, LockResolution};
use super::manifest::Manifest;
use super::registry::default_tarball_url;
use super::spec::{PackageSpec, SpecKind};
use super::store::{add_references, build_index, package_dir, remove_references, StoreUsages};
use super::version::resolve_version;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Default registry used by the mock.
pub const NPM: &str = "https://registry.npmjs.org/";

/// Counting test double for the fetch gate.
pub struct MockGate {
    store: tempfile::TempDir,
    prefix: Option<PathBuf>,
    delay: Duration,
    packages: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
    broken: Mutex<HashSet<String>>,
    fetches: Mutex<HashMap<String, usize>>,
}

impl Default for MockGate {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGate {
    /// # Panics
    /// Panics if no temp directory can be created.
    #[must_use]
    #[allow(clippy::missing_panics_doc, clippy::expect_used)]
    pub fn new() -> Self {
        Self {
            store: tempfile::tempdir().expect("temp store"),
            prefix: None,
            delay: Duration::ZERO,
            packages: Mutex::new(BTreeMap::new()),
            broken: Mutex::new(HashSet::new()),
            fetches: Mutex::new(HashMap::new()),
        }
    }

    /// Delay every registry resolution, so concurrent branches overlap.
    #[must_use]
    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    /// Project root for `file:` specs.
    #[must_use]
    pub fn with_prefix(mut self, prefix: &Path) -> Self {
        self.prefix = Some(prefix.to_path_buf());
        self
    }

    /// Publish `name@version`. `extra` is merged into the manifest.
    pub fn publish(&self, name: &str, version: &str, extra: Value) {
        let mut manifest = Map::new();
        manifest.insert("name".into(), json!(name));
        manifest.insert("version".into(), json!(version));
        if let Value::Object(fields) = extra {
            manifest.extend(fields);
        }
        self.packages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .insert(version.to_string(), Value::Object(manifest));
    }

    /// Make the content fetch of `name@version` fail.
    pub fn break_content(&self, name: &str, version: &str) {
        self.broken
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Self::id(name, version));
    }

    #[must_use]
    pub fn id(name: &str, version: &str) -> String {
        format!("{}/{name}/{version}", dep_path::registry_host(NPM))
    }

    #[must_use]
    pub fn integrity(name: &str, version: &str) -> String {
        format!("sha512-{}", knit_util::hash::short_hash(&format!("{name}@{version}")))
    }

    /// The resolution a lockfile records for a published package.
    #[must_use]
    pub fn lock_resolution(&self, name: &str, version: &str) -> LockResolution {
        LockResolution::Tarball {
            integrity: Some(Self::integrity(name, version)),
            tarball: None,
            registry: None,
        }
    }

    /// A fresh resolution of a published package.
    ///
    /// # Panics
    /// Panics if the package was not published.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn resolved(&self, name: &str, version: &str) -> ResolvedPackage {
        let manifest = self.manifest(name, version).expect("published package");
        Self::registry_package(name, version, manifest)
    }

    /// How many times a fetch was started for `id`.
    #[must_use]
    pub fn fetches_of(&self, id: &str) -> usize {
        self.fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn total_fetches(&self) -> usize {
        self.fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }

    #[must_use]
    pub fn store(&self) -> &Path {
        self.store.path()
    }

    /// Number of projects holding a reference to `id`.
    #[must_use]
    pub fn references(&self, id: &str) -> usize {
        StoreUsages::read(self.store.path()).map_or(0, |u| u.count(id))
    }

    fn project(&self) -> PathBuf {
        self.prefix.clone().unwrap_or_else(|| PathBuf::from("project"))
    }

    fn manifest(&self, name: &str, version: &str) -> Option<Manifest> {
        let packages = self.packages.lock().unwrap_or_else(PoisonError::into_inner);
        let value = packages.get(name)?.get(version)?.clone();
        serde_json::from_value(value).ok()
    }

    fn packument(&self, name: &str) -> Option<Value> {
        let packages = self.packages.lock().unwrap_or_else(PoisonError::into_inner);
        let versions = packages.get(name)?;
        let latest = versions
            .keys()
            .filter_map(|v| semver::Version::parse(v).ok())
            .max()?;
        Some(json!({
            "name": name,
            "dist-tags": {"latest": latest.to_string()},
            "versions": versions,
        }))
    }

    fn registry_package(name: &str, version: &str, manifest: Manifest) -> ResolvedPackage {
        ResolvedPackage {
            id: Self::id(name, version),
            resolution: LockResolution::Tarball {
                integrity: Some(Self::integrity(name, version)),
                tarball: Some(default_tarball_url(NPM, name, version)),
                registry: None,
            },
            manifest: Some(manifest),
            is_local: false,
        }
    }

    fn resolve_local(&self, spec: &PackageSpec) -> Result<ResolvedPackage, PkgError> {
        let rel = spec
            .raw_range
            .trim_start_matches("file:")
            .trim_start_matches("link:");
        let dir = self
            .prefix
            .as_deref()
            .ok_or_else(|| PkgError::resolution_failed("no project prefix"))?
            .join(rel);
        let manifest = Manifest::read_from_dir(&dir)?
            .ok_or_else(|| PkgError::package_json_not_found(&dir.join("package.json")))?;
        Ok(ResolvedPackage {
            id: format!("link:{rel}"),
            resolution: LockResolution::Directory {
                kind: DirectoryTag::Directory,
                directory: rel.to_string(),
            },
            manifest: Some(manifest),
            is_local: true,
        })
    }
}

fn write_content(dir: &Path, manifest: &Value) -> Result<bool, PkgError> {
    if dir.join("package.json").exists() {
        return Ok(false);
    }
    std::fs::create_dir_all(dir)?;
    let text = serde_json::to_string_pretty(manifest)
        .map_err(|e| PkgError::store_error(e.to_string()))?;
    std::fs::write(dir.join("package.json"), text)?;

    let bins: Vec<String> = match manifest.get("bin") {
        Some(Value::String(path)) => vec![path.clone()],
        Some(Value::Object(map)) => map
            .values()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    for bin in bins {
        let path = dir.join(bin.trim_start_matches("./"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, "#!/usr/bin/env node\n")?;
    }
    Ok(true)
}

#[async_trait]
impl FetchGate for MockGate {
    async fn resolve(
        &self,
        spec: &PackageSpec,
        hints: &ResolveHints,
    ) -> Result<ResolvedPackage, PkgError> {
        if spec.kind == SpecKind::File {
            return self.resolve_local(spec);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if !hints.update {
            if let (Some(id), Some(resolution)) = (&hints.pkg_id, &hints.resolution) {
                return Ok(ResolvedPackage {
                    id: id.clone(),
                    resolution: resolution.clone(),
                    manifest: None,
                    is_local: false,
                });
            }
        }

        let name = spec.registry_name();
        let packument = self
            .packument(name)
            .ok_or_else(|| PkgError::not_found(name))?;
        let version = resolve_version(&packument, spec.registry_range())?;
        let manifest = self
            .manifest(name, &version)
            .ok_or_else(|| PkgError::version_not_found(name, &version))?;
        Ok(Self::registry_package(name, &version, manifest))
    }

    fn fetch(&self, resolved: &ResolvedPackage) -> FetchHandles {
        *self
            .fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(resolved.id.clone())
            .or_default() += 1;

        let id = resolved.id.clone();
        let published = dep_path::parse(&id).and_then(|(name, version)| {
            let packages = self.packages.lock().unwrap_or_else(PoisonError::into_inner);
            packages.get(&name)?.get(&version).cloned()
        });
        let broken = self
            .broken
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id);
        let dir = package_dir(self.store.path(), &id);

        let manifest_value = published.clone();
        let manifest_id = id.clone();
        let manifest = async move {
            let value = manifest_value.ok_or_else(|| PkgError::not_found(&manifest_id))?;
            serde_json::from_value::<Manifest>(value)
                .map(Arc::new)
                .map_err(|e| PkgError::package_json_invalid(e.to_string()))
        };
        let files = async move {
            if broken {
                return Err(PkgError::download_failed(format!("{id}: connection reset")));
            }
            let value = published.ok_or_else(|| PkgError::not_found(&id))?;
            let is_new = write_content(&dir, &value)?;
            Ok(Arc::new(PackageContentInfo {
                is_new,
                index: build_index(&dir)?,
            }))
        };

        FetchHandles::spawn(manifest, files, async { Ok(()) })
    }

    fn package_path(&self, id: &str) -> PathBuf {
        package_dir(self.store.path(), id)
    }

    fn add_references(&self, ids: &[String]) -> Result<(), PkgError> {
        add_references(self.store.path(), &self.project(), ids)
    }

    fn remove_references(&self, ids: &[String]) -> Result<(), PkgError> {
        remove_references(self.store.path(), &self.project(), ids)
    }
}
