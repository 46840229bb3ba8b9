//! Per-install state shared by every resolution branch.
//!
//! All sets live behind `std::sync::Mutex`. Each check-then-insert happens in
//! one lock scope and no guard is held across an `.await`.

use super::error::PkgError;
use super::fetch::{FetchGate, FetchHandles, ResolvedPackage};
use super::lockfile::{LockResolution, Lockfile};
use super::manifest::Manifest;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The single record of a resolved package identity.
#[derive(Debug, Clone)]
pub struct InstalledPackage {
    pub id: String,
    pub name: String,
    pub version: String,
    pub resolution: LockResolution,
    pub manifest: Arc<Manifest>,
    /// Unpacked content in the store.
    pub path: PathBuf,
    pub handles: FetchHandles,
    /// Whether this package itself passes the platform checks.
    pub installable: bool,
    /// May declare executables. Always set when the manifest came from the
    /// lockfile, which does not record bins.
    pub has_bins: bool,
    /// Identities of the direct children, in resolution order.
    pub children: Vec<String>,
    pub dev: bool,
    pub prod: bool,
    /// Depth at which the identity was first resolved.
    pub depth: i64,
}

impl InstalledPackage {
    #[must_use]
    pub fn peer_dependencies(&self) -> &BTreeMap<String, String> {
        &self.manifest.peer_dependencies
    }

    #[must_use]
    pub fn optional_dependency_names(&self) -> BTreeSet<String> {
        self.manifest.optional_dependencies.keys().cloned().collect()
    }

    #[must_use]
    pub fn has_bundled_dependencies(&self) -> bool {
        self.manifest.bundled_dependencies.is_some()
    }
}

/// A root `file:` directory dependency. Linked in place after install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPackage {
    pub id: String,
    pub raw_spec: String,
    pub name: String,
    pub version: String,
    pub dev: bool,
    pub optional: bool,
    pub directory: PathBuf,
    pub resolution: LockResolution,
}

/// Settings copied into the context at the start of an install.
#[derive(Debug, Clone, Default)]
pub struct ContextSettings {
    pub prefix: PathBuf,
    pub node_modules: PathBuf,
    pub registry: String,
    pub scoped_registries: BTreeMap<String, String>,
    /// Re-validation depth; `i64::MAX` re-analyzes everything.
    pub depth: i64,
    pub force: bool,
    pub engine_strict: bool,
    pub node_version: Option<String>,
}

/// Mutable state of one install run.
pub struct InstallContext {
    pub gate: Arc<dyn FetchGate>,
    pub wanted: Lockfile,
    pub current: Lockfile,
    pub settings: ContextSettings,
    processed: Mutex<HashSet<String>>,
    skipped: Mutex<HashSet<String>>,
    non_optional: Mutex<HashSet<String>>,
    /// Identities whose subtree failed after they were marked processed.
    failures: Mutex<HashMap<String, PkgError>>,
    installs: Mutex<HashMap<String, Arc<InstalledPackage>>>,
    fetching_locker: Mutex<HashMap<String, FetchHandles>>,
    local_packages: Mutex<Vec<LocalPackage>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InstallContext {
    /// Create a context. `skipped` carries identities skipped by the previous
    /// install so they stay skipped unless re-analyzed.
    #[must_use]
    pub fn new(
        gate: Arc<dyn FetchGate>,
        wanted: Lockfile,
        current: Lockfile,
        settings: ContextSettings,
        skipped: HashSet<String>,
    ) -> Self {
        Self {
            gate,
            wanted,
            current,
            settings,
            processed: Mutex::new(HashSet::new()),
            skipped: Mutex::new(skipped),
            non_optional: Mutex::new(HashSet::new()),
            failures: Mutex::new(HashMap::new()),
            installs: Mutex::new(HashMap::new()),
            fetching_locker: Mutex::new(HashMap::new()),
            local_packages: Mutex::new(Vec::new()),
        }
    }

    /// Registry serving `name`.
    #[must_use]
    pub fn registry_for(&self, name: &str) -> String {
        name.strip_prefix('@')
            .and_then(|rest| rest.split_once('/'))
            .and_then(|(scope, _)| self.settings.scoped_registries.get(&format!("@{scope}")))
            .unwrap_or(&self.settings.registry)
            .clone()
    }

    /// Mark `id` processed. Returns `true` for the first caller only.
    pub fn mark_processed(&self, id: &str) -> bool {
        lock(&self.processed).insert(id.to_string())
    }

    #[must_use]
    pub fn is_processed(&self, id: &str) -> bool {
        lock(&self.processed).contains(id)
    }

    pub fn skip(&self, id: &str) {
        lock(&self.skipped).insert(id.to_string());
    }

    pub fn unskip(&self, id: &str) {
        lock(&self.skipped).remove(id);
    }

    #[must_use]
    pub fn is_skipped(&self, id: &str) -> bool {
        lock(&self.skipped).contains(id)
    }

    /// Snapshot of the skipped identities.
    #[must_use]
    pub fn skipped(&self) -> HashSet<String> {
        lock(&self.skipped).clone()
    }

    pub fn add_non_optional(&self, id: &str) {
        lock(&self.non_optional).insert(id.to_string());
    }

    #[must_use]
    pub fn is_non_optional(&self, id: &str) -> bool {
        lock(&self.non_optional).contains(id)
    }

    /// Remember that `id` was claimed but will never reach the arena.
    pub fn record_failure(&self, id: &str, err: PkgError) {
        lock(&self.failures).entry(id.to_string()).or_insert(err);
    }

    #[must_use]
    pub fn failure(&self, id: &str) -> Option<PkgError> {
        lock(&self.failures).get(id).cloned()
    }

    /// Handles for `resolved`, starting the fetch only for the first caller.
    pub fn fetch_once(&self, resolved: &ResolvedPackage) -> FetchHandles {
        lock(&self.fetching_locker)
            .entry(resolved.id.clone())
            .or_insert_with(|| self.gate.fetch(resolved))
            .clone()
    }

    /// Number of identities a fetch was started for.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        lock(&self.fetching_locker).len()
    }

    /// Handles of every fetch started in this run.
    #[must_use]
    pub fn all_fetches(&self) -> Vec<FetchHandles> {
        lock(&self.fetching_locker).values().cloned().collect()
    }

    /// Store a processed package. The first write wins.
    pub fn insert_installed(&self, pkg: InstalledPackage) {
        lock(&self.installs)
            .entry(pkg.id.clone())
            .or_insert_with(|| Arc::new(pkg));
    }

    #[must_use]
    pub fn installed(&self, id: &str) -> Option<Arc<InstalledPackage>> {
        lock(&self.installs).get(id).cloned()
    }

    /// Snapshot of the arena.
    #[must_use]
    pub fn installs(&self) -> HashMap<String, Arc<InstalledPackage>> {
        lock(&self.installs).clone()
    }

    pub fn push_local(&self, local: LocalPackage) {
        lock(&self.local_packages).push(local);
    }

    #[must_use]
    pub fn local_packages(&self) -> Vec<LocalPackage> {
        lock(&self.local_packages).clone()
    }
}

impl std::fmt::Debug for InstallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallContext")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
