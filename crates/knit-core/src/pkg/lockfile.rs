//! Lockfile types for reproducible installs.
//!
//! Two copies exist per project: the *wanted* lockfile (`knit-lock.json`,
//! committed) and the *current* one (`node_modules/.knit-lock.json`), which
//! records what is actually materialized.
//!
//! ## File Format
//!
//! ```json
//! {
//!   "lockfileVersion": 1,
//!   "registry": "https://registry.npmjs.org/",
//!   "specifiers": { "left-pad": "^1.3.0" },
//!   "dependencies": { "left-pad": "1.3.0" },
//!   "packages": {
//!     "/left-pad/1.3.0": {
//!       "resolution": { "integrity": "sha512-..." },
//!       "dev": false
//!     }
//!   }
//! }
//! ```
//!
//! Package keys are dependency paths (see [`super::dep_path`]); maps are
//! `BTreeMap`s so serialization is deterministic.

use super::dep_path;
use super::manifest::Manifest;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// Schema version for the lockfile format.
pub const LOCKFILE_VERSION: u32 = 1;

/// Wanted lockfile filename, next to `package.json`.
pub const WANTED_LOCKFILE: &str = "knit-lock.json";

/// Private (current) lockfile filename, inside `node_modules`.
pub const PRIVATE_LOCKFILE: &str = ".knit-lock.json";

/// Lockfile error codes.
pub mod codes {
    /// Lockfile not found at the expected path.
    pub const PKG_LOCK_NOT_FOUND: &str = "PKG_LOCK_NOT_FOUND";
    /// Lockfile has invalid JSON.
    pub const PKG_LOCK_INVALID_JSON: &str = "PKG_LOCK_INVALID_JSON";
    /// Lockfile schema version mismatch.
    pub const PKG_LOCK_VERSION_MISMATCH: &str = "PKG_LOCK_VERSION_MISMATCH";
    /// Lockfile write failed.
    pub const PKG_LOCK_WRITE_FAILED: &str = "PKG_LOCK_WRITE_FAILED";
}

/// How a locked package is fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LockResolution {
    /// A local directory.
    Directory {
        #[serde(rename = "type")]
        kind: DirectoryTag,
        directory: String,
    },
    /// A git commit.
    Git {
        #[serde(rename = "type")]
        kind: GitTag,
        repo: String,
        commit: String,
    },
    /// A tarball. Registry packages at their conventional URL store only
    /// `integrity`; other tarballs are stored relative to the registry.
    Tarball {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        integrity: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tarball: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        registry: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryTag {
    #[serde(rename = "directory")]
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GitTag {
    #[serde(rename = "git")]
    Git,
}

/// Per dependency-path record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencySnapshot {
    pub resolution: LockResolution,
    /// Package identity, when it differs from the absolute dependency path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Only recorded for absolute dependency paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Name → reference.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional_dependencies: BTreeMap<String, String>,
    /// `Some(true)` only dev, `Some(false)` only prod, `None` both.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<bool>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub engines: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cpu: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bundled_dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<String>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(b: &bool) -> bool {
    !b
}

impl DependencySnapshot {
    /// A snapshot carrying only a resolution.
    #[must_use]
    pub fn new(resolution: LockResolution) -> Self {
        Self {
            resolution,
            id: None,
            name: None,
            version: None,
            dependencies: BTreeMap::new(),
            optional_dependencies: BTreeMap::new(),
            dev: None,
            optional: false,
            peer_dependencies: BTreeMap::new(),
            engines: BTreeMap::new(),
            cpu: Vec::new(),
            os: Vec::new(),
            bundled_dependencies: Vec::new(),
            deprecated: None,
        }
    }

    /// Dependencies and optional dependencies as one reference map.
    #[must_use]
    pub fn all_dependencies(&self) -> BTreeMap<String, String> {
        let mut all = self.dependencies.clone();
        all.extend(
            self.optional_dependencies
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        all
    }

    /// Rebuild the manifest subset recorded in this snapshot.
    ///
    /// Dependency ranges are the locked references. Peer dependencies are
    /// dropped from the dependency maps.
    #[must_use]
    pub fn to_manifest(&self, dep_path: &str) -> Manifest {
        let (name, version) = match (&self.name, &self.version) {
            (Some(n), v) => (n.clone(), v.clone().unwrap_or_default()),
            (None, _) => dep_path::parse(dep_path).unwrap_or_default(),
        };
        let mut manifest = Manifest {
            name,
            version,
            dependencies: self.dependencies.clone(),
            optional_dependencies: self.optional_dependencies.clone(),
            peer_dependencies: self.peer_dependencies.clone(),
            engines: self.engines.clone(),
            cpu: self.cpu.clone(),
            os: self.os.clone(),
            deprecated: self.deprecated.clone(),
            ..Manifest::default()
        };
        if !self.bundled_dependencies.is_empty() {
            manifest.bundled_dependencies = Some(
                super::manifest::BundledDependencies::Names(self.bundled_dependencies.clone()),
            );
        }
        for peer in self.peer_dependencies.keys() {
            manifest.dependencies.remove(peer);
            manifest.optional_dependencies.remove(peer);
        }
        manifest
    }
}

/// A root dependency reference to record in the lockfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootRef {
    pub name: String,
    pub reference: String,
    pub dev: bool,
    pub optional: bool,
}

/// Filters applied to a lockfile before linking.
#[derive(Debug, Clone, Copy)]
pub struct FilterOptions<'a> {
    pub skipped: &'a HashSet<String>,
    pub production: bool,
    pub optional: bool,
}

/// The complete lockfile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lockfile {
    pub lockfile_version: u32,
    /// Registry that relative dependency paths are resolved against.
    pub registry: String,
    /// Root name → range as declared in `package.json`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub specifiers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub packages: BTreeMap<String, DependencySnapshot>,
}

impl Lockfile {
    /// Create a new empty lockfile.
    #[must_use]
    pub fn new(registry: impl Into<String>) -> Self {
        Self {
            lockfile_version: LOCKFILE_VERSION,
            registry: registry.into(),
            specifiers: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            dev_dependencies: BTreeMap::new(),
            optional_dependencies: BTreeMap::new(),
            packages: BTreeMap::new(),
        }
    }

    /// Read a lockfile from a path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn read_from(path: &Path) -> Result<Self, LockfileError> {
        let content = fs::read_to_string(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                LockfileError::new(
                    codes::PKG_LOCK_NOT_FOUND,
                    format!("Lockfile not found: {}", path.display()),
                )
            } else {
                LockfileError::new(
                    codes::PKG_LOCK_INVALID_JSON,
                    format!("Failed to read lockfile: {e}"),
                )
            }
        })?;

        let lockfile = Self::from_json(&content)?;

        if lockfile.lockfile_version != LOCKFILE_VERSION {
            return Err(LockfileError::new(
                codes::PKG_LOCK_VERSION_MISMATCH,
                format!(
                    "Lockfile version {} not supported (expected {})",
                    lockfile.lockfile_version, LOCKFILE_VERSION
                ),
            ));
        }

        Ok(lockfile)
    }

    /// Read a lockfile, or start an empty one for `registry` when the file
    /// does not exist. The flag reports whether the file existed.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be parsed.
    pub fn read_or_new(path: &Path, registry: &str) -> Result<(Self, bool), LockfileError> {
        match Self::read_from(path) {
            Ok(lockfile) => Ok((lockfile, true)),
            Err(e) if e.code() == codes::PKG_LOCK_NOT_FOUND => Ok((Self::new(registry), false)),
            Err(e) => Err(e),
        }
    }

    /// Write the lockfile to a path atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_to(&self, path: &Path) -> Result<(), LockfileError> {
        let mut content = serde_json::to_string_pretty(self).map_err(|e| {
            LockfileError::new(
                codes::PKG_LOCK_WRITE_FAILED,
                format!("Failed to serialize lockfile: {e}"),
            )
        })?;
        content.push('\n');

        knit_util::fs::atomic_write(path, content.as_bytes()).map_err(|e| {
            LockfileError::new(
                codes::PKG_LOCK_WRITE_FAILED,
                format!("Failed to write lockfile: {e}"),
            )
        })
    }

    /// Deserialize from JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid.
    pub fn from_json(json: &str) -> Result<Self, LockfileError> {
        serde_json::from_str(json).map_err(|e| {
            LockfileError::new(
                codes::PKG_LOCK_INVALID_JSON,
                format!("Invalid lockfile JSON: {e}"),
            )
        })
    }

    /// Absolute dependency path of a package key.
    #[must_use]
    pub fn absolute_path(&self, dep_path: &str) -> String {
        dep_path::resolve(&self.registry, dep_path)
    }

    /// Identity of the package stored under `dep_path`.
    #[must_use]
    pub fn package_id(&self, dep_path: &str) -> Option<String> {
        let snapshot = self.packages.get(dep_path)?;
        Some(
            snapshot
                .id
                .clone()
                .unwrap_or_else(|| self.absolute_path(dep_path)),
        )
    }

    /// All root references, dev first so prod and optional win on overlap.
    #[must_use]
    pub fn root_references(&self) -> BTreeMap<String, String> {
        let mut all = self.dev_dependencies.clone();
        for map in [&self.dependencies, &self.optional_dependencies] {
            all.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        all
    }

    /// Forget the root reference of `name` in every section.
    pub fn remove_root_reference(&mut self, name: &str) {
        self.dependencies.remove(name);
        self.dev_dependencies.remove(name);
        self.optional_dependencies.remove(name);
    }

    /// Whether both lockfiles record the same package set.
    #[must_use]
    pub fn packages_equal(&self, other: &Self) -> bool {
        self.packages == other.packages
    }

    /// Write root references and specifiers for freshly resolved roots.
    pub fn sync_with_manifest(&mut self, manifest: &Manifest, roots: &[RootRef]) {
        for root in roots {
            if let Some(range) = manifest.declared_range(&root.name) {
                self.specifiers.insert(root.name.clone(), range.to_string());
            }
            self.remove_root_reference(&root.name);
            let section = if root.dev {
                &mut self.dev_dependencies
            } else if root.optional {
                &mut self.optional_dependencies
            } else {
                &mut self.dependencies
            };
            section.insert(root.name.clone(), root.reference.clone());
        }
    }

    /// Keep only what the manifest still reaches.
    ///
    /// Root references are re-sectioned (an optional dependency is never also
    /// a prod or dev one), `specifiers` are recomputed, and every package not
    /// reachable from a root reference is dropped.
    #[must_use]
    pub fn prune(&self, manifest: &Manifest) -> Self {
        let optional: BTreeSet<&String> = manifest.optional_dependencies.keys().collect();
        let prod: BTreeSet<&String> = manifest
            .dependencies
            .keys()
            .filter(|n| !optional.contains(n))
            .collect();
        let dev: BTreeSet<&String> = manifest
            .dev_dependencies
            .keys()
            .filter(|n| !optional.contains(n) && !prod.contains(n))
            .collect();

        let mut out = Self::new(self.registry.clone());
        out.lockfile_version = self.lockfile_version;
        let all_refs = self.root_references();

        for (names, target) in [
            (&prod, &mut out.dependencies),
            (&dev, &mut out.dev_dependencies),
            (&optional, &mut out.optional_dependencies),
        ] {
            for name in names {
                if let Some(reference) = all_refs.get(*name) {
                    target.insert((*name).clone(), reference.clone());
                }
            }
        }

        for name in manifest.all_dependency_names() {
            if let Some(range) = manifest.declared_range(name) {
                out.specifiers.insert(name.clone(), range.to_string());
            }
        }

        let mut stack: Vec<String> = out
            .root_references()
            .iter()
            .filter_map(|(name, reference)| dep_path::ref_to_relative(reference, name))
            .collect();
        while let Some(key) = stack.pop() {
            if out.packages.contains_key(&key) {
                continue;
            }
            let Some(snapshot) = self.packages.get(&key) else {
                continue;
            };
            for (name, reference) in snapshot.all_dependencies() {
                if let Some(child) = dep_path::ref_to_relative(&reference, &name) {
                    stack.push(child);
                }
            }
            out.packages.insert(key, snapshot.clone());
        }

        out
    }

    /// Packages that should exist on disk under the given filters.
    #[must_use]
    pub fn filter(&self, opts: FilterOptions<'_>) -> Self {
        let packages = self
            .packages
            .iter()
            .filter(|(key, snapshot)| {
                let id = snapshot
                    .id
                    .clone()
                    .unwrap_or_else(|| self.absolute_path(key));
                !opts.skipped.contains(&id)
                    && !(opts.production && snapshot.dev == Some(true))
                    && !(!opts.optional && snapshot.optional)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Self {
            lockfile_version: self.lockfile_version,
            registry: self.registry.clone(),
            specifiers: self.specifiers.clone(),
            dependencies: self.dependencies.clone(),
            dev_dependencies: if opts.production {
                BTreeMap::new()
            } else {
                self.dev_dependencies.clone()
            },
            optional_dependencies: if opts.optional {
                self.optional_dependencies.clone()
            } else {
                BTreeMap::new()
            },
            packages,
        }
    }

    /// Current lockfile for an install that did not re-analyze everything:
    /// the previous current packages plus the wanted entries that were
    /// materialized this run.
    #[must_use]
    pub fn partial_private(
        previous_private: &Self,
        wanted: &Self,
        materialized: &BTreeSet<String>,
    ) -> Self {
        let mut packages = previous_private.packages.clone();
        for (key, snapshot) in &wanted.packages {
            if materialized.contains(&wanted.absolute_path(key)) {
                packages.insert(key.clone(), snapshot.clone());
            }
        }
        Self {
            packages,
            ..wanted.clone()
        }
    }
}

/// Lockfile error.
#[derive(Debug, Clone)]
pub struct LockfileError {
    code: &'static str,
    message: String,
}

impl LockfileError {
    /// Create a new error.
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Get the error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Get the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for LockfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for LockfileError {}

impl From<LockfileError> for super::error::PkgError {
    fn from(e: LockfileError) -> Self {
        Self::lockfile_invalid(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const NPM: &str = "https://registry.npmjs.org/";

    fn integrity(sri: &str) -> LockResolution {
        LockResolution::Tarball {
            integrity: Some(sri.to_string()),
            tarball: None,
            registry: None,
        }
    }

    fn snapshot_with_deps(deps: &[(&str, &str)]) -> DependencySnapshot {
        let mut s = DependencySnapshot::new(integrity("sha512-x"));
        for (n, r) in deps {
            s.dependencies.insert((*n).to_string(), (*r).to_string());
        }
        s
    }

    #[test]
    fn test_error_codes_are_uppercase() {
        for code in [
            codes::PKG_LOCK_NOT_FOUND,
            codes::PKG_LOCK_INVALID_JSON,
            codes::PKG_LOCK_VERSION_MISMATCH,
            codes::PKG_LOCK_WRITE_FAILED,
        ] {
            assert!(
                code.chars().all(|c| c.is_uppercase() || c == '_'),
                "Error code '{code}' should be SCREAMING_SNAKE_CASE"
            );
        }
    }

    #[test]
    fn test_resolution_variants_serialize() {
        let dir = LockResolution::Directory {
            kind: DirectoryTag::Directory,
            directory: "../lib".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&dir).unwrap(),
            serde_json::json!({"type": "directory", "directory": "../lib"})
        );

        let parsed: LockResolution =
            serde_json::from_str(r#"{"type":"git","repo":"https://x/y.git","commit":"abc"}"#)
                .unwrap();
        assert!(matches!(parsed, LockResolution::Git { .. }));

        let parsed: LockResolution = serde_json::from_str(r#"{"integrity":"sha512-q"}"#).unwrap();
        assert_eq!(parsed, integrity("sha512-q"));
    }

    #[test]
    fn test_write_then_read_snapshot_survives() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(WANTED_LOCKFILE);

        let mut lockfile = Lockfile::new(NPM);
        let mut snapshot = snapshot_with_deps(&[("b", "2.0.0")]);
        snapshot.dev = Some(false);
        snapshot.engines.insert("node".to_string(), ">=10".to_string());
        lockfile.packages.insert("/a/1.0.0".to_string(), snapshot);
        lockfile.dependencies.insert("a".to_string(), "1.0.0".to_string());

        lockfile.write_to(&path).unwrap();
        let read = Lockfile::read_from(&path).unwrap();
        assert_eq!(read, lockfile);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"lockfileVersion\": 1"));
        assert!(!text.contains("optionalDependencies"));
    }

    #[test]
    fn test_read_or_new_missing() {
        let dir = tempdir().unwrap();
        let (lockfile, existed) =
            Lockfile::read_or_new(&dir.path().join(WANTED_LOCKFILE), NPM).unwrap();
        assert!(!existed);
        assert_eq!(lockfile.registry, NPM);
        assert!(lockfile.packages.is_empty());
    }

    #[test]
    fn test_read_version_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(WANTED_LOCKFILE);
        fs::write(&path, r#"{"lockfileVersion": 99, "registry": "x"}"#).unwrap();
        let err = Lockfile::read_from(&path).unwrap_err();
        assert_eq!(err.code(), codes::PKG_LOCK_VERSION_MISMATCH);
    }

    #[test]
    fn test_prune_drops_unreachable_and_removed_roots() {
        let mut lockfile = Lockfile::new(NPM);
        lockfile.dependencies.insert("a".to_string(), "1.0.0".to_string());
        lockfile.dependencies.insert("gone".to_string(), "1.0.0".to_string());
        lockfile
            .packages
            .insert("/a/1.0.0".to_string(), snapshot_with_deps(&[("b", "2.0.0")]));
        lockfile
            .packages
            .insert("/b/2.0.0".to_string(), snapshot_with_deps(&[("a", "1.0.0")]));
        lockfile
            .packages
            .insert("/gone/1.0.0".to_string(), snapshot_with_deps(&[]));
        lockfile
            .packages
            .insert("/stray/3.0.0".to_string(), snapshot_with_deps(&[]));

        let manifest = Manifest::parse(r#"{"dependencies":{"a":"^1.0.0"}}"#).unwrap();
        let pruned = lockfile.prune(&manifest);

        assert_eq!(
            pruned.packages.keys().collect::<Vec<_>>(),
            vec!["/a/1.0.0", "/b/2.0.0"]
        );
        assert_eq!(pruned.dependencies.len(), 1);
        assert_eq!(pruned.specifiers.get("a").unwrap(), "^1.0.0");
    }

    #[test]
    fn test_prune_moves_root_to_optional_section() {
        let mut lockfile = Lockfile::new(NPM);
        lockfile.dependencies.insert("a".to_string(), "1.0.0".to_string());
        lockfile
            .packages
            .insert("/a/1.0.0".to_string(), snapshot_with_deps(&[]));

        let manifest = Manifest::parse(
            r#"{"dependencies":{"a":"^1.0.0"},"optionalDependencies":{"a":"^1.0.0"}}"#,
        )
        .unwrap();
        let pruned = lockfile.prune(&manifest);
        assert!(pruned.dependencies.is_empty());
        assert_eq!(pruned.optional_dependencies.get("a").unwrap(), "1.0.0");
    }

    #[test]
    fn test_filter_skipped_dev_optional() {
        let mut lockfile = Lockfile::new(NPM);
        let mut dev = snapshot_with_deps(&[]);
        dev.dev = Some(true);
        let mut opt = snapshot_with_deps(&[]);
        opt.optional = true;
        lockfile.packages.insert("/dev/1.0.0".to_string(), dev);
        lockfile.packages.insert("/opt/1.0.0".to_string(), opt);
        lockfile
            .packages
            .insert("/skip/1.0.0".to_string(), snapshot_with_deps(&[]));
        lockfile
            .packages
            .insert("/keep/1.0.0".to_string(), snapshot_with_deps(&[]));

        let skipped: HashSet<String> =
            std::iter::once("registry.npmjs.org/skip/1.0.0".to_string()).collect();
        let filtered = lockfile.filter(FilterOptions {
            skipped: &skipped,
            production: true,
            optional: false,
        });
        assert_eq!(
            filtered.packages.keys().collect::<Vec<_>>(),
            vec!["/keep/1.0.0"]
        );
    }

    #[test]
    fn test_partial_private_keeps_previous_entries() {
        let mut previous = Lockfile::new(NPM);
        previous
            .packages
            .insert("/old/1.0.0".to_string(), snapshot_with_deps(&[]));

        let mut wanted = Lockfile::new(NPM);
        wanted
            .packages
            .insert("/new/1.0.0".to_string(), snapshot_with_deps(&[]));
        wanted
            .packages
            .insert("/other/1.0.0".to_string(), snapshot_with_deps(&[]));

        let materialized: BTreeSet<String> =
            std::iter::once("registry.npmjs.org/new/1.0.0".to_string()).collect();
        let partial = Lockfile::partial_private(&previous, &wanted, &materialized);
        assert_eq!(
            partial.packages.keys().collect::<Vec<_>>(),
            vec!["/new/1.0.0", "/old/1.0.0"]
        );
    }

    #[test]
    fn test_snapshot_to_manifest_drops_peers() {
        let mut snapshot = snapshot_with_deps(&[("react", "16.0.0"), ("b", "1.0.0")]);
        snapshot
            .peer_dependencies
            .insert("react".to_string(), "^16".to_string());
        let manifest = snapshot.to_manifest("/a/1.0.0");
        assert_eq!(manifest.name, "a");
        assert_eq!(manifest.version, "1.0.0");
        assert!(!manifest.dependencies.contains_key("react"));
        assert!(manifest.dependencies.contains_key("b"));
    }
}
