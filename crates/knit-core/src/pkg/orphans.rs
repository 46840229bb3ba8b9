//! Removal of packages the new lockfile no longer contains.

use super::bins::remove_bins_into;
use super::dep_path;
use super::fetch::FetchGate;
use super::lockfile::Lockfile;
use crate::paths::package_dir_in;
use std::collections::BTreeSet;
use std::path::Path;

/// Remove what `old` materialized and `new` no longer wants.
///
/// Deletes `node_modules/.<absolute path>` for every package key missing from
/// `new`, and the root symlink plus bins of every root dependency `new` no
/// longer declares, then releases the store references of identities `new`
/// no longer uses. Failures are logged and skipped. Returns the removed
/// absolute paths.
pub fn remove_orphans(
    old: &Lockfile,
    new: &Lockfile,
    node_modules: &Path,
    gate: &dyn FetchGate,
) -> Vec<String> {
    let bin_dir = node_modules.join(".bin");

    let new_roots = new.root_references();
    for name in old.root_references().keys() {
        if new_roots.contains_key(name) {
            continue;
        }
        let link = package_dir_in(node_modules, name);
        remove_bins_into(&bin_dir, &link);
        match knit_util::fs::remove_any(&link) {
            Ok(()) => tracing::debug!(name = %name, "removed root dependency"),
            Err(e) => tracing::warn!(name = %name, error = %e, "failed to remove root dependency"),
        }
    }

    let new_keys: BTreeSet<&String> = new.packages.keys().collect();
    let mut removed = Vec::new();
    for key in old.packages.keys().filter(|k| !new_keys.contains(k)) {
        let absolute = old.absolute_path(key);
        let location = dep_path::location(node_modules, &absolute);
        match knit_util::fs::remove_any(&location) {
            Ok(()) => {
                tracing::debug!(path = %absolute, "removed orphan");
                removed.push(absolute);
            }
            Err(e) => tracing::warn!(path = %absolute, error = %e, "failed to remove orphan"),
        }
    }
    removed.sort();

    // peer variants share an identity, so only release ids no key still uses
    let kept_ids: BTreeSet<String> = new
        .packages
        .keys()
        .filter_map(|k| new.package_id(k))
        .collect();
    let released: BTreeSet<String> = old
        .packages
        .keys()
        .filter(|k| !new_keys.contains(k))
        .filter_map(|k| old.package_id(k))
        .filter(|id| !id.starts_with("link:") && !kept_ids.contains(id))
        .collect();
    if !released.is_empty() {
        let ids: Vec<String> = released.into_iter().collect();
        if let Err(e) = gate.remove_references(&ids) {
            tracing::warn!(error = %e, "failed to release store references");
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::lockfile::{DependencySnapshot, LockResolution};
    use crate::pkg::testing::MockGate;
    use std::fs;
    use tempfile::tempdir;

    const NPM: &str = "https://registry.npmjs.org/";

    fn snapshot() -> DependencySnapshot {
        DependencySnapshot::new(LockResolution::Tarball {
            integrity: Some("sha512-x".into()),
            tarball: None,
            registry: None,
        })
    }

    #[test]
    fn test_removes_dropped_packages_and_roots() {
        let tmp = tempdir().unwrap();
        let nm = tmp.path().join("node_modules");

        let mut old = Lockfile::new(NPM);
        old.dependencies.insert("a".into(), "1.0.0".into());
        old.dependencies.insert("b".into(), "1.0.0".into());
        old.packages.insert("/a/1.0.0".into(), snapshot());
        old.packages.insert("/b/1.0.0".into(), snapshot());

        let mut new = Lockfile::new(NPM);
        new.dependencies.insert("a".into(), "1.0.0".into());
        new.packages.insert("/a/1.0.0".into(), snapshot());

        for abs in ["registry.npmjs.org/a/1.0.0", "registry.npmjs.org/b/1.0.0"] {
            fs::create_dir_all(dep_path::modules_dir(&nm, abs)).unwrap();
        }
        fs::create_dir_all(nm.join("b")).unwrap();
        fs::create_dir_all(nm.join("a")).unwrap();

        let gate = MockGate::new();
        let removed = remove_orphans(&old, &new, &nm, &gate);
        assert_eq!(removed, vec!["registry.npmjs.org/b/1.0.0".to_string()]);
        assert!(!dep_path::location(&nm, "registry.npmjs.org/b/1.0.0").exists());
        assert!(dep_path::location(&nm, "registry.npmjs.org/a/1.0.0").exists());
        assert!(!nm.join("b").exists());
        assert!(nm.join("a").exists());
    }

    #[test]
    fn test_missing_locations_are_not_errors() {
        let tmp = tempdir().unwrap();
        let mut old = Lockfile::new(NPM);
        old.packages.insert("/gone/1.0.0".into(), snapshot());
        let removed = remove_orphans(
            &old,
            &Lockfile::new(NPM),
            &tmp.path().join("node_modules"),
            &MockGate::new(),
        );
        assert_eq!(removed, vec!["registry.npmjs.org/gone/1.0.0".to_string()]);
    }

    #[test]
    fn test_releases_references_of_dropped_ids_only() {
        let tmp = tempdir().unwrap();
        let gate = MockGate::new();
        let ids = [
            "registry.npmjs.org/a/1.0.0".to_string(),
            "registry.npmjs.org/b/1.0.0".to_string(),
            "registry.npmjs.org/c/1.0.0".to_string(),
        ];
        gate.add_references(&ids).unwrap();

        let mut old = Lockfile::new(NPM);
        old.packages.insert("/a/1.0.0".into(), snapshot());
        old.packages.insert("/b/1.0.0".into(), snapshot());
        old.packages.insert("/c/1.0.0_a@1.0.0".into(), {
            let mut s = snapshot();
            s.id = Some(ids[2].clone());
            s
        });

        // the plain variant of c replaces its peer variant
        let mut new = Lockfile::new(NPM);
        new.packages.insert("/a/1.0.0".into(), snapshot());
        new.packages.insert("/c/1.0.0".into(), snapshot());

        remove_orphans(&old, &new, &tmp.path().join("node_modules"), &gate);
        assert_eq!(gate.references(&ids[0]), 1);
        assert_eq!(gate.references(&ids[1]), 0);
        assert_eq!(gate.references(&ids[2]), 1);
    }
}
