//! Turning a resolved tree into lockfile snapshots.

use super::dep_path;
use super::lockfile::{DependencySnapshot, LockResolution, Lockfile};
use super::peers::{ResolvedNode, ResolvedTree};
use std::collections::BTreeMap;

/// Lockfile key of an absolute dependency path.
///
/// Registry packages become `/name/version`; tarballs addressed by URL keep
/// their absolute path since their key cannot be parsed back into a name.
#[must_use]
pub fn lock_key(registry: &str, absolute: &str) -> String {
    if absolute.contains("/-/") {
        return absolute.to_string();
    }
    dep_path::relative(registry, absolute)
}

/// What a parent's dependency map records for `node`.
#[must_use]
pub fn reference_for(node: &ResolvedNode, registry: &str) -> String {
    let is_registry_package = matches!(node.resolution, LockResolution::Tarball { .. })
        && !node.absolute_path.contains("/-/");
    dep_path::absolute_path_to_ref(&node.absolute_path, &node.name, is_registry_package, registry)
}

/// Lockfile form of a resolution.
///
/// Tarballs at the registry's conventional URL keep only their integrity;
/// other tarballs on the registry are stored relative to it. Packages under
/// an absolute key, and directory or git resolutions, are kept verbatim.
#[must_use]
pub fn to_lock_resolution(key: &str, resolution: &LockResolution, registry: &str) -> LockResolution {
    let LockResolution::Tarball {
        integrity: Some(integrity),
        tarball: Some(tarball),
        ..
    } = resolution
    else {
        return resolution.clone();
    };
    if dep_path::is_absolute(key) {
        return resolution.clone();
    }

    let base = registry.trim_end_matches('/');
    let Some(rest) = tarball.strip_prefix(base) else {
        return resolution.clone();
    };
    if rest.contains("/-/") {
        return LockResolution::Tarball {
            integrity: Some(integrity.clone()),
            tarball: None,
            registry: None,
        };
    }
    LockResolution::Tarball {
        integrity: Some(integrity.clone()),
        tarball: Some(rest.to_string()),
        registry: None,
    }
}

/// Snapshots for every node of the tree, keyed by lockfile key.
///
/// Dependency maps start from the previous snapshot under the same key with
/// the freshly resolved children merged over it.
#[must_use]
pub fn reconcile(tree: &ResolvedTree, wanted: &Lockfile) -> Vec<(String, DependencySnapshot)> {
    let registry = wanted.registry.as_str();
    tree.nodes
        .values()
        .map(|node| {
            let key = lock_key(registry, &node.absolute_path);
            let snapshot = to_snapshot(node, &key, tree, wanted.packages.get(&key), registry);
            (key, snapshot)
        })
        .collect()
}

fn to_snapshot(
    node: &ResolvedNode,
    key: &str,
    tree: &ResolvedTree,
    previous: Option<&DependencySnapshot>,
    registry: &str,
) -> DependencySnapshot {
    let mut dependencies = previous.map(|p| p.dependencies.clone()).unwrap_or_default();
    let mut optional_dependencies = previous
        .map(|p| p.optional_dependencies.clone())
        .unwrap_or_default();

    for (name, child_abs) in &node.children {
        let reference = match tree.nodes.get(child_abs) {
            Some(child) => reference_for(child, registry),
            None => child_abs.clone(),
        };
        if node.optional_dependency_names.contains(name) {
            dependencies.remove(name);
            optional_dependencies.insert(name.clone(), reference);
        } else {
            optional_dependencies.remove(name);
            dependencies.insert(name.clone(), reference);
        }
    }

    let mut snapshot = DependencySnapshot::new(to_lock_resolution(key, &node.resolution, registry));
    snapshot.dependencies = dependencies;
    snapshot.optional_dependencies = optional_dependencies;
    snapshot.dev = match (node.dev, node.prod) {
        (true, false) => Some(true),
        (false, true) => Some(false),
        _ => None,
    };
    snapshot.optional = node.optional;

    if node.pkg_id != node.absolute_path {
        snapshot.id = Some(node.pkg_id.clone());
    }
    if dep_path::is_absolute(key) {
        snapshot.name = Some(node.name.clone());
        snapshot.version = Some(node.version.clone());
    }

    let manifest = &node.manifest;
    snapshot.peer_dependencies = node
        .peer_dependencies
        .iter()
        .filter(|(peer, _)| {
            !manifest.dependencies.contains_key(*peer)
                && !manifest.optional_dependencies.contains_key(*peer)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    snapshot.engines = manifest
        .engines
        .iter()
        .filter(|(_, range)| range.as_str() != "*")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<BTreeMap<_, _>>();
    snapshot.cpu = manifest.cpu.clone();
    snapshot.os = manifest.os.clone();
    snapshot.bundled_dependencies = manifest.bundled_names();
    snapshot.deprecated = manifest.deprecated.clone();
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::fetch::{ready, FetchHandles, PackageContentInfo};
    use crate::pkg::lockfile::{DirectoryTag, GitTag};
    use crate::pkg::manifest::Manifest;
    use std::path::PathBuf;
    use std::sync::Arc;

    const NPM: &str = "https://registry.npmjs.org/";

    fn node(name: &str, version: &str, manifest: Manifest) -> ResolvedNode {
        let abs = format!("registry.npmjs.org/{name}/{version}");
        ResolvedNode {
            pkg_id: abs.clone(),
            absolute_path: abs,
            name: name.to_string(),
            version: version.to_string(),
            resolution: LockResolution::Tarball {
                integrity: Some(format!("sha512-{name}")),
                tarball: Some(format!("{NPM}{name}/-/{name}-{version}.tgz")),
                registry: Some(NPM.to_string()),
            },
            hardlinked_location: PathBuf::new(),
            modules_dir: PathBuf::new(),
            independent: false,
            installable: true,
            dev: false,
            prod: true,
            optional: false,
            has_bins: false,
            has_bundled_dependencies: false,
            peer_dependencies: manifest.peer_dependencies.clone(),
            optional_dependency_names: manifest.optional_dependencies.keys().cloned().collect(),
            children: BTreeMap::new(),
            depth: 0,
            manifest: Arc::new(manifest),
            handles: FetchHandles {
                manifest: ready(Ok(Arc::new(Manifest::default()))),
                files: ready(Ok(Arc::new(PackageContentInfo::default()))),
                integrity: ready(Ok(())),
            },
            store_path: PathBuf::new(),
        }
    }

    fn tree(nodes: Vec<ResolvedNode>) -> ResolvedTree {
        ResolvedTree {
            nodes: nodes
                .into_iter()
                .map(|n| (n.absolute_path.clone(), n))
                .collect(),
            roots: BTreeMap::new(),
        }
    }

    fn entry<'a>(entries: &'a [(String, DependencySnapshot)], key: &str) -> &'a DependencySnapshot {
        &entries.iter().find(|(k, _)| k == key).unwrap().1
    }

    #[test]
    fn test_registry_tarball_collapses_to_integrity() {
        let resolution = LockResolution::Tarball {
            integrity: Some("sha512-x".into()),
            tarball: Some("https://registry.npmjs.org/foo/-/foo-1.0.0.tgz".into()),
            registry: Some(NPM.into()),
        };
        assert_eq!(
            to_lock_resolution("/foo/1.0.0", &resolution, NPM),
            LockResolution::Tarball {
                integrity: Some("sha512-x".into()),
                tarball: None,
                registry: None,
            }
        );
    }

    #[test]
    fn test_nonstandard_registry_tarball_is_relative() {
        let registry = "https://npm.corp/repo/";
        let resolution = LockResolution::Tarball {
            integrity: Some("sha512-x".into()),
            tarball: Some("https://npm.corp/repo/foo/download/foo-1.0.0.tgz".into()),
            registry: None,
        };
        let LockResolution::Tarball { tarball, .. } =
            to_lock_resolution("/foo/1.0.0", &resolution, registry)
        else {
            panic!("expected tarball");
        };
        assert_eq!(tarball.as_deref(), Some("/foo/download/foo-1.0.0.tgz"));
    }

    #[test]
    fn test_git_and_directory_kept_verbatim() {
        let git = LockResolution::Git {
            kind: GitTag::Git,
            repo: "https://github.com/u/r.git".into(),
            commit: "abc".into(),
        };
        assert_eq!(to_lock_resolution("github.com/u/r/abc", &git, NPM), git);
        let dir = LockResolution::Directory {
            kind: DirectoryTag::Directory,
            directory: "../x".into(),
        };
        assert_eq!(to_lock_resolution("link:../x", &dir, NPM), dir);
    }

    #[test]
    fn test_children_partitioned_and_flags() {
        let manifest: Manifest = serde_json::from_value(serde_json::json!({
            "name": "app",
            "version": "1.0.0",
            "dependencies": {"a": "^1.0.0"},
            "optionalDependencies": {"b": "^1.0.0"},
            "peerDependencies": {"react": "*", "a": "*"},
            "engines": {"node": ">=8", "npm": "*"},
            "os": ["linux"]
        }))
        .unwrap();
        let mut app = node("app", "1.0.0", manifest);
        app.dev = true;
        app.prod = true;
        app.children.insert("a".into(), "registry.npmjs.org/a/1.0.0".into());
        app.children.insert("b".into(), "registry.npmjs.org/b/2.0.0".into());
        let mut b = node("b", "2.0.0", Manifest::default());
        b.optional = true;
        b.dev = true;
        b.prod = false;

        let entries = reconcile(
            &tree(vec![app, node("a", "1.0.0", Manifest::default()), b]),
            &Lockfile::new(NPM),
        );
        assert_eq!(entries.len(), 3);

        let app = entry(&entries, "/app/1.0.0");
        assert_eq!(app.dependencies.get("a").map(String::as_str), Some("1.0.0"));
        assert_eq!(app.optional_dependencies.get("b").map(String::as_str), Some("2.0.0"));
        assert_eq!(app.dev, None);
        assert_eq!(app.name, None);
        assert_eq!(app.id, None);
        assert_eq!(app.peer_dependencies.keys().collect::<Vec<_>>(), vec!["react"]);
        assert_eq!(app.engines.keys().collect::<Vec<_>>(), vec!["node"]);
        assert_eq!(app.os, vec!["linux".to_string()]);

        let b = entry(&entries, "/b/2.0.0");
        assert_eq!(b.dev, Some(true));
        assert!(b.optional);
        assert_eq!(entry(&entries, "/a/1.0.0").dev, Some(false));
    }

    #[test]
    fn test_previous_references_are_kept() {
        let mut wanted = Lockfile::new(NPM);
        let mut previous = DependencySnapshot::new(LockResolution::Tarball {
            integrity: Some("sha512-app".into()),
            tarball: None,
            registry: None,
        });
        previous.dependencies.insert("gone".into(), "3.0.0".into());
        previous.dependencies.insert("a".into(), "0.9.0".into());
        wanted.packages.insert("/app/1.0.0".into(), previous);

        let mut app = node("app", "1.0.0", Manifest::default());
        app.children.insert("a".into(), "registry.npmjs.org/a/1.0.0".into());
        let entries = reconcile(&tree(vec![app, node("a", "1.0.0", Manifest::default())]), &wanted);

        let app = entry(&entries, "/app/1.0.0");
        assert_eq!(app.dependencies.get("a").map(String::as_str), Some("1.0.0"));
        assert_eq!(app.dependencies.get("gone").map(String::as_str), Some("3.0.0"));
    }

    #[test]
    fn test_peer_variant_and_foreign_identity() {
        let mut plugin = node("plugin", "1.0.0", Manifest::default());
        plugin.absolute_path = "registry.npmjs.org/plugin/1.0.0_react@16.0.0".into();
        plugin.children.insert(
            "react".into(),
            "registry.npmjs.org/react/16.0.0".into(),
        );

        let mut git = node("r", "0.0.1", Manifest::default());
        git.pkg_id = "github.com/u/r/abc".into();
        git.absolute_path = "github.com/u/r/abc".into();
        git.resolution = LockResolution::Git {
            kind: GitTag::Git,
            repo: "https://github.com/u/r.git".into(),
            commit: "abc".into(),
        };

        let entries = reconcile(
            &tree(vec![plugin, node("react", "16.0.0", Manifest::default()), git]),
            &Lockfile::new(NPM),
        );
        let plugin = entry(&entries, "/plugin/1.0.0_react@16.0.0");
        assert_eq!(
            plugin.id.as_deref(),
            Some("registry.npmjs.org/plugin/1.0.0")
        );
        let git = entry(&entries, "github.com/u/r/abc");
        assert_eq!(git.name.as_deref(), Some("r"));
        assert_eq!(git.version.as_deref(), Some("0.0.1"));
        assert_eq!(git.id, None);
    }
}
