//! Recursive dependency resolution.
//!
//! Every spec is resolved concurrently. Each identity is expanded once: the
//! first branch to reach it marks it processed and resolves its children,
//! every other branch only records a reference to it. A branch completes
//! after its whole subtree has completed.

use super::context::{InstallContext, InstalledPackage, LocalPackage};
use super::dep_path;
use super::error::PkgError;
use super::fetch::ResolveHints;
use super::installable::{is_installable, InstallabilityOptions};
use super::lockfile::{DependencySnapshot, LockResolution, Lockfile};
use super::manifest::Manifest;
use super::registry::default_tarball_url;
use super::spec::{dependency_specs, PackageSpec, SpecKind};
use super::version::version_satisfies;
use futures::future::{try_join_all, BoxFuture, FutureExt};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

/// One resolved spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequest {
    pub pkg_id: String,
    pub depth: i64,
    /// `name@range` as requested.
    pub raw_spec: String,
}

/// Options for one level of resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Identities from the root down to the dependent.
    pub ancestors: Vec<String>,
    pub depth: i64,
    /// Name → reference pins from the wanted lockfile.
    pub resolved_dependencies: BTreeMap<String, String>,
    /// References used by a previous version of the dependent; reused when
    /// they still satisfy the range.
    pub preferred_dependencies: BTreeMap<String, String>,
    pub optional_dependency_names: BTreeSet<String>,
    pub parent_installable: bool,
    pub update: bool,
}

impl ResolveOptions {
    /// Options for the project's own dependencies.
    #[must_use]
    pub fn root(resolved_dependencies: BTreeMap<String, String>, update: bool) -> Self {
        Self {
            resolved_dependencies,
            parent_installable: true,
            update,
            ..Self::default()
        }
    }
}

/// What the wanted lockfile knows about a reference.
#[derive(Debug, Clone, Default)]
struct LockedInfo {
    dep_path: String,
    absolute_path: Option<String>,
    snapshot: Option<DependencySnapshot>,
    pkg_id: Option<String>,
    resolution: Option<LockResolution>,
    resolved_dependencies: BTreeMap<String, String>,
    optional_dependency_names: BTreeSet<String>,
}

fn locked_info(lockfile: &Lockfile, reference: &str, name: &str) -> Result<LockedInfo, PkgError> {
    let Some(dep_path) = dep_path::ref_to_relative(reference, name) else {
        return Ok(LockedInfo::default());
    };

    let Some(snapshot) = lockfile.packages.get(&dep_path) else {
        return Ok(LockedInfo {
            pkg_id: Some(dep_path::resolve(&lockfile.registry, &dep_path)),
            dep_path,
            ..LockedInfo::default()
        });
    };

    let absolute = dep_path::resolve(&lockfile.registry, &dep_path);
    Ok(LockedInfo {
        pkg_id: Some(snapshot.id.clone().unwrap_or_else(|| absolute.clone())),
        resolution: Some(snapshot_resolution(&dep_path, snapshot, &lockfile.registry)?),
        resolved_dependencies: snapshot.all_dependencies(),
        optional_dependency_names: snapshot.optional_dependencies.keys().cloned().collect(),
        absolute_path: Some(absolute),
        snapshot: Some(snapshot.clone()),
        dep_path,
    })
}

/// Expand a stored resolution back into one with absolute URLs.
///
/// # Errors
/// Returns `PKG_LOCKFILE_INVALID` when a registry package's tarball cannot be
/// derived from its dependency path.
pub fn snapshot_resolution(
    dep_path: &str,
    snapshot: &DependencySnapshot,
    registry: &str,
) -> Result<LockResolution, PkgError> {
    let LockResolution::Tarball {
        integrity,
        tarball,
        registry: own_registry,
    } = &snapshot.resolution
    else {
        return Ok(snapshot.resolution.clone());
    };

    let tarball = match tarball {
        None => {
            let registry = own_registry.as_deref().unwrap_or(registry);
            let (name, version) = dep_path::parse(dep_path).ok_or_else(|| {
                PkgError::lockfile_invalid(format!(
                    "Couldn't get tarball URL from dependency path {dep_path}"
                ))
            })?;
            return Ok(LockResolution::Tarball {
                integrity: integrity.clone(),
                tarball: Some(default_tarball_url(registry, &name, &version)),
                registry: Some(registry.to_string()),
            });
        }
        Some(t) if t.starts_with("file:") || t.contains("://") => t.clone(),
        Some(relative) => format!(
            "{}/{}",
            registry.trim_end_matches('/'),
            relative.trim_start_matches('/')
        ),
    };

    Ok(LockResolution::Tarball {
        integrity: integrity.clone(),
        tarball: Some(tarball),
        registry: own_registry.clone(),
    })
}

/// Resolve `specs` and everything below them.
///
/// Returns one request per spec that produced a package; specs skipped by the
/// repeat-install fast path, local packages, cycles and failed optional
/// dependencies produce nothing.
pub fn resolve_dependencies<'a>(
    ctx: &'a InstallContext,
    specs: Vec<PackageSpec>,
    opts: ResolveOptions,
) -> BoxFuture<'a, Result<Vec<PackageRequest>, PkgError>> {
    async move {
        let update = opts.update && opts.depth <= ctx.settings.depth;
        let mut branches = Vec::with_capacity(specs.len());

        for mut spec in specs {
            if opts.optional_dependency_names.contains(&spec.name) {
                spec.optional = true;
            }
            let mut reference = opts.resolved_dependencies.get(&spec.name).cloned();
            let mut proceed = false;

            // Keep what the previous version of the dependent used while it
            // still satisfies the new range.
            if reference.is_none() && spec.kind == SpecKind::Range {
                if let Some(preferred) = opts.preferred_dependencies.get(&spec.name) {
                    if version_satisfies(preferred, &spec.raw_range) {
                        proceed = true;
                        reference = Some(preferred.clone());
                    }
                }
            }

            let locked = match reference {
                Some(r) => locked_info(&ctx.wanted, &r, &spec.name)?,
                None => LockedInfo::default(),
            };

            branches.push(resolve_dependency(
                ctx,
                spec,
                locked,
                Flags { proceed, update },
                &opts,
            ));
        }

        let results = try_join_all(branches).await?;
        Ok(results.into_iter().flatten().collect())
    }
    .boxed()
}

#[derive(Debug, Clone, Copy)]
struct Flags {
    proceed: bool,
    update: bool,
}

async fn resolve_dependency(
    ctx: &InstallContext,
    spec: PackageSpec,
    locked: LockedInfo,
    flags: Flags,
    opts: &ResolveOptions,
) -> Result<Option<PackageRequest>, PkgError> {
    let mut known_id = None;
    let optional = spec.optional;
    let raw = spec.raw.clone();

    match resolve_package(ctx, spec, locked, flags, opts, &mut known_id).await {
        Ok(request) => Ok(request),
        Err(e) if optional => {
            tracing::warn!(
                spec = %raw,
                error = %e,
                "skipping failed optional dependency"
            );
            if let Some(id) = known_id {
                ctx.skip(&id);
            }
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

#[allow(clippy::cast_possible_wrap)]
async fn resolve_package(
    ctx: &InstallContext,
    spec: PackageSpec,
    mut locked: LockedInfo,
    flags: Flags,
    opts: &ResolveOptions,
    known_id: &mut Option<String>,
) -> Result<Option<PackageRequest>, PkgError> {
    let settings = &ctx.settings;
    let proceed = flags.proceed
        || locked.resolution.is_none()
        || settings.force
        || (opts.ancestors.len() as i64) <= settings.depth;

    if !proceed {
        if let Some(absolute) = &locked.absolute_path {
            // Not in the current lockfile means not in node_modules either.
            if ctx.current.packages.contains_key(&locked.dep_path)
                && exists(&dep_path::location(&settings.node_modules, absolute)).await
                && (opts.depth > 0 || exists(&settings.node_modules.join(&spec.name)).await)
            {
                tracing::trace!(dep_path = %locked.dep_path, "already in node_modules");
                return Ok(None);
            }
        }
    }

    let with_chain = |e: PkgError| e.with_ancestors(&opts.ancestors);
    let dependent = opts.ancestors.last();
    tracing::debug!(
        status = "resolving",
        spec = %spec.raw,
        dependent = dependent.map(String::as_str),
    );

    let hints = ResolveHints {
        pkg_id: locked.pkg_id.clone(),
        resolution: locked.resolution.clone(),
        update: flags.update,
        registry: ctx.registry_for(&spec.name),
    };
    let resolved = ctx.gate.resolve(&spec, &hints).await.map_err(with_chain)?;
    let id = resolved.id.clone();
    *known_id = Some(id.clone());

    if resolved.is_local {
        let manifest = resolved.manifest.clone().unwrap_or_default();
        if opts.depth > 0 {
            tracing::warn!(
                spec = %spec.raw,
                "ignoring file dependency because it is not a root dependency"
            );
        } else if let LockResolution::Directory { directory, .. } = &resolved.resolution {
            ctx.push_local(LocalPackage {
                id: id.clone(),
                raw_spec: spec.raw.clone(),
                name: manifest.name.clone(),
                version: manifest.version.clone(),
                dev: spec.dev,
                optional: spec.optional,
                directory: settings.prefix.join(directory),
                resolution: resolved.resolution.clone(),
            });
        }
        tracing::debug!(status = "resolved", id = %id, version = %manifest.version);
        return Ok(None);
    }

    if let Some(dependent) = dependent {
        if opts
            .ancestors
            .windows(2)
            .any(|pair| pair[0] == *dependent && pair[1] == id)
        {
            return Ok(None);
        }
    }

    let handles = ctx.fetch_once(&resolved);

    // Every locked entry records the manifest fields resolution reads, so any
    // snapshot can stand in for the registry manifest.
    let use_lockfile_manifest = !flags.update && locked.snapshot.is_some();
    let manifest: Arc<Manifest> = match &locked.snapshot {
        Some(snapshot) if use_lockfile_manifest => {
            for peer in snapshot.peer_dependencies.keys() {
                locked.resolved_dependencies.remove(peer);
            }
            Arc::new(snapshot.to_manifest(&locked.dep_path))
        }
        _ => handles.manifest.clone().await.map_err(with_chain)?,
    };

    if let Some(deprecated) = &manifest.deprecated {
        tracing::warn!(
            name = %manifest.name,
            version = %manifest.version,
            id = %id,
            depth = opts.depth,
            deprecated = %deprecated,
            "deprecated package"
        );
    }
    tracing::debug!(status = "resolved", id = %id, version = %manifest.version);

    let current_installable = settings.force
        || is_installable(
            &id,
            &manifest,
            InstallabilityOptions {
                optional: spec.optional,
                engine_strict: settings.engine_strict,
                node_version: settings.node_version.as_deref(),
            },
        )
        .map_err(with_chain)?;
    let installable = opts.parent_installable && current_installable;

    if installable {
        ctx.unskip(&id);
    }
    if !spec.optional {
        ctx.add_non_optional(&id);
    }

    let request = PackageRequest {
        pkg_id: id.clone(),
        depth: opts.depth,
        raw_spec: spec.raw.clone(),
    };

    if !ctx.mark_processed(&id) {
        if !spec.optional {
            if let Some(err) = ctx.failure(&id) {
                return Err(err);
            }
        }
        return Ok(Some(request));
    }
    if !installable {
        // Kept in the lockfile so other platforms still install it.
        ctx.skip(&id);
    }

    let same_package = locked.pkg_id.as_deref() == Some(id.as_str());
    let mut child_specs = dependency_specs(&manifest);
    if use_lockfile_manifest && child_specs.is_empty() && !locked.resolved_dependencies.is_empty()
    {
        child_specs = locked
            .resolved_dependencies
            .keys()
            .map(|name| {
                PackageSpec::from_dependency(
                    name,
                    "",
                    false,
                    locked.optional_dependency_names.contains(name),
                )
            })
            .collect();
    }

    let mut ancestors = opts.ancestors.clone();
    ancestors.push(id.clone());
    let (resolved_dependencies, preferred_dependencies) = if same_package {
        (std::mem::take(&mut locked.resolved_dependencies), BTreeMap::new())
    } else {
        (BTreeMap::new(), std::mem::take(&mut locked.resolved_dependencies))
    };

    let children = resolve_dependencies(
        ctx,
        child_specs,
        ResolveOptions {
            ancestors,
            depth: opts.depth + 1,
            resolved_dependencies,
            preferred_dependencies,
            optional_dependency_names: std::mem::take(&mut locked.optional_dependency_names),
            parent_installable: installable,
            update: flags.update,
        },
    )
    .await
    .map_err(|e| {
        ctx.record_failure(&id, e.clone());
        e
    })?;

    let path = ctx.gate.package_path(&id);
    ctx.insert_installed(InstalledPackage {
        id,
        name: manifest.name.clone(),
        version: manifest.version.clone(),
        resolution: resolved.resolution,
        has_bins: use_lockfile_manifest || manifest.has_bins(),
        manifest,
        path,
        handles,
        installable: current_installable,
        children: children.into_iter().map(|c| c.pkg_id).collect(),
        dev: spec.dev,
        prod: !spec.dev && !spec.optional,
        depth: opts.depth,
    });

    Ok(Some(request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::context::ContextSettings;
    use crate::pkg::testing::{MockGate, NPM};
    use serde_json::json;
    use std::collections::HashSet;

    fn settings(depth: i64) -> ContextSettings {
        ContextSettings {
            registry: NPM.to_string(),
            depth,
            ..ContextSettings::default()
        }
    }

    fn context(gate: &Arc<MockGate>, wanted: Lockfile, depth: i64) -> InstallContext {
        InstallContext::new(
            Arc::clone(gate) as Arc<dyn super::super::fetch::FetchGate>,
            wanted,
            Lockfile::new(NPM),
            settings(depth),
            HashSet::new(),
        )
    }

    fn spec(name: &str, range: &str) -> PackageSpec {
        PackageSpec::from_dependency(name, range, false, false)
    }

    #[tokio::test]
    async fn test_shared_dependency_resolved_and_fetched_once() {
        let gate = Arc::new(MockGate::new().with_delay_ms(10));
        gate.publish("a", "1.0.0", json!({"dependencies": {"shared": "^1.0.0"}}));
        gate.publish("b", "1.0.0", json!({"dependencies": {"shared": "^1.0.0"}}));
        gate.publish("c", "1.0.0", json!({"dependencies": {"shared": "1.x"}}));
        gate.publish("shared", "1.2.0", json!({}));
        let ctx = context(&gate, Lockfile::new(NPM), i64::MAX);

        let requests = resolve_dependencies(
            &ctx,
            vec![spec("a", "^1.0.0"), spec("b", "^1.0.0"), spec("c", "^1.0.0")],
            ResolveOptions::root(BTreeMap::new(), false),
        )
        .await
        .unwrap();

        assert_eq!(requests.len(), 3);
        let shared = "registry.npmjs.org/shared/1.2.0";
        assert_eq!(gate.fetches_of(shared), 1);
        assert_eq!(ctx.installs().len(), 4);
        for parent in ["a", "b", "c"] {
            let pkg = ctx
                .installed(&format!("registry.npmjs.org/{parent}/1.0.0"))
                .unwrap();
            assert_eq!(pkg.children, vec![shared.to_string()]);
        }
    }

    #[tokio::test]
    async fn test_cycle_terminates() {
        let gate = Arc::new(MockGate::new());
        gate.publish("a", "1.0.0", json!({"dependencies": {"b": "1.0.0"}}));
        gate.publish("b", "1.0.0", json!({"dependencies": {"a": "1.0.0"}}));
        let ctx = context(&gate, Lockfile::new(NPM), i64::MAX);

        let requests = resolve_dependencies(
            &ctx,
            vec![spec("a", "1.0.0")],
            ResolveOptions::root(BTreeMap::new(), false),
        )
        .await
        .unwrap();

        assert_eq!(requests.len(), 1);
        let a = ctx.installed("registry.npmjs.org/a/1.0.0").unwrap();
        let b = ctx.installed("registry.npmjs.org/b/1.0.0").unwrap();
        assert_eq!(a.children, vec![b.id.clone()]);
        assert_eq!(b.children, vec![a.id.clone()]);
    }

    #[tokio::test]
    async fn test_update_prefers_previous_child_reference() {
        let gate = Arc::new(MockGate::new());
        gate.publish("foo", "1.0.0", json!({"dependencies": {"bar": "^1.0.0"}}));
        gate.publish("foo", "1.1.0", json!({"dependencies": {"bar": "^1.0.0"}}));
        gate.publish("bar", "1.0.0", json!({}));
        gate.publish("bar", "1.5.0", json!({}));

        let mut wanted = Lockfile::new(NPM);
        wanted.dependencies.insert("foo".into(), "1.0.0".into());
        let mut foo = DependencySnapshot::new(gate.lock_resolution("foo", "1.0.0"));
        foo.dependencies.insert("bar".into(), "1.0.0".into());
        wanted.packages.insert("/foo/1.0.0".into(), foo);
        wanted.packages.insert(
            "/bar/1.0.0".into(),
            DependencySnapshot::new(gate.lock_resolution("bar", "1.0.0")),
        );

        let ctx = context(&gate, wanted, 0);
        let roots = ctx.wanted.root_references();
        resolve_dependencies(
            &ctx,
            vec![spec("foo", "^1.0.0")],
            ResolveOptions::root(roots, true),
        )
        .await
        .unwrap();

        let foo = ctx.installed("registry.npmjs.org/foo/1.1.0").unwrap();
        assert_eq!(foo.children, vec!["registry.npmjs.org/bar/1.0.0".to_string()]);
    }

    #[tokio::test]
    async fn test_optional_platform_failure_is_skipped() {
        let gate = Arc::new(MockGate::new());
        let other_os = format!("!{}", crate::pkg::installable::current_os());
        gate.publish("app-dep", "1.0.0", json!({"optionalDependencies": {"native": "^1.0.0"}}));
        gate.publish("native", "1.0.0", json!({"os": [other_os]}));
        let ctx = context(&gate, Lockfile::new(NPM), i64::MAX);

        resolve_dependencies(
            &ctx,
            vec![spec("app-dep", "^1.0.0")],
            ResolveOptions::root(BTreeMap::new(), false),
        )
        .await
        .unwrap();

        let native = "registry.npmjs.org/native/1.0.0";
        assert!(ctx.is_skipped(native));
        assert!(!ctx.installed(native).unwrap().installable);
        assert!(!ctx.is_non_optional(native));
    }

    #[tokio::test]
    async fn test_required_failure_carries_ancestors() {
        let gate = Arc::new(MockGate::new());
        gate.publish("a", "1.0.0", json!({"dependencies": {"missing": "^1.0.0"}}));
        let ctx = context(&gate, Lockfile::new(NPM), i64::MAX);

        let err = resolve_dependencies(
            &ctx,
            vec![spec("a", "^1.0.0")],
            ResolveOptions::root(BTreeMap::new(), false),
        )
        .await
        .unwrap_err();

        assert!(err.message().contains(">registry.npmjs.org/a/1.0.0"));
    }

    #[tokio::test]
    async fn test_failed_optional_dependency_does_not_abort() {
        let gate = Arc::new(MockGate::new());
        gate.publish("a", "1.0.0", json!({"optionalDependencies": {"missing": "^1.0.0"}}));
        let ctx = context(&gate, Lockfile::new(NPM), i64::MAX);

        let requests = resolve_dependencies(
            &ctx,
            vec![spec("a", "^1.0.0")],
            ResolveOptions::root(BTreeMap::new(), false),
        )
        .await
        .unwrap();
        assert_eq!(requests.len(), 1);
        assert!(ctx
            .installed("registry.npmjs.org/a/1.0.0")
            .unwrap()
            .children
            .is_empty());
    }

    #[test]
    fn test_snapshot_resolution_forms() {
        let registry = "https://registry.npmjs.org/";
        let integrity_only = DependencySnapshot::new(LockResolution::Tarball {
            integrity: Some("sha512-x".into()),
            tarball: None,
            registry: None,
        });
        let LockResolution::Tarball { tarball, .. } =
            snapshot_resolution("/@types/node/20.0.0", &integrity_only, registry).unwrap()
        else {
            panic!("expected tarball");
        };
        assert_eq!(
            tarball.as_deref(),
            Some("https://registry.npmjs.org/@types/node/-/node-20.0.0.tgz")
        );

        let relative = DependencySnapshot::new(LockResolution::Tarball {
            integrity: Some("sha512-x".into()),
            tarball: Some("/foo/download/foo-1.0.0.tgz".into()),
            registry: None,
        });
        let LockResolution::Tarball { tarball, .. } =
            snapshot_resolution("/foo/1.0.0", &relative, "https://npm.corp/repo/").unwrap()
        else {
            panic!("expected tarball");
        };
        assert_eq!(
            tarball.as_deref(),
            Some("https://npm.corp/repo/foo/download/foo-1.0.0.tgz")
        );

        let unparsable = DependencySnapshot::new(LockResolution::Tarball {
            integrity: None,
            tarball: None,
            registry: None,
        });
        assert!(snapshot_resolution("garbage", &unparsable, registry).is_err());
    }

    #[test]
    fn test_locked_reference_leads_back_to_identity() {
        use crate::pkg::lockfile::GitTag;
        use crate::pkg::reconcile::lock_key;

        let tarball = LockResolution::Tarball {
            integrity: Some("sha512-x".into()),
            tarball: None,
            registry: None,
        };
        let git = LockResolution::Git {
            kind: GitTag::Git,
            repo: "https://github.com/u/r.git".into(),
            commit: "abc".into(),
        };
        let cases = [
            ("left-pad", "registry.npmjs.org/left-pad/1.3.0", "registry.npmjs.org/left-pad/1.3.0", &tarball),
            ("@scope/pkg", "registry.npmjs.org/@scope/pkg/2.0.0", "registry.npmjs.org/@scope/pkg/2.0.0", &tarball),
            (
                "plugin",
                "registry.npmjs.org/plugin/1.0.0_react@16.2.0",
                "registry.npmjs.org/plugin/1.0.0",
                &tarball,
            ),
            ("r", "github.com/u/r/abc", "github.com/u/r/abc", &git),
        ];

        let mut lockfile = Lockfile::new(NPM);
        for (_, absolute, id, resolution) in &cases {
            let mut snapshot = DependencySnapshot::new((*resolution).clone());
            if absolute != id {
                snapshot.id = Some((*id).to_string());
            }
            lockfile.packages.insert(lock_key(NPM, absolute), snapshot);
        }

        for (name, absolute, id, resolution) in cases {
            let is_registry = matches!(resolution, LockResolution::Tarball { .. });
            let reference = dep_path::absolute_path_to_ref(absolute, name, is_registry, NPM);
            assert_eq!(
                dep_path::ref_to_relative(&reference, name),
                Some(lock_key(NPM, absolute))
            );
            let info = locked_info(&lockfile, &reference, name).unwrap();
            assert_eq!(info.pkg_id.as_deref(), Some(id));
            assert_eq!(info.absolute_path.as_deref(), Some(absolute));
            assert!(info.snapshot.is_some());
        }
    }
}
