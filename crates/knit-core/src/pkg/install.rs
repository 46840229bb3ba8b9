//! The install entry point.
//!
//! Wires the pipeline together: resolve the project's specs, build the
//! dependency tree, resolve peers, link into `node_modules`, persist the
//! lockfiles and the modules state, then run lifecycle scripts.

use super::context::{ContextSettings, InstallContext};
use super::error::PkgError;
use super::fetch::FetchGate;
use super::link::{link_packages, symlink_dir, LinkOptions, LinkRequest, RootLink};
use super::lockfile::{LockResolution, Lockfile, RootRef, PRIVATE_LOCKFILE, WANTED_LOCKFILE};
use super::manifest::{save_dependencies, Manifest, SaveType};
use super::modules::ModulesState;
use super::peers::{resolve_peers, PeerOptions, TopParent};
use super::resolve::{resolve_dependencies, PackageRequest, ResolveOptions};
use super::scripts::{run_install_scripts, ScriptOptions, ScriptRunner, ROOT_POST_INSTALL_STAGES};
use super::spec::{specs_from_manifest, PackageSpec, SpecKind};
use super::tree::{build_tree, RootRequest};
use crate::config::InstallOptions;
use crate::error::Result;
use crate::paths::{node_modules, package_dir_in};
use futures::future::try_join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// A root dependency after the install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledRoot {
    /// Name in the project's `node_modules`.
    pub name: String,
    pub version: String,
    pub pkg_id: String,
    pub raw_spec: String,
    pub dev: bool,
    pub optional: bool,
}

/// What an install did.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub wanted: Lockfile,
    /// What `node_modules` now holds.
    pub current: Lockfile,
    /// Absolute paths materialized this run.
    pub materialized_paths: Vec<String>,
    /// Absolute paths removed as orphans.
    pub removed: Vec<String>,
    /// Raw spec → identity it resolved to.
    pub resolved: BTreeMap<String, String>,
    /// Identities kept in the lockfile but not installed.
    pub skipped: BTreeSet<String>,
    pub roots: Vec<InstalledRoot>,
}

/// Where named specs are saved in `package.json`.
#[derive(Debug, Clone, Copy)]
pub struct SaveOptions {
    pub save_type: SaveType,
}

struct InstallJob<'a> {
    root: &'a Path,
    manifest: Manifest,
    specs: Vec<PackageSpec>,
    update: bool,
    /// Installing a subset of the project's dependencies.
    save: Option<SaveOptions>,
    opts: &'a InstallOptions,
    gate: Arc<dyn FetchGate>,
    runner: &'a dyn ScriptRunner,
}

/// Install every dependency declared by the project at `root`.
///
/// # Errors
/// Fails when `package.json` is missing or invalid, a lockfile cannot be
/// read or written, a required package cannot be resolved, fetched or
/// linked, or a required lifecycle script fails.
pub async fn install(
    root: &Path,
    opts: &InstallOptions,
    gate: Arc<dyn FetchGate>,
    runner: &dyn ScriptRunner,
) -> Result<InstallOutcome> {
    let manifest = read_project_manifest(root)?;
    let mut specs = specs_from_manifest(&manifest);
    if opts.production {
        specs.retain(|spec| !is_dev_root(spec, &manifest));
    }

    run_install(InstallJob {
        root,
        manifest,
        specs,
        update: opts.update,
        save: None,
        opts,
        gate,
        runner,
    })
    .await
}

/// Install the packages named by `args` (`name`, `name@range`,
/// `alias@npm:name@range`, git or tarball specs) and save them into
/// `package.json`.
///
/// # Errors
/// Same as [`install`], plus `PKG_SPEC_INVALID` for a malformed argument.
pub async fn install_named(
    root: &Path,
    args: &[String],
    save: SaveOptions,
    opts: &InstallOptions,
    gate: Arc<dyn FetchGate>,
    runner: &dyn ScriptRunner,
) -> Result<InstallOutcome> {
    let manifest = read_project_manifest(root)?;
    let specs = args
        .iter()
        .map(|arg| {
            let mut spec = PackageSpec::parse(arg)?;
            spec.dev = matches!(save.save_type, SaveType::Dev);
            spec.optional = matches!(save.save_type, SaveType::Optional);
            Ok(spec)
        })
        .collect::<std::result::Result<Vec<_>, PkgError>>()?;

    run_install(InstallJob {
        root,
        manifest,
        specs,
        update: true,
        save: Some(save),
        opts,
        gate,
        runner,
    })
    .await
}

fn read_project_manifest(root: &Path) -> std::result::Result<Manifest, PkgError> {
    Manifest::read_from_dir(root)?
        .ok_or_else(|| PkgError::package_json_not_found(&root.join("package.json")))
}

/// Declared only in `devDependencies`.
fn is_dev_root(spec: &PackageSpec, manifest: &Manifest) -> bool {
    spec.dev
        && !manifest.dependencies.contains_key(&spec.name)
        && !manifest.optional_dependencies.contains_key(&spec.name)
}

#[allow(clippy::too_many_lines)]
async fn run_install(job: InstallJob<'_>) -> Result<InstallOutcome> {
    let InstallJob {
        root,
        mut manifest,
        mut specs,
        update,
        save,
        opts,
        gate,
        runner,
    } = job;
    let modules = node_modules(root);

    let (mut wanted, wanted_exists) =
        Lockfile::read_or_new(&root.join(WANTED_LOCKFILE), &opts.registry)?;
    let (current, current_exists) =
        Lockfile::read_or_new(&modules.join(PRIVATE_LOCKFILE), &opts.registry)?;
    let previous_state = ModulesState::read(&modules);
    let previously_skipped: HashSet<String> = previous_state
        .map(|state| state.skipped.into_iter().collect())
        .unwrap_or_default();

    let script_env = script_env();
    if !opts.ignore_scripts {
        if manifest.scripts.contains_key("prepublish") {
            tracing::warn!("the prepublish script is deprecated; use prepare instead");
        }
        runner
            .run(
                "preinstall",
                &manifest,
                &ScriptOptions {
                    cwd: root.to_path_buf(),
                    env: script_env.clone(),
                },
            )
            .await?;
    }

    for spec in &specs {
        if wanted.specifiers.get(&spec.name) != Some(&spec.raw_range) {
            wanted.remove_root_reference(&spec.name);
        }
    }
    specs.retain(|spec| {
        spec.kind == SpecKind::File || !is_external_link(&modules, &opts.store_dir, &spec.name)
    });

    let depth = if update {
        opts.depth
    } else if wanted.packages_equal(&current) {
        opts.repeat_install_depth
    } else {
        i64::MAX
    };
    let make_partial =
        save.is_some() && ((wanted_exists && !current_exists) || !wanted.packages_equal(&current));

    let root_references = wanted.root_references();
    let ctx = InstallContext::new(
        gate,
        wanted,
        current,
        ContextSettings {
            prefix: root.to_path_buf(),
            node_modules: modules.clone(),
            registry: opts.registry.clone(),
            scoped_registries: opts.scoped_registries.clone(),
            depth,
            force: opts.force,
            engine_strict: opts.engine_strict,
            node_version: opts.node_version.clone(),
        },
        previously_skipped,
    );

    let requests = resolve_dependencies(
        &ctx,
        specs.clone(),
        ResolveOptions::root(root_references, update),
    )
    .await?;

    let by_raw: HashMap<&str, &PackageSpec> =
        specs.iter().map(|spec| (spec.raw.as_str(), spec)).collect();
    let root_requests: Vec<RootRequest> = requests
        .iter()
        .map(|request| RootRequest {
            pkg_id: request.pkg_id.clone(),
            dev: by_raw
                .get(request.raw_spec.as_str())
                .is_some_and(|spec| is_dev_root(spec, &manifest)),
        })
        .collect();
    let tree = build_tree(&ctx, &root_requests)?;

    let new_names: HashSet<&str> = specs.iter().map(|spec| spec.name.as_str()).collect();
    let top_parents = top_parents(&manifest, &modules, &new_names);
    let resolved = resolve_peers(
        &tree,
        &top_parents,
        &PeerOptions {
            node_modules: modules.clone(),
            independent_leaves: opts.independent_leaves,
        },
    );

    let mut roots = Vec::with_capacity(requests.len());
    let mut installed_roots = Vec::with_capacity(requests.len());
    for request in &requests {
        let Some(spec) = by_raw.get(request.raw_spec.as_str()) else {
            continue;
        };
        let Some(absolute_path) = resolved.roots.get(&request.pkg_id) else {
            continue;
        };
        let dev = is_dev_root(spec, &manifest);
        let version = resolved
            .nodes
            .get(absolute_path)
            .map(|node| node.version.clone())
            .unwrap_or_default();
        installed_roots.push(InstalledRoot {
            name: spec.name.clone(),
            version,
            pkg_id: request.pkg_id.clone(),
            raw_spec: request.raw_spec.clone(),
            dev,
            optional: spec.optional,
        });
        roots.push(RootLink {
            alias: spec.name.clone(),
            pkg_id: request.pkg_id.clone(),
            absolute_path: absolute_path.clone(),
            dev,
            optional: spec.optional,
        });
    }

    let local_packages = ctx.local_packages();
    let mut local_roots = Vec::with_capacity(local_packages.len());
    let mut extra_roots = Vec::with_capacity(local_packages.len());
    for local in &local_packages {
        let alias = by_raw
            .get(local.raw_spec.as_str())
            .map_or_else(|| local.name.clone(), |spec| spec.name.clone());
        let reference = match &local.resolution {
            LockResolution::Directory { directory, .. } => format!("link:{directory}"),
            _ => local.id.clone(),
        };
        extra_roots.push(RootRef {
            name: alias.clone(),
            reference,
            dev: local.dev,
            optional: local.optional,
        });
        local_roots.push((alias, local));
    }

    if let Some(save) = save {
        let entries: Vec<(String, String)> = specs
            .iter()
            .filter_map(|spec| {
                let version = installed_roots
                    .iter()
                    .find(|r| r.raw_spec == spec.raw)
                    .map(|r| r.version.as_str())
                    .or_else(|| {
                        local_packages
                            .iter()
                            .find(|l| l.raw_spec == spec.raw)
                            .map(|l| l.version.as_str())
                    })?;
                Some((spec.name.clone(), save_spec(spec, version, opts)))
            })
            .collect();
        manifest = save_dependencies(&root.join("package.json"), &entries, save.save_type)?;
    }

    let skipped = ctx.skipped();
    let ctx_wanted = ctx.wanted.clone();
    let outcome = link_packages(
        LinkRequest {
            tree: &resolved,
            roots: &roots,
            extra_roots: &extra_roots,
            manifest: &manifest,
            wanted: ctx_wanted,
            private: &ctx.current,
            skipped: &skipped,
            gate: ctx.gate.as_ref(),
        },
        &LinkOptions {
            node_modules: modules.clone(),
            bin_dir: modules.join(".bin"),
            force: opts.force,
            production: opts.production,
            optional: opts.optional,
            make_partial_private: make_partial,
            link_concurrency: opts.link_concurrency,
        },
    )
    .await?;

    outcome.wanted.write_to(&root.join(WANTED_LOCKFILE))?;
    fs::create_dir_all(&modules).map_err(|e| {
        PkgError::node_modules_write_failed(format!("Failed to create {}: {e}", modules.display()))
    })?;
    outcome.private.write_to(&modules.join(PRIVATE_LOCKFILE))?;
    let skipped_sorted: BTreeSet<String> = skipped.iter().cloned().collect();
    ModulesState::new(
        opts.store_dir.clone(),
        skipped_sorted.clone(),
        opts.independent_leaves,
    )
    .write(&modules)?;

    if !opts.ignore_scripts {
        let limit = Semaphore::new(opts.child_concurrency.max(1));
        let locations: Vec<(String, PathBuf)> = outcome
            .updated_paths
            .iter()
            .filter_map(|abs| resolved.nodes.get(abs))
            .map(|node| (node.pkg_id.clone(), node.hardlinked_location.clone()))
            .collect();
        try_join_all(locations.iter().map(|(id, location)| {
            run_package_scripts(&ctx, runner, &limit, id, location, &script_env)
        }))
        .await?;
    }

    for (alias, local) in &local_roots {
        if (opts.production && local.dev) || (!opts.optional && local.optional) {
            continue;
        }
        let dest = package_dir_in(&modules, alias);
        if symlink_dir(&local.directory, &dest)? {
            tracing::info!(
                id = %local.id,
                name = %alias,
                version = %local.version,
                "added"
            );
        }
    }

    await_pending_fetches(&ctx, &skipped).await?;

    if !opts.ignore_scripts {
        let script_opts = ScriptOptions {
            cwd: root.to_path_buf(),
            env: script_env,
        };
        for stage in ROOT_POST_INSTALL_STAGES {
            runner.run(stage, &manifest, &script_opts).await?;
        }
    }

    let mut resolved_ids: BTreeMap<String, String> = requests
        .iter()
        .map(|PackageRequest { raw_spec, pkg_id, .. }| (raw_spec.clone(), pkg_id.clone()))
        .collect();
    for local in &local_packages {
        resolved_ids.insert(local.raw_spec.clone(), local.id.clone());
    }

    Ok(InstallOutcome {
        wanted: outcome.wanted,
        current: outcome.private,
        materialized_paths: outcome.updated_paths,
        removed: outcome.removed,
        resolved: resolved_ids,
        skipped: skipped_sorted,
        roots: installed_roots,
    })
}

fn script_env() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "npm_config_user_agent".to_string(),
        format!(
            "{}/{}",
            crate::version::PACKAGE_MANAGER,
            crate::version::VERSION
        ),
    )])
}

/// Run a freshly materialized package's install scripts. Failures of
/// optional packages are logged.
async fn run_package_scripts(
    ctx: &InstallContext,
    runner: &dyn ScriptRunner,
    limit: &Semaphore,
    id: &str,
    location: &Path,
    env: &BTreeMap<String, String>,
) -> std::result::Result<(), PkgError> {
    let _permit = limit
        .acquire()
        .await
        .map_err(|e| PkgError::script_failed(e.to_string()))?;
    match run_install_scripts(runner, location, env).await {
        Ok(()) => Ok(()),
        Err(e) if !ctx.is_non_optional(id) => {
            tracing::warn!(id = %id, error = %e, "skipping failed optional dependency script");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Wait for the content of skipped packages and every integrity check.
async fn await_pending_fetches(
    ctx: &InstallContext,
    skipped: &HashSet<String>,
) -> std::result::Result<(), PkgError> {
    let installs = ctx.installs();
    for id in skipped {
        if let Some(pkg) = installs.get(id) {
            if let Err(e) = pkg.handles.files.clone().await {
                tracing::debug!(id = %id, error = %e, "skipped package failed to fetch");
            }
        }
    }

    for (id, pkg) in &installs {
        match pkg.handles.integrity.clone().await {
            Ok(()) => {}
            Err(e) if ctx.is_non_optional(id) && !skipped.contains(id) => return Err(e),
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "integrity check of optional package failed");
            }
        }
    }
    Ok(())
}

/// The range to save for a named spec.
///
/// Version, range and tag specs save the resolved version with the
/// configured prefix; everything else is saved as given.
fn save_spec(spec: &PackageSpec, version: &str, opts: &InstallOptions) -> String {
    let prefix = if opts.save_exact {
        ""
    } else {
        opts.save_prefix.as_str()
    };
    match &spec.kind {
        SpecKind::Version | SpecKind::Range | SpecKind::Tag => format!("{prefix}{version}"),
        SpecKind::Alias { target, .. } => format!("npm:{target}@{prefix}{version}"),
        _ => spec.raw_range.clone(),
    }
}

/// Versions of the project's other direct dependencies, as found in
/// `node_modules`; they can satisfy peers of the packages being installed.
fn top_parents(manifest: &Manifest, modules: &Path, new_names: &HashSet<&str>) -> Vec<TopParent> {
    manifest
        .all_dependency_names()
        .filter(|name| !new_names.contains(name.as_str()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter_map(|name| {
            let installed = Manifest::read_from_dir(&package_dir_in(modules, name))
                .ok()
                .flatten()?;
            Some(TopParent {
                name: name.clone(),
                version: installed.version,
            })
        })
        .collect()
}

/// `node_modules/<name>` is a symlink to somewhere outside both
/// `node_modules` and the store, e.g. a package linked by hand.
fn is_external_link(modules: &Path, store: &Path, name: &str) -> bool {
    let path = package_dir_in(modules, name);
    let Ok(meta) = fs::symlink_metadata(&path) else {
        return false;
    };
    if !meta.file_type().is_symlink() {
        return false;
    }
    let Ok(target) = fs::read_link(&path) else {
        return false;
    };
    let target = match path.parent() {
        Some(parent) if target.is_relative() => parent.join(target),
        _ => target,
    };
    if target.starts_with(modules) || target.starts_with(store) {
        return false;
    }
    tracing::info!(
        name = %name,
        target = %target.display(),
        "leaving package linked from outside node_modules"
    );
    true
}
