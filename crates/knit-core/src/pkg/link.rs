//! Materializing a resolved tree into `node_modules`.
//!
//! Every package gets a private directory `node_modules/.<absolute path>/`
//! whose `node_modules` holds the package itself (hardlinked from the store)
//! next to symlinks to its dependencies. Root dependencies are symlinked into
//! the project's `node_modules`.

use super::bins::{link_bins, link_pkg_bins};
use super::error::PkgError;
use super::fetch::{FetchGate, PackageContentInfo};
use super::lockfile::{DependencySnapshot, FilterOptions, Lockfile, RootRef};
use super::manifest::Manifest;
use super::orphans::remove_orphans;
use super::peers::{ResolvedNode, ResolvedTree};
use super::reconcile::{lock_key, reconcile, reference_for};
use crate::paths::package_dir_in;
use futures::future::try_join_all;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub node_modules: PathBuf,
    /// Where root dependencies' executables go.
    pub bin_dir: PathBuf,
    pub force: bool,
    pub production: bool,
    pub optional: bool,
    /// Keep previously materialized packages in the private lockfile.
    pub make_partial_private: bool,
    pub link_concurrency: usize,
}

/// A root dependency as the project declares it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootLink {
    /// Name in the project's `node_modules`; differs from the package name
    /// for aliases.
    pub alias: String,
    pub pkg_id: String,
    pub absolute_path: String,
    pub dev: bool,
    pub optional: bool,
}

pub struct LinkRequest<'a> {
    pub tree: &'a ResolvedTree,
    pub roots: &'a [RootLink],
    /// Root references that are not part of the tree (`link:` directories).
    pub extra_roots: &'a [RootRef],
    pub manifest: &'a Manifest,
    pub wanted: Lockfile,
    pub private: &'a Lockfile,
    pub skipped: &'a HashSet<String>,
    /// Store references are counted through it.
    pub gate: &'a dyn FetchGate,
}

#[derive(Debug, Clone)]
pub struct LinkOutcome {
    pub wanted: Lockfile,
    pub private: Lockfile,
    /// Absolute paths whose directories were (re)linked this run.
    pub updated_paths: Vec<String>,
    /// Absolute paths removed as orphans.
    pub removed: Vec<String>,
}

/// Run-scoped linking state.
struct Linker {
    limit: Semaphore,
    /// Set after the first cross-device failure; content is copied from then on.
    copy: Arc<AtomicBool>,
    force: bool,
    optional: bool,
}

/// Write snapshots, materialize new packages, sweep orphans and link roots.
///
/// # Errors
/// Any failure to materialize a package or create a link is fatal.
pub async fn link_packages(
    req: LinkRequest<'_>,
    opts: &LinkOptions,
) -> Result<LinkOutcome, PkgError> {
    let LinkRequest {
        tree,
        roots,
        extra_roots,
        manifest,
        mut wanted,
        private,
        skipped,
        gate,
    } = req;

    let entries = reconcile(tree, &wanted);
    let previous = private.filter(FilterOptions {
        skipped,
        production: opts.production,
        optional: opts.optional,
    });

    let linker = Linker {
        limit: Semaphore::new(opts.link_concurrency.max(1)),
        copy: Arc::new(AtomicBool::new(false)),
        force: opts.force,
        optional: opts.optional,
    };

    let by_key: HashMap<String, &ResolvedNode> = tree
        .nodes
        .values()
        .map(|n| (lock_key(&wanted.registry, &n.absolute_path), n))
        .collect();
    let to_link: Vec<&ResolvedNode> = entries
        .iter()
        .filter_map(|(key, snapshot)| {
            let node = *by_key.get(key)?;
            (node.installable && !is_up_to_date(previous.packages.get(key), snapshot, opts.force))
                .then_some(node)
        })
        .collect();

    let linked = try_join_all(to_link.iter().map(|node| linker.link_one(node, tree))).await?;
    let failed: HashSet<String> = to_link
        .iter()
        .zip(&linked)
        .filter(|(_, ok)| !**ok)
        .map(|(node, _)| node.absolute_path.clone())
        .collect();
    let to_link: Vec<&ResolvedNode> = to_link
        .into_iter()
        .filter(|node| !failed.contains(&node.absolute_path))
        .collect();
    try_join_all(
        to_link
            .iter()
            .map(|node| linker.link_children(node, tree, &failed)),
    )
    .await?;
    try_join_all(
        to_link
            .iter()
            .map(|node| linker.link_dependency_bins(node, tree, &failed)),
    )
    .await?;
    if !to_link.is_empty() {
        let imported: Vec<String> = to_link.iter().map(|n| n.pkg_id.clone()).collect();
        gate.add_references(&imported)?;
    }
    let updated_paths: Vec<String> = to_link.iter().map(|n| n.absolute_path.clone()).collect();

    wanted.packages.extend(entries);
    let mut root_refs: Vec<RootRef> = roots
        .iter()
        .filter_map(|root| {
            let node = tree.nodes.get(&root.absolute_path)?;
            Some(RootRef {
                name: root.alias.clone(),
                reference: reference_for(node, &wanted.registry),
                dev: root.dev,
                optional: root.optional,
            })
        })
        .collect();
    root_refs.extend(extra_roots.iter().cloned());
    wanted.sync_with_manifest(manifest, &root_refs);
    let new_wanted = wanted.prune(manifest);

    let removed = remove_orphans(private, &new_wanted, &opts.node_modules, gate);

    for root in roots {
        if skipped.contains(&root.pkg_id)
            || (opts.production && root.dev)
            || (!opts.optional && root.optional)
        {
            continue;
        }
        let Some(node) = tree
            .nodes
            .get(&root.absolute_path)
            .filter(|n| n.installable && !failed.contains(&n.absolute_path))
        else {
            continue;
        };
        let dest = package_dir_in(&opts.node_modules, &root.alias);
        if symlink_dir(&node.hardlinked_location, &dest)? {
            tracing::info!(
                id = %node.pkg_id,
                name = %root.alias,
                version = %node.version,
                dependency_type = dependency_type(root),
                "added"
            );
        }
        tracing::debug!(id = %node.pkg_id, status = "installed");
    }

    link_bins(&opts.node_modules, &opts.bin_dir)?;

    let mut private = if opts.make_partial_private {
        let resolved: BTreeSet<String> = tree.nodes.keys().cloned().collect();
        Lockfile::partial_private(private, &new_wanted, &resolved)
    } else {
        new_wanted.clone()
    };
    // Not on disk, so the next install retries them.
    private
        .packages
        .retain(|key, _| !failed.contains(&new_wanted.absolute_path(key)));

    Ok(LinkOutcome {
        wanted: new_wanted,
        private,
        updated_paths,
        removed,
    })
}

fn dependency_type(root: &RootLink) -> &'static str {
    if root.dev {
        "dev"
    } else if root.optional {
        "optional"
    } else {
        "prod"
    }
}

/// Materialized with the same dependency maps during a previous install.
fn is_up_to_date(
    previous: Option<&DependencySnapshot>,
    snapshot: &DependencySnapshot,
    force: bool,
) -> bool {
    !force
        && previous.is_some_and(|p| {
            p.dependencies == snapshot.dependencies
                && p.optional_dependencies == snapshot.optional_dependencies
        })
}

impl Linker {
    /// Import one package from the store. Returns false when an optional
    /// package's content could not be fetched.
    async fn link_one(&self, node: &ResolvedNode, tree: &ResolvedTree) -> Result<bool, PkgError> {
        let content = match node.handles.files.clone().await {
            Ok(content) => content,
            Err(e) if node.optional => {
                tracing::warn!(
                    id = %node.pkg_id,
                    error = %e,
                    "skipping optional dependency that failed to fetch"
                );
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        if node.independent {
            return Ok(true);
        }

        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|e| PkgError::link_failed(e.to_string()))?;

        let src = node.store_path.clone();
        let dest = node.hardlinked_location.clone();
        let copy = Arc::clone(&self.copy);
        let force = self.force;
        tokio::task::spawn_blocking(move || import_package(&src, &dest, &content, force, &copy))
            .await
            .map_err(|e| PkgError::link_failed(format!("link task failed: {e}")))??;

        if node.has_bundled_dependencies {
            let bundled = node.hardlinked_location.join("node_modules");
            link_bins(&bundled, &bundled.join(".bin"))?;
        }
        Ok(true)
    }

    /// Symlink the children of an imported package next to it.
    async fn link_children(
        &self,
        node: &ResolvedNode,
        tree: &ResolvedTree,
        failed: &HashSet<String>,
    ) -> Result<(), PkgError> {
        if node.independent {
            return Ok(());
        }
        for (name, child) in self.wanted_children(node, tree, failed) {
            symlink_dir(&child.hardlinked_location, &package_dir_in(&node.modules_dir, name))?;
        }
        Ok(())
    }

    async fn link_dependency_bins(
        &self,
        node: &ResolvedNode,
        tree: &ResolvedTree,
        failed: &HashSet<String>,
    ) -> Result<(), PkgError> {
        if node.independent {
            return Ok(());
        }
        let bin_dir = node.hardlinked_location.join("node_modules").join(".bin");
        for (name, child) in self.wanted_children(node, tree, failed) {
            if !child.has_bins {
                continue;
            }
            let _permit = self
                .limit
                .acquire()
                .await
                .map_err(|e| PkgError::link_failed(e.to_string()))?;
            link_pkg_bins(&package_dir_in(&node.modules_dir, name), &bin_dir)?;
        }
        Ok(())
    }

    /// Installable children that made it to disk, optional ones only when
    /// optional packages are wanted.
    fn wanted_children<'t>(
        &self,
        node: &'t ResolvedNode,
        tree: &'t ResolvedTree,
        failed: &'t HashSet<String>,
    ) -> impl Iterator<Item = (&'t String, &'t ResolvedNode)> + 't {
        let optional = self.optional;
        node.children.iter().filter_map(move |(name, abs)| {
            if !optional && node.optional_dependency_names.contains(name) {
                return None;
            }
            tree.nodes
                .get(abs)
                .filter(|child| child.installable && !failed.contains(abs))
                .map(|child| (name, child))
        })
    }
}

/// Hardlink (or copy) a package from the store into `dest`.
///
/// Skipped when the content is not new and `dest/package.json` is already
/// the store's file.
fn import_package(
    src: &Path,
    dest: &Path,
    content: &PackageContentInfo,
    force: bool,
    copy: &AtomicBool,
) -> Result<(), PkgError> {
    let pkg_json = dest.join("package.json");
    let copying = copy.load(Ordering::Relaxed);
    let needed = content.is_new
        || force
        || !pkg_json.exists()
        || (!copying && !linked_to_store(&pkg_json, &src.join("package.json"), dest));
    if !needed {
        return Ok(());
    }

    knit_util::fs::remove_any(dest).map_err(|e| {
        PkgError::node_modules_write_failed(format!("Failed to clear {}: {e}", dest.display()))
    })?;
    fs::create_dir_all(dest).map_err(|e| {
        PkgError::node_modules_write_failed(format!("Failed to create {}: {e}", dest.display()))
    })?;

    for rel in content.index.keys() {
        let from = src.join(rel);
        let to = dest.join(rel);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        if copy.load(Ordering::Relaxed) {
            copy_file(&from, &to)?;
            continue;
        }
        match fs::hard_link(&from, &to) {
            Ok(()) => {}
            Err(e) if is_cross_device(&e) => {
                if !copy.swap(true, Ordering::Relaxed) {
                    tracing::warn!(error = %e, "hardlinking across devices failed");
                    tracing::info!("falling back to copying packages from the store");
                }
                copy_file(&from, &to)?;
            }
            Err(e) => {
                return Err(PkgError::link_failed(format!(
                    "Failed to link {} to {}: {e}",
                    from.display(),
                    to.display()
                )))
            }
        }
    }
    Ok(())
}

fn copy_file(from: &Path, to: &Path) -> Result<(), PkgError> {
    fs::copy(from, to).map(|_| ()).map_err(|e| {
        PkgError::link_failed(format!(
            "Failed to copy {} to {}: {e}",
            from.display(),
            to.display()
        ))
    })
}

fn linked_to_store(pkg_json: &Path, store_pkg_json: &Path, dest: &Path) -> bool {
    if knit_util::fs::is_same_file(pkg_json, store_pkg_json).unwrap_or(false) {
        return true;
    }
    tracing::info!(path = %dest.display(), "relinking from the store");
    false
}

#[cfg(unix)]
fn is_cross_device(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(windows)]
fn is_cross_device(e: &io::Error) -> bool {
    // ERROR_NOT_SAME_DEVICE
    e.raw_os_error() == Some(17)
}

#[cfg(not(any(unix, windows)))]
fn is_cross_device(_e: &io::Error) -> bool {
    false
}

/// Point `path` at the directory `target`.
///
/// Returns `false` when `path` already was a link to `target`. Anything else
/// at `path` is replaced.
///
/// # Errors
/// Returns `PKG_LINK_FAILED` if the link cannot be created.
pub fn symlink_dir(target: &Path, path: &Path) -> Result<bool, PkgError> {
    if fs::read_link(path).is_ok_and(|existing| existing == target) {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            PkgError::node_modules_write_failed(format!(
                "Failed to create directory {}: {e}",
                parent.display()
            ))
        })?;
    }
    if path.symlink_metadata().is_ok() {
        remove_link_or_dir(path)?;
    }
    create_dir_link(target, path)?;
    Ok(true)
}

/// Remove a symlink, junction, or directory.
fn remove_link_or_dir(path: &Path) -> Result<(), PkgError> {
    #[cfg(windows)]
    {
        use std::os::windows::fs::MetadataExt;

        if let Ok(metadata) = fs::symlink_metadata(path) {
            // FILE_ATTRIBUTE_REPARSE_POINT
            if metadata.file_attributes() & 0x400 != 0 {
                fs::remove_dir(path).map_err(|e| {
                    PkgError::link_failed(format!("Failed to remove existing junction: {e}"))
                })?;
                return Ok(());
            }
        }
    }

    knit_util::fs::remove_any(path)
        .map_err(|e| PkgError::link_failed(format!("Failed to remove {}: {e}", path.display())))
}

/// Create a directory link (symlink on Unix, junction on Windows).
fn create_dir_link(src: &Path, dst: &Path) -> Result<(), PkgError> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(src, dst).map_err(|e| {
            PkgError::link_failed(format!(
                "Failed to create symlink from {} to {}: {e}",
                dst.display(),
                src.display()
            ))
        })?;
    }

    #[cfg(windows)]
    {
        junction::create(src, dst).map_err(|e| {
            PkgError::link_failed(format!(
                "Failed to create junction from {} to {}: {e}",
                dst.display(),
                src.display()
            ))
        })?;
    }

    #[cfg(not(any(unix, windows)))]
    {
        return Err(PkgError::link_failed(format!(
            "Directory links are not supported here: {}",
            dst.display()
        )));
    }

    Ok(())
}
