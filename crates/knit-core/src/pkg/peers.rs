//! Peer dependency resolution and final placement.
//!
//! Walks the dependency tree depth-first. A node's peers are looked up among
//! the packages visible from its position: the project's own top-level
//! packages plus the children of every ancestor level, nearest first. A peer
//! found anywhere but the root level or the node's own children becomes part
//! of the node's absolute path (`_react@16.0.0`), so two parents resolving the
//! same peer differently get two materialized copies.

use super::context::InstalledPackage;
use super::dep_path;
use super::fetch::FetchHandles;
use super::lockfile::LockResolution;
use super::manifest::Manifest;
use super::tree::{render_node_id, DependencyTree, TreeNode, TreeNodeId};
use super::version::version_satisfies;
use crate::paths::package_dir_in;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

/// A package placed at its final location.
#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub pkg_id: String,
    pub absolute_path: String,
    pub name: String,
    pub version: String,
    pub resolution: LockResolution,
    /// Where the package's files are materialized.
    pub hardlinked_location: PathBuf,
    /// `node_modules/.<absolute path>/node_modules`; holds the package and
    /// links to its dependencies.
    pub modules_dir: PathBuf,
    /// Content stays in the store: no children, no peers.
    pub independent: bool,
    pub installable: bool,
    pub dev: bool,
    pub prod: bool,
    pub optional: bool,
    pub has_bins: bool,
    pub has_bundled_dependencies: bool,
    pub peer_dependencies: BTreeMap<String, String>,
    pub optional_dependency_names: BTreeSet<String>,
    /// Name → absolute path, including resolved peers.
    pub children: BTreeMap<String, String>,
    pub depth: i64,
    pub manifest: Arc<Manifest>,
    pub handles: FetchHandles,
    /// Unpacked content in the store.
    pub store_path: PathBuf,
}

/// Result of peer resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolvedTree {
    /// Absolute path → node.
    pub nodes: BTreeMap<String, ResolvedNode>,
    /// Root identity → absolute path of its root node.
    pub roots: BTreeMap<String, String>,
}

/// A package already present in the project's `node_modules`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopParent {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub node_modules: PathBuf,
    pub independent_leaves: bool,
}

#[derive(Debug, Clone)]
struct ParentRef {
    version: String,
    depth: i64,
    installable: bool,
    /// `None` for top parents outside the tree.
    node_id: Option<TreeNodeId>,
}

type ParentPkgs = HashMap<String, ParentRef>;

/// Peers a subtree resolved, by name.
type ResolvedPeers = BTreeMap<String, TreeNodeId>;

/// Flags merged over every placement of one absolute path.
#[derive(Debug, Clone, Copy, Default)]
struct PathFlags {
    dev: bool,
    prod: bool,
    installable: bool,
    /// Only when every occurrence is optional.
    optional: bool,
}

struct Placement {
    absolute_path: String,
    /// Child node ids by name, peers included.
    children: BTreeMap<String, TreeNodeId>,
}

struct Walker<'a> {
    tree: &'a DependencyTree,
    opts: &'a PeerOptions,
    placements: HashMap<TreeNodeId, Placement>,
    /// Absolute path → node id chosen to represent it (installable, then
    /// lowest depth).
    representatives: HashMap<String, TreeNodeId>,
    circular: Vec<TreeNodeId>,
}

/// Resolve peers for every node and compute final placements.
#[must_use]
pub fn resolve_peers(
    tree: &DependencyTree,
    top_parents: &[TopParent],
    opts: &PeerOptions,
) -> ResolvedTree {
    let parents: ParentPkgs = top_parents
        .iter()
        .map(|p| {
            (
                p.name.clone(),
                ParentRef {
                    version: p.version.clone(),
                    depth: 0,
                    installable: true,
                    node_id: None,
                },
            )
        })
        .collect();

    let mut walker = Walker {
        tree,
        opts,
        placements: HashMap::new(),
        representatives: HashMap::new(),
        circular: Vec::new(),
    };
    walker.resolve_children(&tree.roots, &parents);
    walker.place_circular();
    walker.finish()
}

impl Walker<'_> {
    fn node(&self, id: &[String]) -> Option<&TreeNode> {
        self.tree.get(id)
    }

    /// Resolve a level and return the peers its nodes resolved from above it.
    fn resolve_children(&mut self, children: &[TreeNodeId], parents: &ParentPkgs) -> ResolvedPeers {
        let mut level = parents.clone();
        let mut names = BTreeSet::new();
        for id in children {
            if let Some(node) = self.node(id) {
                names.insert(node.pkg.name.clone());
                level.insert(
                    node.pkg.name.clone(),
                    ParentRef {
                        version: node.pkg.version.clone(),
                        depth: node.depth,
                        installable: node.installable,
                        node_id: Some(id.clone()),
                    },
                );
            }
        }

        let mut resolved = ResolvedPeers::new();
        for id in children {
            for (name, peer) in self.resolve_node(id, &level) {
                resolved.entry(name).or_insert(peer);
            }
        }
        resolved.retain(|name, _| !names.contains(name));
        resolved
    }

    fn resolve_node(&mut self, id: &TreeNodeId, parents: &ParentPkgs) -> ResolvedPeers {
        if self.placements.contains_key(id) {
            return ResolvedPeers::new();
        }
        let Some(node) = self.node(id).cloned() else {
            return ResolvedPeers::new();
        };
        if node.is_circular {
            self.circular.push(id.clone());
            return ResolvedPeers::new();
        }

        let from_children = self.resolve_children(&node.children, parents);
        let own = self.resolve_own_peers(&node, parents);

        let mut all = from_children;
        for (name, peer) in &own {
            all.entry(name.clone()).or_insert_with(|| peer.clone());
        }
        all.remove(&node.pkg.name);

        let mut peer_versions: Vec<(String, String)> = all
            .iter()
            .filter_map(|(name, peer_id)| {
                self.node(peer_id)
                    .map(|p| (name.clone(), p.pkg.version.clone()))
            })
            .collect();
        peer_versions.sort();
        let absolute_path = format!(
            "{}{}",
            node.pkg.id,
            dep_path::peers_suffix(&peer_versions)
        );

        let mut children: BTreeMap<String, TreeNodeId> = node
            .children
            .iter()
            .filter_map(|c| self.node(c).map(|n| (n.pkg.name.clone(), c.clone())))
            .collect();
        for (name, peer_id) in own {
            children.entry(name).or_insert(peer_id);
        }

        // an installable occurrence wins over a shallower skipped one
        let keep = self
            .representatives
            .get(&absolute_path)
            .and_then(|rep| self.node(rep))
            .map_or(true, |rep| {
                (node.installable, std::cmp::Reverse(node.depth))
                    > (rep.installable, std::cmp::Reverse(rep.depth))
            });
        if keep {
            self.representatives.insert(absolute_path.clone(), id.clone());
        }
        self.placements.insert(
            id.clone(),
            Placement {
                absolute_path,
                children,
            },
        );
        all
    }

    fn resolve_own_peers(&self, node: &TreeNode, parents: &ParentPkgs) -> ResolvedPeers {
        let mut resolved = ResolvedPeers::new();
        for (peer, range) in node.pkg.peer_dependencies() {
            let Some(found) = parents.get(peer).filter(|p| p.installable) else {
                tracing::warn!(
                    node = %render_node_id(&node.node_id),
                    peer = %peer,
                    range = %range,
                    "missing peer dependency"
                );
                continue;
            };
            if !version_satisfies(&found.version, range) {
                tracing::warn!(
                    node = %render_node_id(&node.node_id),
                    peer = %peer,
                    range = %range,
                    found = %found.version,
                    "unmet peer dependency"
                );
            }
            // Visible through normal module lookup; no suffix needed.
            if found.depth == 0 || found.depth == node.depth + 1 {
                continue;
            }
            if let Some(peer_id) = &found.node_id {
                resolved.insert(peer.clone(), peer_id.clone());
            }
        }
        resolved
    }

    /// Circular nodes take the placement of the occurrence higher up.
    fn place_circular(&mut self) {
        for id in std::mem::take(&mut self.circular) {
            let Some(last) = id.last() else { continue };
            let Some(first) = id.iter().position(|p| p == last) else {
                continue;
            };
            let ancestor: TreeNodeId = id[..=first].to_vec();
            if let Some(placement) = self.placements.get(&ancestor) {
                let absolute_path = placement.absolute_path.clone();
                self.placements.insert(
                    id,
                    Placement {
                        absolute_path,
                        children: BTreeMap::new(),
                    },
                );
            }
        }
    }

    fn absolute_of(&self, id: &TreeNodeId) -> Option<&str> {
        self.placements.get(id).map(|p| p.absolute_path.as_str())
    }

    fn finish(self) -> ResolvedTree {
        let mut flags: HashMap<&str, PathFlags> = HashMap::new();
        for (id, placement) in &self.placements {
            if let Some(node) = self.node(id) {
                let entry = flags
                    .entry(placement.absolute_path.as_str())
                    .or_insert(PathFlags {
                        optional: true,
                        ..PathFlags::default()
                    });
                entry.dev |= node.dev;
                entry.prod |= !node.dev;
                entry.installable |= node.installable;
                entry.optional &= node.optional;
            }
        }

        let mut out = ResolvedTree::default();
        for (absolute_path, rep_id) in &self.representatives {
            let (Some(node), Some(placement)) = (self.node(rep_id), self.placements.get(rep_id))
            else {
                continue;
            };
            let pkg: &InstalledPackage = &node.pkg;
            let children: BTreeMap<String, String> = placement
                .children
                .iter()
                .filter_map(|(name, child)| {
                    self.absolute_of(child).map(|abs| (name.clone(), abs.to_string()))
                })
                .collect();

            let independent = self.opts.independent_leaves
                && children.is_empty()
                && pkg.peer_dependencies().is_empty();
            let modules_dir = dep_path::modules_dir(&self.opts.node_modules, absolute_path);
            let hardlinked_location = if independent {
                pkg.path.clone()
            } else {
                package_dir_in(&modules_dir, &pkg.name)
            };
            let PathFlags {
                dev,
                prod,
                installable,
                optional,
            } = flags
                .get(absolute_path.as_str())
                .copied()
                .unwrap_or(PathFlags {
                    dev: false,
                    prod: true,
                    installable: node.installable,
                    optional: node.optional,
                });

            out.nodes.insert(
                absolute_path.clone(),
                ResolvedNode {
                    pkg_id: pkg.id.clone(),
                    absolute_path: absolute_path.clone(),
                    name: pkg.name.clone(),
                    version: pkg.version.clone(),
                    resolution: pkg.resolution.clone(),
                    hardlinked_location,
                    modules_dir,
                    independent,
                    installable,
                    dev,
                    prod,
                    optional,
                    has_bins: pkg.has_bins,
                    has_bundled_dependencies: pkg.has_bundled_dependencies(),
                    peer_dependencies: pkg.peer_dependencies().clone(),
                    optional_dependency_names: pkg.optional_dependency_names(),
                    children,
                    depth: node.depth,
                    manifest: Arc::clone(&pkg.manifest),
                    handles: pkg.handles.clone(),
                    store_path: pkg.path.clone(),
                },
            );
        }

        for root in &self.tree.roots {
            if let (Some(node), Some(abs)) = (self.node(root), self.absolute_of(root)) {
                out.roots.insert(node.pkg.id.clone(), abs.to_string());
            }
        }
        out
    }
}
