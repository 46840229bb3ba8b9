//! Expansion of the identity DAG into a tree of paths.
//!
//! A tree node is one route from a root dependency to a package. The same
//! package reached through two parents yields two nodes sharing one
//! [`InstalledPackage`].

use super::context::{InstallContext, InstalledPackage};
use super::error::PkgError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Identities from the root down to the node, inclusive.
pub type TreeNodeId = Vec<String>;

/// `>a>b>c`, the display form of a node id.
#[must_use]
pub fn render_node_id(id: &[String]) -> String {
    id.iter().fold(String::new(), |mut out, part| {
        out.push('>');
        out.push_str(part);
        out
    })
}

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub node_id: TreeNodeId,
    pub pkg: Arc<InstalledPackage>,
    pub depth: i64,
    /// This path can be installed: every package on it passes the checks.
    pub installable: bool,
    /// The package already appears higher on the path; not expanded.
    pub is_circular: bool,
    /// Reached from a root listed only in `devDependencies`.
    pub dev: bool,
    /// Only reached through optional edges.
    pub optional: bool,
    pub children: Vec<TreeNodeId>,
}

/// A root request with how the project declares it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootRequest {
    pub pkg_id: String,
    pub dev: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyTree {
    pub nodes: HashMap<TreeNodeId, TreeNode>,
    pub roots: Vec<TreeNodeId>,
}

impl DependencyTree {
    #[must_use]
    pub fn get(&self, id: &[String]) -> Option<&TreeNode> {
        self.nodes.get(id)
    }
}

/// Build the tree for the given roots from the context's arena.
///
/// # Errors
/// Returns the recorded failure of a required child that never reached the
/// arena.
pub fn build_tree(ctx: &InstallContext, roots: &[RootRequest]) -> Result<DependencyTree, PkgError> {
    let installs = ctx.installs();
    let skipped = ctx.skipped();
    let mut tree = DependencyTree::default();

    for root in roots {
        let Some(pkg) = installs.get(&root.pkg_id) else {
            tracing::debug!(id = %root.pkg_id, "root not resolved in this run");
            continue;
        };
        let node_id = vec![root.pkg_id.clone()];
        if tree.nodes.contains_key(&node_id) {
            continue;
        }
        let walk = Walk {
            installs: &installs,
            skipped: &skipped,
            ctx,
            dev: root.dev,
        };
        let node = walk.node(node_id.clone(), Arc::clone(pkg), pkg.installable, false, &mut tree)?;
        tree.nodes.insert(node_id.clone(), node);
        tree.roots.push(node_id);
    }

    Ok(tree)
}

struct Walk<'a> {
    installs: &'a HashMap<String, Arc<InstalledPackage>>,
    skipped: &'a HashSet<String>,
    ctx: &'a InstallContext,
    dev: bool,
}

impl Walk<'_> {
    fn node(
        &self,
        node_id: TreeNodeId,
        pkg: Arc<InstalledPackage>,
        installable: bool,
        is_circular: bool,
        tree: &mut DependencyTree,
    ) -> Result<TreeNode, PkgError> {
        let depth = i64::try_from(node_id.len()).unwrap_or(i64::MAX) - 1;
        let children = if is_circular {
            Vec::new()
        } else {
            self.children(&node_id, &pkg, installable, tree)?
        };
        Ok(TreeNode {
            optional: !self.ctx.is_non_optional(&pkg.id),
            node_id,
            pkg,
            depth,
            installable,
            is_circular,
            dev: self.dev,
            children,
        })
    }

    fn children(
        &self,
        parent_id: &TreeNodeId,
        parent: &InstalledPackage,
        installable: bool,
        tree: &mut DependencyTree,
    ) -> Result<Vec<TreeNodeId>, PkgError> {
        let mut out = Vec::new();
        for child_id in &parent.children {
            if contains_edge(parent_id, &parent.id, child_id) {
                continue;
            }
            let Some(child) = self.installs.get(child_id) else {
                match self.ctx.failure(child_id) {
                    Some(err) if self.ctx.is_non_optional(child_id) => return Err(err),
                    Some(_) => {}
                    None => tracing::debug!(id = %child_id, "child missing from arena"),
                }
                continue;
            };
            let mut node_id = parent_id.clone();
            node_id.push(child_id.clone());
            if !tree.nodes.contains_key(&node_id) {
                let is_circular = parent_id.contains(child_id);
                let child_installable = installable && !self.skipped.contains(child_id);
                let node = self.node(
                    node_id.clone(),
                    Arc::clone(child),
                    child_installable,
                    is_circular,
                    tree,
                )?;
                tree.nodes.insert(node_id.clone(), node);
            }
            out.push(node_id);
        }
        Ok(out)
    }
}

/// Whether `parent → child` already occurs as consecutive ids in the path.
fn contains_edge(path: &[String], parent: &str, child: &str) -> bool {
    path.windows(2).any(|w| w[0] == parent && w[1] == child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::context::ContextSettings;
    use crate::pkg::fetch::FetchGate;
    use crate::pkg::lockfile::Lockfile;
    use crate::pkg::testing::{MockGate, NPM};

    fn installed(gate: &MockGate, name: &str, children: &[&str]) -> InstalledPackage {
        gate.publish(name, "1.0.0", serde_json::json!({}));
        let resolved = gate.resolved(name, "1.0.0");
        InstalledPackage {
            id: resolved.id.clone(),
            name: name.to_string(),
            version: "1.0.0".to_string(),
            resolution: resolved.resolution.clone(),
            manifest: Arc::new(resolved.manifest.clone().unwrap_or_default()),
            path: gate.package_path(&resolved.id),
            handles: gate.fetch(&resolved),
            installable: true,
            has_bins: false,
            children: children.iter().map(|c| MockGate::id(c, "1.0.0")).collect(),
            dev: false,
            prod: true,
            depth: 0,
        }
    }

    #[tokio::test]
    async fn test_cycle_is_marked_and_not_expanded() {
        let gate = Arc::new(MockGate::new());
        let ctx = InstallContext::new(
            Arc::clone(&gate) as Arc<dyn FetchGate>,
            Lockfile::new(NPM),
            Lockfile::new(NPM),
            ContextSettings::default(),
            HashSet::new(),
        );
        ctx.insert_installed(installed(&gate, "a", &["b"]));
        ctx.insert_installed(installed(&gate, "b", &["a"]));
        for name in ["a", "b"] {
            ctx.add_non_optional(&MockGate::id(name, "1.0.0"));
        }

        let a = MockGate::id("a", "1.0.0");
        let b = MockGate::id("b", "1.0.0");
        let tree = build_tree(
            &ctx,
            &[RootRequest {
                pkg_id: a.clone(),
                dev: false,
            }],
        )
        .unwrap();

        assert_eq!(tree.roots, vec![vec![a.clone()]]);
        let back = tree.get(&[a.clone(), b.clone(), a.clone()]).unwrap();
        assert!(back.is_circular);
        assert!(back.children.is_empty());
        assert_eq!(back.depth, 2);
        assert!(!back.optional);
        assert_eq!(tree.nodes.len(), 3);
    }

    #[tokio::test]
    async fn test_skipped_child_is_not_installable() {
        let gate = Arc::new(MockGate::new());
        let ctx = InstallContext::new(
            Arc::clone(&gate) as Arc<dyn FetchGate>,
            Lockfile::new(NPM),
            Lockfile::new(NPM),
            ContextSettings::default(),
            HashSet::new(),
        );
        ctx.insert_installed(installed(&gate, "app", &["native"]));
        ctx.insert_installed(installed(&gate, "native", &[]));
        let native = MockGate::id("native", "1.0.0");
        ctx.skip(&native);

        let app = MockGate::id("app", "1.0.0");
        let tree = build_tree(
            &ctx,
            &[RootRequest {
                pkg_id: app.clone(),
                dev: true,
            }],
        )
        .unwrap();
        let child = tree.get(&[app, native]).unwrap();
        assert!(!child.installable);
        assert!(child.optional);
        assert!(child.dev);
    }

    #[tokio::test]
    async fn test_failed_required_child_is_an_error() {
        let gate = Arc::new(MockGate::new());
        let ctx = InstallContext::new(
            Arc::clone(&gate) as Arc<dyn FetchGate>,
            Lockfile::new(NPM),
            Lockfile::new(NPM),
            ContextSettings::default(),
            HashSet::new(),
        );
        ctx.insert_installed(installed(&gate, "app", &["opt"]));
        let opt = MockGate::id("opt", "1.0.0");
        let app = MockGate::id("app", "1.0.0");
        let roots = [RootRequest {
            pkg_id: app.clone(),
            dev: false,
        }];
        ctx.record_failure(&opt, PkgError::not_found("missing"));

        // only optional referrers: the child is dropped
        let tree = build_tree(&ctx, &roots).unwrap();
        assert_eq!(tree.get(&[app.clone()]).unwrap().children, Vec::<TreeNodeId>::new());

        ctx.add_non_optional(&opt);
        let err = build_tree(&ctx, &roots).unwrap_err();
        assert_eq!(err.code(), super::super::error::codes::PKG_NOT_FOUND);
    }

    #[test]
    fn test_render_node_id() {
        assert_eq!(render_node_id(&["a".to_string(), "b".to_string()]), ">a>b");
    }
}
