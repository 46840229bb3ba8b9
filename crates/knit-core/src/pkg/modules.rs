//! `node_modules/.modules.json`: how the directory was laid out.

use super::error::PkgError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// File name inside `node_modules`.
pub const MODULES_FILE: &str = ".modules.json";

/// Bumped when the `node_modules` structure changes incompatibly.
pub const LAYOUT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModulesState {
    pub layout_version: u32,
    /// `<name>@<version>` of the package manager that wrote the layout.
    pub package_manager: String,
    pub store: PathBuf,
    /// Identities that were not installable on this platform.
    #[serde(default)]
    pub skipped: BTreeSet<String>,
    #[serde(default)]
    pub independent_leaves: bool,
}

impl ModulesState {
    #[must_use]
    pub fn new(store: PathBuf, skipped: BTreeSet<String>, independent_leaves: bool) -> Self {
        Self {
            layout_version: LAYOUT_VERSION,
            package_manager: format!(
                "{}@{}",
                crate::version::PACKAGE_MANAGER,
                crate::version::VERSION
            ),
            store,
            skipped,
            independent_leaves,
        }
    }

    /// Read the state of `node_modules`, if any.
    ///
    /// An unreadable or incompatible file is treated as absent.
    #[must_use]
    pub fn read(node_modules: &Path) -> Option<Self> {
        let path = node_modules.join(MODULES_FILE);
        let content = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<Self>(&content) {
            Ok(state) if state.layout_version == LAYOUT_VERSION => Some(state),
            Ok(state) => {
                tracing::warn!(
                    found = state.layout_version,
                    expected = LAYOUT_VERSION,
                    "node_modules layout version changed; ignoring previous state"
                );
                None
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "invalid modules state");
                None
            }
        }
    }

    /// # Errors
    /// Returns `NODE_MODULES_WRITE_FAILED` if the file cannot be written.
    pub fn write(&self, node_modules: &Path) -> Result<(), PkgError> {
        let mut content = serde_json::to_string_pretty(self)
            .map_err(|e| PkgError::node_modules_write_failed(e.to_string()))?;
        content.push('\n');
        knit_util::fs::atomic_write(&node_modules.join(MODULES_FILE), content.as_bytes())
            .map_err(|e| {
                PkgError::node_modules_write_failed(format!("Failed to write {MODULES_FILE}: {e}"))
            })
    }
}
