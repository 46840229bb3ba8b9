use crate::config::Channel;
use crate::version::SCHEMA_VERSION;
use std::path::{Path, PathBuf};

/// Name of the per-project module directory.
pub const NODE_MODULES: &str = "node_modules";

/// Find the project root by walking up from `cwd` looking for `package.json`.
///
/// Returns the first directory containing one, or `None` if none is found.
#[must_use]
pub fn project_root(cwd: &Path) -> Option<PathBuf> {
    let mut current = cwd.to_path_buf();

    loop {
        if current.join("package.json").is_file() {
            return Some(current);
        }

        if !current.pop() {
            return None;
        }
    }
}

/// Get the default content store directory.
///
/// Uses platform-appropriate locations with versioning:
/// - Linux: `$XDG_DATA_HOME/knit/store/v{N}/{channel}` or `~/.local/share/knit/store/v{N}/{channel}`
/// - macOS: `~/Library/Application Support/knit/store/v{N}/{channel}`
/// - Windows: `%LOCALAPPDATA%\knit\store\v{N}\{channel}`
///
/// The store must live on the same filesystem as projects for hardlinks to
/// work; when it does not, the linker falls back to copying.
#[must_use]
pub fn store_dir(channel: Channel) -> PathBuf {
    let base = dirs_next::data_dir().map_or_else(
        || {
            dirs_next::home_dir().map_or_else(
                || PathBuf::from(".knit-store"),
                |p| p.join(".local").join("share").join("knit"),
            )
        },
        |p| p.join("knit"),
    );

    base.join("store")
        .join(format!("v{SCHEMA_VERSION}"))
        .join(channel.as_str())
}

/// `<root>/node_modules`.
#[must_use]
pub fn node_modules(root: &Path) -> PathBuf {
    root.join(NODE_MODULES)
}

/// Path of a package directly under a `node_modules` directory.
///
/// Scoped names map to nested directories (`@scope/name`).
#[must_use]
pub fn package_dir_in(modules: &Path, name: &str) -> PathBuf {
    name.split('/').fold(modules.to_path_buf(), |p, part| p.join(part))
}
