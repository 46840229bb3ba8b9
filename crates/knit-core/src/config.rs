use crate::error::{Error, Result};
use crate::pkg::npmrc::load_npmrc_files;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default npm registry URL.
pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org/";

/// Environment variable overriding the default registry.
pub const REGISTRY_ENV: &str = "KNIT_NPM_REGISTRY";

/// Runtime configuration for the knit CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Current working directory.
    pub cwd: PathBuf,

    /// Whether to emit JSON logs.
    pub json_logs: bool,

    /// Verbosity level (0 = INFO, 1 = DEBUG, 2+ = TRACE).
    pub verbosity: u8,

    /// Channel (dev, nightly, stable) - affects the store path.
    pub channel: Channel,
}

/// Release channel for store directory namespacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Stable,
    Nightly,
    Dev,
}

impl Channel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Nightly => "nightly",
            Self::Dev => "dev",
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            json_logs: false,
            verbosity: 0,
            channel: Channel::default(),
        }
    }
}

impl Config {
    /// Create a new config with the given working directory.
    #[must_use]
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            ..Default::default()
        }
    }

    /// Set verbosity level.
    #[must_use]
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Set JSON log output.
    #[must_use]
    pub fn with_json_logs(mut self, json: bool) -> Self {
        self.json_logs = json;
        self
    }
}

/// Options driving a single install run.
///
/// Built from defaults, then `.npmrc`, then [`REGISTRY_ENV`]; the CLI applies
/// its flags last.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstallOptions {
    /// Default registry URL, always with a trailing slash.
    pub registry: String,
    /// `@scope` → registry URL.
    pub scoped_registries: BTreeMap<String, String>,
    /// Content store root.
    pub store_dir: PathBuf,
    /// How deep already-locked dependencies are re-validated on update.
    pub depth: i64,
    /// Re-validation depth for a repeat install with an unchanged lockfile.
    /// Negative means "trust the lockfile entirely".
    pub repeat_install_depth: i64,
    /// Re-resolve ranges against the registry instead of reusing the lockfile.
    pub update: bool,
    /// Ignore platform checks and relink everything.
    pub force: bool,
    /// Skip devDependencies when linking.
    pub production: bool,
    /// Link optionalDependencies.
    pub optional: bool,
    /// Leave leaf packages in the store instead of hardlinking them.
    pub independent_leaves: bool,
    /// Do not run lifecycle scripts.
    pub ignore_scripts: bool,
    /// Fail on an `engines.node` mismatch of a required package instead of
    /// warning.
    pub engine_strict: bool,
    /// Node version used for `engines.node` checks.
    pub node_version: Option<String>,
    pub network_concurrency: usize,
    pub link_concurrency: usize,
    pub child_concurrency: usize,
    pub save_exact: bool,
    pub save_prefix: String,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            registry: DEFAULT_REGISTRY.to_string(),
            scoped_registries: BTreeMap::new(),
            store_dir: crate::paths::store_dir(Channel::default()),
            depth: 0,
            repeat_install_depth: -1,
            update: false,
            force: false,
            production: false,
            optional: true,
            independent_leaves: false,
            ignore_scripts: false,
            engine_strict: false,
            node_version: None,
            network_concurrency: 16,
            link_concurrency: 16,
            child_concurrency: 5,
            save_exact: false,
            save_prefix: "^".to_string(),
        }
    }
}

impl InstallOptions {
    /// Load options for a project: defaults, `.npmrc` files, then environment.
    ///
    /// # Errors
    /// Returns an error if the registry URL from the environment is invalid.
    pub fn load(project_dir: &Path, channel: Channel) -> Result<Self> {
        let mut opts = Self {
            store_dir: crate::paths::store_dir(channel),
            ..Self::default()
        };

        let npmrc = load_npmrc_files(project_dir);
        if let Some(registry) = npmrc.registry {
            opts.registry = registry.to_string();
        }
        for (scope, url) in npmrc.scoped_registries {
            opts.scoped_registries.insert(scope, url.to_string());
        }

        if let Ok(value) = std::env::var(REGISTRY_ENV) {
            if !value.trim().is_empty() {
                opts.registry = normalize_registry(&value)?;
            }
        }

        Ok(opts)
    }

    /// Registry serving `name`, honoring scoped registries.
    #[must_use]
    pub fn registry_for(&self, name: &str) -> &str {
        if name.starts_with('@') {
            if let Some((scope, _)) = name.split_once('/') {
                if let Some(url) = self.scoped_registries.get(scope) {
                    return url;
                }
            }
        }
        &self.registry
    }
}

/// Validate a registry URL and ensure it ends with `/`.
///
/// # Errors
/// Returns [`Error::ConfigValue`] if the URL cannot be parsed.
pub fn normalize_registry(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    url::Url::parse(&with_slash).map_err(|_| Error::ConfigValue {
        key: REGISTRY_ENV.to_string(),
        value: raw.to_string(),
    })?;
    Ok(with_slash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn test_install_options_defaults() {
        let opts = InstallOptions::default();
        assert_eq!(opts.registry, DEFAULT_REGISTRY);
        assert_eq!(opts.depth, 0);
        assert_eq!(opts.repeat_install_depth, -1);
        assert!(opts.optional);
        assert_eq!(opts.link_concurrency, 16);
        assert_eq!(opts.network_concurrency, 16);
        assert_eq!(opts.child_concurrency, 5);
        assert_eq!(opts.save_prefix, "^");
    }

    #[test]
    #[serial]
    fn test_load_reads_npmrc() {
        std::env::remove_var(REGISTRY_ENV);
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(".npmrc"),
            "registry=https://npm.example.com\n@acme:registry=https://acme.example.com/\n",
        )
        .unwrap();

        let opts = InstallOptions::load(dir.path(), Channel::Dev).unwrap();
        assert_eq!(opts.registry, "https://npm.example.com/");
        assert_eq!(opts.registry_for("@acme/widget"), "https://acme.example.com/");
        assert_eq!(opts.registry_for("left-pad"), "https://npm.example.com/");
    }

    #[test]
    #[serial]
    fn test_env_overrides_npmrc() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".npmrc"), "registry=https://a.example.com/\n").unwrap();
        std::env::set_var(REGISTRY_ENV, "http://localhost:4873");

        let opts = InstallOptions::load(dir.path(), Channel::Dev).unwrap();
        std::env::remove_var(REGISTRY_ENV);
        assert_eq!(opts.registry, "http://localhost:4873/");
    }

    #[test]
    fn test_normalize_registry_rejects_garbage() {
        let err = normalize_registry("not a url").unwrap_err();
        assert_eq!(err.code(), "CONFIG_INVALID");
    }

    #[test]
    fn test_channel_as_str() {
        assert_eq!(Channel::Stable.as_str(), "stable");
        assert_eq!(Channel::Dev.as_str(), "dev");
    }
}
