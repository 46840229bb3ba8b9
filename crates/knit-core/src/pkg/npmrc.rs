//! `.npmrc` file parser for registry configuration.
//!
//! Parses `.npmrc` files to extract:
//! - `registry=URL` for the default registry
//! - `@scope:registry=URL` directives for routing scoped packages
//! - `${ENV_VAR}` expansion in values
//!
//! Authentication directives are ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use url::Url;

/// Parsed `.npmrc` configuration.
#[derive(Debug, Clone, Default)]
pub struct NpmrcConfig {
    /// Default registry, when set.
    pub registry: Option<Url>,
    /// Scope → registry URL mapping (e.g., `@acme` → `https://npm.acme.dev/`).
    pub scoped_registries: HashMap<String, Url>,
}

/// Parse a single `.npmrc` file's content.
///
/// Ignores comments (`#`, `;`), blank lines and unknown keys.
#[must_use]
pub fn parse_npmrc(content: &str) -> NpmrcConfig {
    let mut config = NpmrcConfig::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let Some(url) = registry_url(&expand_env_vars(value.trim())) else {
            continue;
        };

        if key == "registry" {
            config.registry = Some(url);
        } else if let Some(scope) = key.strip_suffix(":registry") {
            if scope.starts_with('@') && scope.len() > 1 {
                config.scoped_registries.insert(scope.to_string(), url);
            }
        }
    }

    config
}

/// Registry URLs always end with `/` so joining package names works.
fn registry_url(value: &str) -> Option<Url> {
    if value.is_empty() {
        return None;
    }
    let with_slash = if value.ends_with('/') {
        value.to_string()
    } else {
        format!("{value}/")
    };
    Url::parse(&with_slash).ok()
}

/// Load and merge `.npmrc` files from project directory up to home.
///
/// Priority order (first wins, no overwrite):
/// 1. `project_dir/.npmrc`
/// 2. Parent directories up to filesystem root
/// 3. `$HOME/.npmrc`
#[must_use]
pub fn load_npmrc_files(project_dir: &Path) -> NpmrcConfig {
    let mut merged = NpmrcConfig::default();

    let candidates = project_dir
        .ancestors()
        .map(|d| d.join(".npmrc"))
        .chain(home_dir().map(|h| h.join(".npmrc")));

    for path in candidates {
        if !path.is_file() {
            continue;
        }
        match std::fs::read_to_string(&path) {
            Ok(content) => merge_config(&mut merged, parse_npmrc(&content)),
            Err(e) => tracing::debug!(path = %path.display(), error = %e, "skipping unreadable .npmrc"),
        }
    }

    merged
}

/// Merge `source` into `target`, keeping existing entries (first wins).
fn merge_config(target: &mut NpmrcConfig, source: NpmrcConfig) {
    if target.registry.is_none() {
        target.registry = source.registry;
    }
    for (scope, url) in source.scoped_registries {
        target.scoped_registries.entry(scope).or_insert(url);
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
            // Unset variables expand to nothing, as npm does.
            if let Ok(val) = std::env::var(&var_name) {
                result.push_str(&val);
            }
        } else {
            result.push(ch);
        }
    }

    result
}

fn home_dir() -> Option<PathBuf> {
    dirs_next::home_dir()
}
