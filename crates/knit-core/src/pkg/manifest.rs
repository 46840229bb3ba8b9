//! `package.json` reading and saving.
//!
//! [`Manifest`] holds the subset of fields the installer consumes. Saving goes
//! through `serde_json::Value` so unknown fields and key order survive.

use super::error::PkgError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Name → range map as found in `dependencies` and friends.
pub type Dependencies = BTreeMap<String, String>;

/// A package manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: Dependencies,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dev_dependencies: Dependencies,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional_dependencies: Dependencies,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_dependencies: Dependencies,
    #[serde(
        default,
        alias = "bundleDependencies",
        skip_serializing_if = "Option::is_none"
    )]
    pub bundled_dependencies: Option<BundledDependencies>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub engines: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cpu: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<Bin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directories: Option<Directories>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scripts: BTreeMap<String, String>,
}

/// `bin` field: a single path (named after the package) or a name → path map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Bin {
    Single(String),
    Map(BTreeMap<String, String>),
}

/// `bundledDependencies`: explicit names, or `true` for every dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BundledDependencies {
    Names(Vec<String>),
    All(bool),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directories {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<String>,
}

/// Which dependency section `knit add` writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveType {
    #[default]
    Prod,
    Dev,
    Optional,
}

impl SaveType {
    #[must_use]
    pub fn field(self) -> &'static str {
        match self {
            Self::Prod => "dependencies",
            Self::Dev => "devDependencies",
            Self::Optional => "optionalDependencies",
        }
    }
}

impl Manifest {
    /// Read `package.json` from a directory.
    ///
    /// Returns `Ok(None)` when the file does not exist.
    ///
    /// # Errors
    /// Returns `PKG_PACKAGE_JSON_INVALID` if the file cannot be read or parsed.
    pub fn read_from_dir(dir: &Path) -> Result<Option<Self>, PkgError> {
        let path = dir.join("package.json");
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PkgError::package_json_invalid(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        Self::parse(&content)
            .map(Some)
            .map_err(|e| PkgError::package_json_invalid(format!("{}: {}", path.display(), e.message())))
    }

    /// Parse manifest JSON text.
    ///
    /// # Errors
    /// Returns `PKG_PACKAGE_JSON_INVALID` on malformed JSON.
    pub fn parse(content: &str) -> Result<Self, PkgError> {
        serde_json::from_str(content)
            .map_err(|e| PkgError::package_json_invalid(format!("Invalid JSON: {e}")))
    }

    /// Names listed in `bundledDependencies`.
    #[must_use]
    pub fn bundled_names(&self) -> Vec<String> {
        match &self.bundled_dependencies {
            Some(BundledDependencies::Names(names)) => names.clone(),
            Some(BundledDependencies::All(true)) => self.dependencies.keys().cloned().collect(),
            Some(BundledDependencies::All(false)) | None => Vec::new(),
        }
    }

    #[must_use]
    pub fn has_bundled_dependencies(&self) -> bool {
        !self.bundled_names().is_empty()
    }

    /// Whether the package exposes executables.
    #[must_use]
    pub fn has_bins(&self) -> bool {
        self.bin.is_some() || self.directories.as_ref().is_some_and(|d| d.bin.is_some())
    }

    /// Every root-level declared dependency name.
    pub fn all_dependency_names(&self) -> impl Iterator<Item = &String> {
        self.dependencies
            .keys()
            .chain(self.dev_dependencies.keys())
            .chain(self.optional_dependencies.keys())
    }

    /// Declared range for `name` in any section, optional winning over prod over dev.
    #[must_use]
    pub fn declared_range(&self, name: &str) -> Option<&str> {
        self.optional_dependencies
            .get(name)
            .or_else(|| self.dependencies.get(name))
            .or_else(|| self.dev_dependencies.get(name))
            .map(String::as_str)
    }
}

/// Write `name: range` entries into a section of `package.json`.
///
/// The entries are removed from the other dependency sections so a package is
/// declared once. Existing key order and unknown fields are preserved.
///
/// # Errors
/// Returns an error if the file is missing, not an object, or cannot be written.
pub fn save_dependencies(
    package_json_path: &Path,
    entries: &[(String, String)],
    save_type: SaveType,
) -> Result<Manifest, PkgError> {
    if !package_json_path.exists() {
        return Err(PkgError::package_json_not_found(package_json_path));
    }

    let content = fs::read_to_string(package_json_path)
        .map_err(|e| PkgError::package_json_invalid(format!("Failed to read: {e}")))?;
    let mut json: Value = serde_json::from_str(&content)
        .map_err(|e| PkgError::package_json_invalid(format!("Invalid JSON: {e}")))?;
    let root = json
        .as_object_mut()
        .ok_or_else(|| PkgError::package_json_invalid("package.json must be a JSON object"))?;

    let target = save_type.field();
    for other in ["dependencies", "devDependencies", "optionalDependencies"] {
        if other == target {
            continue;
        }
        if let Some(section) = root.get_mut(other).and_then(Value::as_object_mut) {
            for (name, _) in entries {
                section.remove(name);
            }
        }
    }

    let section = root
        .entry(target)
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    let section = section.as_object_mut().ok_or_else(|| {
        PkgError::package_json_invalid(format!("'{target}' must be an object"))
    })?;
    for (name, range) in entries {
        section.insert(name.clone(), Value::String(range.clone()));
    }
    let mut sorted: Vec<(String, Value)> = std::mem::take(section).into_iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    section.extend(sorted);

    let mut out = serde_json::to_string_pretty(&json)
        .map_err(|e| PkgError::package_json_invalid(format!("Failed to serialize: {e}")))?;
    out.push('\n');
    knit_util::fs::atomic_write(package_json_path, out.as_bytes())
        .map_err(|e| PkgError::package_json_invalid(format!("Failed to write: {e}")))?;

    serde_json::from_value(json)
        .map_err(|e| PkgError::package_json_invalid(format!("Invalid JSON: {e}")))
}
