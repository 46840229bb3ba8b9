//! Package spec parsing and normalization.
//!
//! Parses CLI arguments like:
//! - `react`
//! - `react@18.2.0`
//! - `react@^18.0.0`
//! - `@types/node@^20`
//! - `my-lodash@npm:lodash@^4`
//!
//! and turns manifest dependency maps into [`PackageSpec`]s.

use super::error::PkgError;
use super::manifest::{Dependencies, Manifest};
use super::version::{parse_loose_version, NpmRange};
use std::collections::{BTreeMap, BTreeSet};

/// How the range part of a spec is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecKind {
    /// Exact version, `1.2.3`.
    Version,
    /// Semver range, including `*` and the empty range.
    Range,
    /// Dist-tag, `latest`, `next`.
    Tag,
    /// Git URL or `user/repo` shorthand.
    Git,
    /// Local directory or tarball: `file:`, `link:`, relative or absolute path.
    File,
    /// Remote tarball URL.
    Remote,
    /// `npm:<name>@<range>`: install `name` under another name.
    Alias { target: String, range: String },
}

/// A normalized package specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    /// Full package name (e.g., "@scope/name" or "name").
    pub name: String,
    /// Scope with the `@` prefix, if scoped.
    pub scope: Option<String>,
    pub kind: SpecKind,
    /// The range exactly as declared.
    pub raw_range: String,
    /// `name@raw_range`, the key used to report what a spec resolved to.
    pub raw: String,
    pub dev: bool,
    pub optional: bool,
}

impl PackageSpec {
    /// Parse a `name@range` argument. A missing range resolves to the `latest`
    /// tag and keeps `raw` as the bare name.
    ///
    /// # Errors
    /// Returns `PKG_SPEC_INVALID` if the spec is malformed.
    pub fn parse(input: &str) -> Result<Self, PkgError> {
        let input = input.trim();

        if input.is_empty() {
            return Err(PkgError::spec_invalid("Empty package spec"));
        }

        let (name, range) = if input.starts_with('@') {
            split_scoped(input)?
        } else {
            split_unscoped(input)?
        };

        let mut spec = Self::from_dependency(name, range.unwrap_or(""), false, false);
        if range.is_none() {
            spec.raw = name.to_string();
        }
        Ok(spec)
    }

    /// Build a spec from a manifest entry.
    #[must_use]
    pub fn from_dependency(name: &str, raw_range: &str, dev: bool, optional: bool) -> Self {
        let scope = name
            .starts_with('@')
            .then(|| name.split('/').next().unwrap_or(name).to_string());
        Self {
            name: name.to_string(),
            scope,
            kind: classify(raw_range),
            raw_range: raw_range.to_string(),
            raw: format!("{name}@{raw_range}"),
            dev,
            optional,
        }
    }

    /// A spec that only carries a name; used for lockfile-driven children
    /// whose reference is already known.
    #[must_use]
    pub fn locked(name: &str, reference: &str, optional: bool) -> Self {
        Self::from_dependency(name, reference, false, optional)
    }

    /// Check if this is a scoped package.
    #[must_use]
    pub fn is_scoped(&self) -> bool {
        self.scope.is_some()
    }

    /// Whether the range was given by the user (false for a bare `name`).
    #[must_use]
    pub fn has_explicit_range(&self) -> bool {
        !self.raw_range.is_empty()
    }

    /// Name to look up in the registry: the alias target for aliases.
    #[must_use]
    pub fn registry_name(&self) -> &str {
        match &self.kind {
            SpecKind::Alias { target, .. } => target,
            _ => &self.name,
        }
    }

    /// Range to resolve against the registry: the alias range for aliases.
    #[must_use]
    pub fn registry_range(&self) -> &str {
        match &self.kind {
            SpecKind::Alias { range, .. } => range,
            _ => &self.raw_range,
        }
    }
}

fn split_scoped(input: &str) -> Result<(&str, Option<&str>), PkgError> {
    let Some(slash_pos) = input.find('/') else {
        return Err(PkgError::spec_invalid(format!(
            "Invalid scoped package: missing '/' in '{input}'"
        )));
    };

    if slash_pos == 1 {
        return Err(PkgError::spec_invalid(format!(
            "Invalid scoped package: empty scope in '{input}'"
        )));
    }

    let after_slash = &input[slash_pos + 1..];
    let (pkg_name, range) = match after_slash.find('@') {
        Some(at) => (&after_slash[..at], Some(&after_slash[at + 1..])),
        None => (after_slash, None),
    };

    if pkg_name.is_empty() {
        return Err(PkgError::spec_invalid(format!(
            "Invalid scoped package: empty name in '{input}'"
        )));
    }
    if range.is_some_and(str::is_empty) {
        return Err(PkgError::spec_invalid(format!(
            "Invalid package spec: empty version range in '{input}'"
        )));
    }

    let name_len = slash_pos + 1 + pkg_name.len();
    Ok((&input[..name_len], range))
}

fn split_unscoped(input: &str) -> Result<(&str, Option<&str>), PkgError> {
    let (name, range) = match input.find('@') {
        Some(at) => (&input[..at], Some(&input[at + 1..])),
        None => (input, None),
    };

    if name.is_empty() {
        return Err(PkgError::spec_invalid(format!(
            "Invalid package spec: empty name in '{input}'"
        )));
    }
    if range.is_some_and(str::is_empty) {
        return Err(PkgError::spec_invalid(format!(
            "Invalid package spec: empty version range in '{input}'"
        )));
    }

    validate_name(name)?;
    Ok((name, range))
}

fn validate_name(name: &str) -> Result<(), PkgError> {
    for c in name.chars() {
        if !c.is_alphanumeric() && c != '-' && c != '_' && c != '.' {
            return Err(PkgError::spec_invalid(format!(
                "Invalid character '{c}' in package name '{name}'"
            )));
        }
    }
    Ok(())
}

/// Classify a declared range.
#[must_use]
pub fn classify(raw_range: &str) -> SpecKind {
    let range = raw_range.trim();

    if let Some(rest) = range.strip_prefix("npm:") {
        let (target, inner) = if let Some(scoped) = rest.strip_prefix('@') {
            match scoped.find('@') {
                Some(at) => (&rest[..=at], &scoped[at + 1..]),
                None => (rest, ""),
            }
        } else {
            match rest.find('@') {
                Some(at) => (&rest[..at], &rest[at + 1..]),
                None => (rest, ""),
            }
        };
        return SpecKind::Alias {
            target: target.to_string(),
            range: inner.to_string(),
        };
    }

    if range.starts_with("file:")
        || range.starts_with("link:")
        || range.starts_with("./")
        || range.starts_with("../")
        || range.starts_with('/')
        || range.starts_with("~/")
    {
        return SpecKind::File;
    }

    if is_git(range) {
        return SpecKind::Git;
    }

    if range.starts_with("http://") || range.starts_with("https://") {
        return SpecKind::Remote;
    }

    if parse_loose_version(range).is_some() {
        return SpecKind::Version;
    }

    if NpmRange::parse(range).is_ok() {
        return SpecKind::Range;
    }

    SpecKind::Tag
}

fn is_git(range: &str) -> bool {
    const PREFIXES: [&str; 7] = [
        "git+",
        "git://",
        "github:",
        "gitlab:",
        "bitbucket:",
        "gist:",
        "git@",
    ];
    if PREFIXES.iter().any(|p| range.starts_with(p)) {
        return true;
    }
    if (range.starts_with("http://") || range.starts_with("https://"))
        && range.split('#').next().is_some_and(|u| u.ends_with(".git"))
    {
        return true;
    }
    // user/repo shorthand
    let repo = range.split('#').next().unwrap_or(range);
    let mut parts = repo.split('/');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(user), Some(project), None)
            if !user.is_empty()
                && !project.is_empty()
                && !user.starts_with('@')
                && !repo.contains(':')
                && !repo.contains(' ')
    )
}

/// Root specs of a project manifest.
///
/// Sections are layered dev, then prod, then optional, so a name declared in
/// several sections takes the range of the last one. Names present in
/// `devDependencies` are flagged `dev`, names in `optionalDependencies` are
/// flagged `optional`.
#[must_use]
pub fn specs_from_manifest(manifest: &Manifest) -> Vec<PackageSpec> {
    let mut merged: BTreeMap<&str, &str> = BTreeMap::new();
    for section in [
        &manifest.dev_dependencies,
        &manifest.dependencies,
        &manifest.optional_dependencies,
    ] {
        for (name, range) in section {
            merged.insert(name, range);
        }
    }

    merged
        .into_iter()
        .map(|(name, range)| {
            PackageSpec::from_dependency(
                name,
                range,
                manifest.dev_dependencies.contains_key(name),
                manifest.optional_dependencies.contains_key(name),
            )
        })
        .collect()
}

/// Child specs of an installed package.
///
/// `optionalDependencies` are merged under `dependencies` and bundled names
/// are dropped since they ship inside the tarball.
#[must_use]
pub fn dependency_specs(manifest: &Manifest) -> Vec<PackageSpec> {
    let bundled: BTreeSet<String> = manifest.bundled_names().into_iter().collect();
    let mut merged: Dependencies = manifest.optional_dependencies.clone();
    merged.extend(
        manifest
            .dependencies
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );

    merged
        .iter()
        .filter(|(name, _)| !bundled.contains(*name))
        .map(|(name, range)| {
            PackageSpec::from_dependency(
                name,
                range,
                false,
                manifest.optional_dependencies.contains_key(name),
            )
        })
        .collect()
}
