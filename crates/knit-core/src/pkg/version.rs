//! npm-flavoured semver ranges on top of the `semver` crate.

use super::error::PkgError;
use super::registry::{get_dist_tag, get_versions};
use semver::{Version, VersionReq};

/// A parsed npm range: a disjunction of `semver` requirements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpmRange {
    alternatives: Vec<VersionReq>,
}

impl NpmRange {
    /// Parse an npm range (`^1`, `1.x`, `1 - 2`, `>=1 <2`, `a || b`, `*`, empty).
    ///
    /// # Errors
    /// Returns `PKG_SPEC_INVALID` when no alternative parses.
    pub fn parse(range: &str) -> Result<Self, PkgError> {
        let range = range.trim();
        if range.is_empty() {
            return Ok(Self::any());
        }

        let mut alternatives = Vec::new();
        for alt in range.split("||").map(str::trim) {
            if alt.is_empty() {
                continue;
            }
            if let Ok(req) = parse_comparator_set(alt) {
                alternatives.push(req);
            }
        }

        if alternatives.is_empty() {
            return Err(PkgError::spec_invalid(format!(
                "Invalid version range '{range}'"
            )));
        }
        Ok(Self { alternatives })
    }

    /// Matches every release version.
    #[must_use]
    pub fn any() -> Self {
        Self {
            alternatives: vec![VersionReq::STAR],
        }
    }

    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }
}

/// Parse a version loosely: leading `v`/`=` and surrounding whitespace are ignored.
#[must_use]
pub fn parse_loose_version(input: &str) -> Option<Version> {
    let trimmed = input.trim().trim_start_matches('=').trim_start_matches('v');
    Version::parse(trimmed).ok()
}

/// Whether `version` satisfies `range`.
///
/// Anything that is not a plain version (a dependency path, a peer-suffixed
/// reference, a URL) never satisfies.
#[must_use]
pub fn version_satisfies(version: &str, range: &str) -> bool {
    let Some(v) = parse_loose_version(version) else {
        return false;
    };
    NpmRange::parse(range).is_ok_and(|r| r.matches(&v))
}

/// Resolve a range or dist-tag against a packument.
///
/// # Rules
/// - an empty range or `latest` returns `dist-tags.latest`
/// - any other dist-tag returns the tagged version
/// - an exact version is returned if present
/// - a semver range returns the highest satisfying version, preferring the
///   `latest` tag when it satisfies
///
/// # Errors
/// Returns an error if no version satisfies the range.
pub fn resolve_version(packument: &serde_json::Value, range: &str) -> Result<String, PkgError> {
    let name = packument
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let range = range.trim();
    let versions = get_versions(packument);

    if range.is_empty() || range == "*" || range == "latest" {
        if let Some(latest) = get_dist_tag(packument, "latest") {
            return Ok(latest.to_string());
        }
        if range == "latest" {
            return Err(PkgError::version_not_found(
                name,
                "latest (no dist-tags.latest found)",
            ));
        }
    }

    if let Some(tagged) = get_dist_tag(packument, range) {
        return Ok(tagged.to_string());
    }

    if let Some(exact) = parse_loose_version(range) {
        let exact = exact.to_string();
        if versions.contains(&exact.as_str()) {
            return Ok(exact);
        }
    }

    let req = NpmRange::parse(range)?;

    if let Some(latest) = get_dist_tag(packument, "latest").and_then(parse_loose_version) {
        if req.matches(&latest) {
            return Ok(latest.to_string());
        }
    }

    let mut parsed: Vec<Version> = versions
        .iter()
        .filter_map(|v| Version::parse(v).ok())
        .collect();
    parsed.sort_by(|a, b| b.cmp(a));

    parsed
        .into_iter()
        .find(|v| req.matches(v))
        .map(|v| v.to_string())
        .ok_or_else(|| PkgError::version_not_found(name, range))
}

/// Parse one `||` alternative.
///
/// Handles:
/// - standard semver ranges: ^1.0.0, ~1.0.0, >=1.0.0
/// - hyphen ranges: 1.0.0 - 2.0.0
/// - x-ranges: 1.x, 1.0.x, *
/// - space-separated comparators: >= 2.1.2 < 3.0.0
fn parse_comparator_set(range: &str) -> Result<VersionReq, semver::Error> {
    let range = range.trim();

    if let Some((start, end)) = split_hyphen_range(range) {
        return VersionReq::parse(&format!(">={start}, <={end}"));
    }

    if range == "*" || range.eq_ignore_ascii_case("x") {
        return Ok(VersionReq::STAR);
    }

    if range.split('.').any(is_wild) {
        return VersionReq::parse(&expand_x_range(range));
    }

    VersionReq::parse(&join_comparators(range))
}

fn split_hyphen_range(range: &str) -> Option<(&str, &str)> {
    let (start, end) = range.split_once(" - ")?;
    let (start, end) = (start.trim(), end.trim());
    (!start.is_empty() && !end.is_empty()).then_some((start, end))
}

/// npm separates AND-ed comparators with spaces, `semver` wants commas.
///
/// An operator standing alone (`>= 2.1.2`) is glued to the version after it.
fn join_comparators(range: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut pending_op = String::new();

    for token in range.split_whitespace() {
        if token.chars().any(|c| c.is_ascii_digit()) {
            parts.push(format!("{pending_op}{token}"));
            pending_op.clear();
        } else {
            pending_op.push_str(token);
        }
    }

    if parts.is_empty() {
        return range.to_string();
    }
    parts.join(", ")
}

fn is_wild(part: &str) -> bool {
    matches!(part, "x" | "X" | "*")
}

fn expand_x_range(range: &str) -> String {
    let parts: Vec<&str> = range.trim().split('.').collect();

    match parts.as_slice() {
        [major, minor] | [major, minor, _] if is_wild(minor) => {
            if let Ok(m) = major.parse::<u64>() {
                return format!(">={m}.0.0, <{}.0.0", m + 1);
            }
        }
        [major, minor, patch] if is_wild(patch) => {
            if let (Ok(m), Ok(n)) = (major.parse::<u64>(), minor.parse::<u64>()) {
                return format!(">={m}.{n}.0, <{m}.{}.0", n + 1);
            }
        }
        _ => {}
    }

    range.replace(['x', 'X'], "0")
}
