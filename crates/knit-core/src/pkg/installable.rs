//! Platform and engine checks.
//!
//! `os`/`cpu` lists follow npm: entries may be negated with `!`, `any` matches
//! everything, and an empty list imposes nothing.

use super::error::PkgError;
use super::manifest::Manifest;
use super::version::version_satisfies;

/// Current OS in npm's vocabulary (`process.platform`).
#[must_use]
pub fn current_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        "solaris" | "illumos" => "sunos",
        other => other,
    }
}

/// Current CPU in npm's vocabulary (`process.arch`).
#[must_use]
pub fn current_cpu() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x64",
        "x86" => "ia32",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64",
        "powerpc" => "ppc",
        other => other,
    }
}

fn list_allows(list: &[String], current: &str) -> bool {
    if list.is_empty() {
        return true;
    }
    let mut positive = false;
    let mut matched = false;
    for entry in list {
        if let Some(negated) = entry.strip_prefix('!') {
            if negated == current {
                return false;
            }
        } else {
            positive = true;
            if entry == current || entry == "any" {
                matched = true;
            }
        }
    }
    !positive || matched
}

/// Describe an `os`/`cpu` mismatch, if any.
#[must_use]
pub fn check_platform(id: &str, os: &[String], cpu: &[String]) -> Option<String> {
    check_platform_for(id, os, cpu, current_os(), current_cpu())
}

fn check_platform_for(
    id: &str,
    os: &[String],
    cpu: &[String],
    current_os: &str,
    current_cpu: &str,
) -> Option<String> {
    if list_allows(os, current_os) && list_allows(cpu, current_cpu) {
        return None;
    }
    Some(format!(
        "Unsupported platform for {id}: wanted {{\"os\":{os:?},\"cpu\":{cpu:?}}} (current: {{\"os\":\"{current_os}\",\"cpu\":\"{current_cpu}\"}})"
    ))
}

/// Describe an `engines.node` mismatch, if a node version is known.
#[must_use]
pub fn check_engine(id: &str, manifest: &Manifest, node_version: Option<&str>) -> Option<String> {
    let wanted = manifest.engines.get("node")?;
    let current = node_version?;
    if version_satisfies(current, wanted) {
        return None;
    }
    Some(format!(
        "Unsupported engine for {id}: wanted node {wanted} (current: {current})"
    ))
}

/// Options for [`is_installable`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InstallabilityOptions<'a> {
    pub optional: bool,
    pub engine_strict: bool,
    pub node_version: Option<&'a str>,
}

/// Whether a package can be installed on this machine.
///
/// Optional packages that fail are reported as not installable. A required
/// package on the wrong platform is an error; a required package with an
/// engine mismatch is only a warning unless `engine_strict`.
///
/// # Errors
/// Returns `PKG_UNSUPPORTED_PLATFORM` for required packages that cannot run here.
pub fn is_installable(
    id: &str,
    manifest: &Manifest,
    opts: InstallabilityOptions<'_>,
) -> Result<bool, PkgError> {
    let platform = check_platform(id, &manifest.os, &manifest.cpu);
    let engine = check_engine(id, manifest, opts.node_version);

    let Some(reason) = platform.clone().or(engine) else {
        return Ok(true);
    };

    if opts.optional {
        tracing::warn!(id, reason = %reason, "skipping failed optional dependency");
        return Ok(false);
    }
    if platform.is_some() || opts.engine_strict {
        return Err(PkgError::unsupported_platform(id, &reason));
    }
    tracing::warn!(id, reason = %reason, "unsupported engine");
    Ok(true)
}
