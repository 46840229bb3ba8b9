//! Dependency paths.
//!
//! A package installed from a registry is keyed by `<registry-host>/<name>/<version>`
//! (its *absolute path*). Lockfiles store it relative to their registry as
//! `/<name>/<version>`, and dependency maps store only the *reference*: the
//! version, or the full path when the package comes from elsewhere.
//! Peer-resolved variants append `_<peer>@<version>` segments, with the `/` of
//! scoped peer names written as `+`.

use std::path::{Path, PathBuf};
use url::Url;

/// `https://registry.npmjs.org/` → `registry.npmjs.org`.
#[must_use]
pub fn registry_host(registry: &str) -> String {
    match Url::parse(registry) {
        Ok(url) => {
            let mut host = url.host_str().unwrap_or_default().to_string();
            if let Some(port) = url.port() {
                host.push_str(&format!(":{port}"));
            }
            let path = url.path().trim_end_matches('/');
            host.push_str(path);
            host
        }
        Err(_) => registry
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string(),
    }
}

/// Relative paths start with `/`.
#[must_use]
pub fn is_absolute(dep_path: &str) -> bool {
    !dep_path.starts_with('/')
}

/// Turn a registry-relative path into an absolute one.
#[must_use]
pub fn resolve(registry: &str, dep_path: &str) -> String {
    if is_absolute(dep_path) {
        return dep_path.to_string();
    }
    format!("{}{dep_path}", registry_host(registry))
}

/// Turn an absolute path into one relative to `registry` when it lives there.
#[must_use]
pub fn relative(registry: &str, absolute: &str) -> String {
    let host = registry_host(registry);
    match absolute.strip_prefix(&host) {
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => absolute.to_string(),
    }
}

/// `/name/version` for a registry package.
#[must_use]
pub fn relative_key(name: &str, version: &str) -> String {
    format!("/{name}/{version}")
}

/// Expand a dependency-map reference into a lockfile package key.
///
/// A bare version becomes `/name/version`; anything containing `/` already is a
/// path. `link:` references have no package entry.
#[must_use]
pub fn ref_to_relative(reference: &str, name: &str) -> Option<String> {
    if reference.starts_with("link:") || reference.is_empty() {
        return None;
    }
    if reference.contains('/') {
        return Some(reference.to_string());
    }
    Some(relative_key(name, reference))
}

/// Name and version encoded in a dependency path.
///
/// Works on both relative and absolute paths; the version excludes any peer
/// suffix.
#[must_use]
pub fn parse(dep_path: &str) -> Option<(String, String)> {
    let rel = if is_absolute(dep_path) {
        &dep_path[dep_path.find('/')?..]
    } else {
        dep_path
    };
    let mut segments = rel.trim_start_matches('/').split('/');
    let first = segments.next()?;
    let name = if first.starts_with('@') {
        format!("{first}/{}", segments.next()?)
    } else {
        first.to_string()
    };
    let version_part = segments.next()?;
    if segments.next().is_some() || name.is_empty() {
        return None;
    }
    let version = version_part.split('_').next().unwrap_or(version_part);
    if version.is_empty() {
        return None;
    }
    Some((name, version.to_string()))
}

/// Reference to store in a parent's dependency map.
///
/// Registry packages at their conventional path store only the part after
/// `<host>/<name>/`; other packages store their absolute path.
#[must_use]
pub fn absolute_path_to_ref(
    absolute: &str,
    name: &str,
    is_registry_package: bool,
    registry: &str,
) -> String {
    if !is_registry_package {
        return absolute.to_string();
    }
    let prefix = format!("{}/{name}/", registry_host(registry));
    match absolute.strip_prefix(&prefix) {
        Some(rest) if !rest.contains('/') => rest.to_string(),
        _ => relative(registry, absolute),
    }
}

/// Suffix identifying a peer-resolved variant.
#[must_use]
pub fn peers_suffix(peers: &[(String, String)]) -> String {
    if peers.is_empty() {
        return String::new();
    }
    let mut parts: Vec<String> = peers
        .iter()
        .map(|(name, version)| format!("{}@{version}", name.replace('/', "+")))
        .collect();
    parts.sort();
    format!("_{}", parts.join("_"))
}

/// Directory-name form of an absolute path: `:` is not allowed on every
/// filesystem.
#[must_use]
pub fn sanitize(absolute: &str) -> String {
    absolute.replace(':', "+")
}

/// `node_modules/.<absolute>`, the private directory of one materialized
/// package.
#[must_use]
pub fn location(node_modules: &Path, absolute: &str) -> PathBuf {
    node_modules.join(format!(".{}", sanitize(absolute)))
}

/// `node_modules/.<absolute>/node_modules`, where a package and its
/// dependencies are linked side by side.
#[must_use]
pub fn modules_dir(node_modules: &Path, absolute: &str) -> PathBuf {
    location(node_modules, absolute).join("node_modules")
}

#[cfg(test)]
mod tests {
    use super::*;

    const NPM: &str = "https://registry.npmjs.org/";

    #[test]
    fn test_registry_host() {
        assert_eq!(registry_host(NPM), "registry.npmjs.org");
        assert_eq!(registry_host("http://localhost:4873/"), "localhost:4873");
        assert_eq!(
            registry_host("https://npm.example.com/repo/npm/"),
            "npm.example.com/repo/npm"
        );
    }

    #[test]
    fn test_resolve_and_relative() {
        let abs = resolve(NPM, "/left-pad/1.3.0");
        assert_eq!(abs, "registry.npmjs.org/left-pad/1.3.0");
        assert_eq!(relative(NPM, &abs), "/left-pad/1.3.0");
        assert_eq!(
            relative(NPM, "github.com/user/repo/abc123"),
            "github.com/user/repo/abc123"
        );
        assert_eq!(resolve(NPM, "github.com/x/y"), "github.com/x/y");
    }

    #[test]
    fn test_ref_to_relative() {
        assert_eq!(
            ref_to_relative("1.3.0", "left-pad").as_deref(),
            Some("/left-pad/1.3.0")
        );
        assert_eq!(
            ref_to_relative("1.0.0_react@16.0.0", "foo").as_deref(),
            Some("/foo/1.0.0_react@16.0.0")
        );
        assert_eq!(
            ref_to_relative("github.com/a/b/c", "b").as_deref(),
            Some("github.com/a/b/c")
        );
        assert_eq!(ref_to_relative("link:../x", "x"), None);
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            parse("/left-pad/1.3.0"),
            Some(("left-pad".to_string(), "1.3.0".to_string()))
        );
        assert_eq!(
            parse("registry.npmjs.org/@types/node/20.0.0_typescript@5.0.0"),
            Some(("@types/node".to_string(), "20.0.0".to_string()))
        );
        assert_eq!(parse("/left-pad"), None);
    }

    #[test]
    fn test_absolute_path_to_ref() {
        assert_eq!(
            absolute_path_to_ref("registry.npmjs.org/left-pad/1.3.0", "left-pad", true, NPM),
            "1.3.0"
        );
        assert_eq!(
            absolute_path_to_ref(
                "registry.npmjs.org/foo/1.0.0_@types+react@16.0.0",
                "foo",
                true,
                NPM
            ),
            "1.0.0_@types+react@16.0.0"
        );
        assert_eq!(
            absolute_path_to_ref("github.com/u/r/abc", "r", false, NPM),
            "github.com/u/r/abc"
        );
    }

    #[test]
    fn test_location_sanitizes_port() {
        let nm = Path::new("/p/node_modules");
        assert_eq!(
            modules_dir(nm, "localhost:4873/foo/1.0.0"),
            Path::new("/p/node_modules/.localhost+4873/foo/1.0.0/node_modules")
        );
    }

    #[test]
    fn test_peers_suffix_sorted_and_escaped() {
        let suffix = peers_suffix(&[
            ("react".to_string(), "16.0.0".to_string()),
            ("@types/react".to_string(), "16.1.0".to_string()),
        ]);
        assert_eq!(suffix, "_@types+react@16.1.0_react@16.0.0");
        assert_eq!(peers_suffix(&[]), "");
    }
}
