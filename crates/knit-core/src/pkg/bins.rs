//! Executable shims in `node_modules/.bin`.
//!
//! On Unix a shim is a symlink to the package's script, which is made
//! executable. On Windows it is a `.cmd` file invoking `node`.

use super::error::PkgError;
use super::manifest::{Bin, Manifest};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Executables a package declares, as `(command, script path)`.
///
/// Commands with path separators are dropped; a scoped package's single bin
/// is named after the unscoped part.
#[must_use]
pub fn package_bins(manifest: &Manifest, pkg_dir: &Path) -> Vec<(String, PathBuf)> {
    let mut out = Vec::new();
    match &manifest.bin {
        Some(Bin::Single(path)) => {
            let name = manifest
                .name
                .rsplit('/')
                .next()
                .unwrap_or(&manifest.name)
                .to_string();
            out.push((name, pkg_dir.join(path)));
        }
        Some(Bin::Map(map)) => {
            for (name, path) in map {
                let name = name.rsplit('/').next().unwrap_or(name).to_string();
                out.push((name, pkg_dir.join(path)));
            }
        }
        None => {
            if let Some(dir) = manifest.directories.as_ref().and_then(|d| d.bin.as_ref()) {
                let bin_dir = pkg_dir.join(dir);
                for entry in WalkDir::new(&bin_dir)
                    .min_depth(1)
                    .into_iter()
                    .filter_map(Result::ok)
                    .filter(|e| e.file_type().is_file())
                {
                    let name = entry.file_name().to_string_lossy().to_string();
                    out.push((name, entry.into_path()));
                }
            }
        }
    }
    out.retain(|(name, _)| is_safe_command(name));
    out
}

fn is_safe_command(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// Link the executables of the package in `pkg_dir` into `bin_dir`.
///
/// Returns the created command names. A package without `package.json` has
/// no bins.
///
/// # Errors
/// Returns `PKG_LINK_FAILED` if a shim cannot be written.
pub fn link_pkg_bins(pkg_dir: &Path, bin_dir: &Path) -> Result<Vec<String>, PkgError> {
    let Some(manifest) = Manifest::read_from_dir(pkg_dir)? else {
        return Ok(Vec::new());
    };
    let bins = package_bins(&manifest, pkg_dir);
    if bins.is_empty() {
        return Ok(Vec::new());
    }
    fs::create_dir_all(bin_dir).map_err(|e| {
        PkgError::link_failed(format!("Failed to create {}: {e}", bin_dir.display()))
    })?;

    let mut linked = Vec::with_capacity(bins.len());
    for (name, target) in bins {
        if !target.exists() {
            tracing::debug!(bin = %name, target = %target.display(), "bin target missing");
            continue;
        }
        write_shim(&target, bin_dir, &name)?;
        linked.push(name);
    }
    Ok(linked)
}

/// Link the executables of every package directly under `modules`.
///
/// # Errors
/// Returns `PKG_LINK_FAILED` if a shim cannot be written.
pub fn link_bins(modules: &Path, bin_dir: &Path) -> Result<Vec<String>, PkgError> {
    let mut linked = Vec::new();
    for pkg_dir in packages_in(modules) {
        linked.extend(link_pkg_bins(&pkg_dir, bin_dir)?);
    }
    Ok(linked)
}

/// Package directories directly under a `node_modules` directory, scoped
/// packages included.
fn packages_in(modules: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(modules) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if name.starts_with('@') {
            if let Ok(scoped) = fs::read_dir(&path) {
                out.extend(scoped.filter_map(Result::ok).map(|e| e.path()));
            }
        } else {
            out.push(path);
        }
    }
    out.sort();
    out
}

/// Remove shims in `bin_dir` that point into `root`.
///
/// Returns the removed command names.
pub fn remove_bins_into(bin_dir: &Path, root: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(bin_dir) else {
        return Vec::new();
    };
    let mut removed = Vec::new();
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if !shim_points_into(&path, root) {
            continue;
        }
        match knit_util::fs::remove_any(&path) {
            Ok(()) => removed.push(entry.file_name().to_string_lossy().to_string()),
            Err(e) => tracing::warn!(bin = %path.display(), error = %e, "failed to remove bin"),
        }
    }
    removed.sort();
    removed
}

fn shim_points_into(shim: &Path, root: &Path) -> bool {
    if let Ok(target) = fs::read_link(shim) {
        return target.starts_with(root);
    }
    fs::read_to_string(shim).is_ok_and(|content| content.contains(&*root.to_string_lossy()))
}

#[cfg(unix)]
fn write_shim(target: &Path, bin_dir: &Path, name: &str) -> Result<(), PkgError> {
    use std::os::unix::fs::PermissionsExt;

    let shim = bin_dir.join(name);
    knit_util::fs::remove_any(&shim)
        .map_err(|e| PkgError::link_failed(format!("Failed to replace {}: {e}", shim.display())))?;
    std::os::unix::fs::symlink(target, &shim).map_err(|e| {
        PkgError::link_failed(format!(
            "Failed to link bin {} to {}: {e}",
            shim.display(),
            target.display()
        ))
    })?;
    // The store's copy is shared through hardlinks, so this also marks it.
    if let Ok(meta) = fs::metadata(target) {
        let mode = meta.permissions().mode() | 0o755;
        let _ = fs::set_permissions(target, fs::Permissions::from_mode(mode));
    }
    Ok(())
}

#[cfg(not(unix))]
fn write_shim(target: &Path, bin_dir: &Path, name: &str) -> Result<(), PkgError> {
    let shim = bin_dir.join(format!("{name}.cmd"));
    let content = format!("@node \"{}\" %*\r\n", target.display());
    knit_util::fs::atomic_write(&shim, content.as_bytes())
        .map_err(|e| PkgError::link_failed(format!("Failed to write {}: {e}", shim.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn package(dir: &Path, manifest: &str, files: &[&str]) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("package.json"), manifest).unwrap();
        for file in files {
            let path = dir.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "#!/usr/bin/env node\n").unwrap();
        }
    }

    #[test]
    fn test_package_bins_forms() {
        let dir = Path::new("/pkg");
        let single: Manifest =
            serde_json::from_str(r#"{"name":"@scope/tool","bin":"cli.js"}"#).unwrap();
        assert_eq!(
            package_bins(&single, dir),
            vec![("tool".to_string(), dir.join("cli.js"))]
        );

        let map: Manifest =
            serde_json::from_str(r#"{"name":"x","bin":{"a":"a.js","../evil":"b.js"}}"#).unwrap();
        let mut names: Vec<String> = package_bins(&map, dir).into_iter().map(|b| b.0).collect();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "evil".to_string()]);
    }

    #[test]
    fn test_directories_bin() {
        let tmp = tempdir().unwrap();
        let pkg = tmp.path().join("tool");
        package(
            &pkg,
            r#"{"name":"tool","directories":{"bin":"./bin"}}"#,
            &["bin/one", "bin/two"],
        );
        let manifest = Manifest::read_from_dir(&pkg).unwrap().unwrap();
        let mut names: Vec<String> = package_bins(&manifest, &pkg).into_iter().map(|b| b.0).collect();
        names.sort();
        assert_eq!(names, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_link_bins_scans_scopes_and_removes() {
        let tmp = tempdir().unwrap();
        let modules = tmp.path().join("node_modules");
        package(&modules.join("a"), r#"{"name":"a","bin":"a.js"}"#, &["a.js"]);
        package(
            &modules.join("@s").join("b"),
            r#"{"name":"@s/b","bin":{"bee":"bin/b.js"}}"#,
            &["bin/b.js"],
        );
        package(&modules.join("c"), r#"{"name":"c"}"#, &[]);
        let bin_dir = modules.join(".bin");

        let mut linked = link_bins(&modules, &bin_dir).unwrap();
        linked.sort();
        assert_eq!(linked, vec!["a".to_string(), "bee".to_string()]);

        let removed = remove_bins_into(&bin_dir, &modules.join("a"));
        #[cfg(unix)]
        assert_eq!(removed, vec!["a".to_string()]);
        #[cfg(not(unix))]
        assert_eq!(removed, vec!["a.cmd".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_shim_is_executable_symlink() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempdir().unwrap();
        let pkg = tmp.path().join("a");
        package(&pkg, r#"{"name":"a","bin":"cli.js"}"#, &["cli.js"]);
        let bin_dir = tmp.path().join(".bin");

        link_pkg_bins(&pkg, &bin_dir).unwrap();
        let shim = bin_dir.join("a");
        assert_eq!(fs::read_link(&shim).unwrap(), pkg.join("cli.js"));
        let mode = fs::metadata(&shim).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);

        // relinking replaces the shim
        link_pkg_bins(&pkg, &bin_dir).unwrap();
        assert!(fs::symlink_metadata(&shim).unwrap().file_type().is_symlink());
    }
}
