//! Tarball download and extraction into the store.

use super::error::PkgError;
use super::registry::RegistryClient;
use bytes::Bytes;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tar::Archive;

/// Maximum tarball size (200 MB).
pub const MAX_TARBALL_SIZE: u64 = 200 * 1024 * 1024;

const DOWNLOAD_TIMEOUT_SECS: u64 = 60;

static TEMP_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Download a tarball, holding one of the client's network permits.
///
/// # Errors
/// Returns `PKG_DOWNLOAD_FAILED` if the request fails, the server answers
/// with an error status, or the body exceeds [`MAX_TARBALL_SIZE`].
pub async fn download_tarball(client: &RegistryClient, url: &str) -> Result<Bytes, PkgError> {
    let _permit = client
        .limit()
        .acquire()
        .await
        .map_err(|e| PkgError::download_failed(e.to_string()))?;

    tracing::debug!(url, "downloading tarball");
    let response = client
        .http()
        .get(url)
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .send()
        .await
        .map_err(|e| PkgError::download_failed(format!("Failed to download '{url}': {e}")))?;

    if !response.status().is_success() {
        return Err(PkgError::download_failed(format!(
            "Download failed with status {} for '{url}'",
            response.status()
        )));
    }

    if let Some(len) = response.content_length() {
        if len > MAX_TARBALL_SIZE {
            return Err(PkgError::download_failed(format!(
                "Tarball too large: {len} bytes (max: {MAX_TARBALL_SIZE})"
            )));
        }
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| PkgError::download_failed(format!("Failed to read response body: {e}")))?;

    if bytes.len() as u64 > MAX_TARBALL_SIZE {
        return Err(PkgError::download_failed(format!(
            "Tarball too large: {} bytes (max: {MAX_TARBALL_SIZE})",
            bytes.len()
        )));
    }

    Ok(bytes)
}

/// Read a `file:` tarball relative to the project root.
///
/// # Errors
/// Returns `PKG_DOWNLOAD_FAILED` if the file cannot be read.
pub async fn read_local_tarball(prefix: &Path, reference: &str) -> Result<Bytes, PkgError> {
    let path = prefix.join(reference.trim_start_matches("file:"));
    tokio::fs::read(&path)
        .await
        .map(Bytes::from)
        .map_err(|e| PkgError::download_failed(format!("Failed to read {}: {e}", path.display())))
}

/// Extract a gzipped tarball into `dest`.
///
/// Entries are unpacked into a sibling temp directory, then the single
/// top-level directory of the archive is renamed into place. If `dest`
/// already exists (another process won the race) the call succeeds without
/// touching it.
///
/// # Errors
/// Returns `PKG_EXTRACT_FAILED` for malformed archives, entries escaping the
/// destination, or filesystem failures.
pub fn extract_tgz_atomic(bytes: &[u8], dest: &Path) -> Result<(), PkgError> {
    let parent = dest
        .parent()
        .ok_or_else(|| PkgError::extract_failed("Destination has no parent"))?;
    fs::create_dir_all(parent)?;

    if dest.exists() {
        return Ok(());
    }

    let temp = parent.join(format!(
        ".tmp-{}-{}",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = fs::remove_dir_all(&temp);
    fs::create_dir_all(&temp)?;

    let result = unpack(bytes, &temp)
        .and_then(|()| find_extracted_root(&temp))
        .and_then(|root| move_into_place(&root, dest));
    let _ = fs::remove_dir_all(&temp);
    result
}

fn move_into_place(root: &Path, dest: &Path) -> Result<(), PkgError> {
    match fs::rename(root, dest) {
        Ok(()) => Ok(()),
        Err(_) if dest.exists() => Ok(()),
        Err(rename_err) => copy_dir_all(root, dest).map_err(|copy_err| {
            PkgError::extract_failed(format!(
                "Failed to move or copy extracted package: rename={rename_err}, copy={copy_err}"
            ))
        }),
    }
}

/// The archive's single top-level directory. Most packages use `package/`;
/// some (`@types/*`) use the bare name.
fn find_extracted_root(temp: &Path) -> Result<PathBuf, PkgError> {
    let package = temp.join("package");
    if package.is_dir() {
        return Ok(package);
    }

    let dirs: Vec<PathBuf> = fs::read_dir(temp)
        .map_err(|e| PkgError::extract_failed(format!("Failed to read extracted dir: {e}")))?
        .filter_map(Result::ok)
        .filter(|e| {
            e.file_type().is_ok_and(|t| t.is_dir())
                && !e.file_name().to_string_lossy().starts_with('.')
        })
        .map(|e| e.path())
        .collect();

    match dirs.as_slice() {
        [single] => Ok(single.clone()),
        [] => Err(PkgError::extract_failed(
            "Tarball does not contain any top-level directory",
        )),
        many => Err(PkgError::extract_failed(format!(
            "Tarball contains {} top-level directories, expected 1",
            many.len()
        ))),
    }
}

fn unpack(bytes: &[u8], dest: &Path) -> Result<(), PkgError> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let entries = archive
        .entries()
        .map_err(|e| PkgError::extract_failed(format!("Failed to read tarball entries: {e}")))?;

    for entry in entries {
        let mut entry = entry
            .map_err(|e| PkgError::extract_failed(format!("Failed to read tarball entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| PkgError::extract_failed(format!("Failed to read entry path: {e}")))?
            .into_owned();

        if path.is_absolute() || path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(PkgError::extract_failed(format!(
                "Tarball entry escapes destination: {}",
                path.display()
            )));
        }

        let target = dest.join(&path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            fs::create_dir_all(&target)?;
        } else if kind.is_file() {
            let mut file = File::create(&target)?;
            io::copy(&mut entry, &mut file)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(mode) = entry.header().mode() {
                    let _ = fs::set_permissions(&target, fs::Permissions::from_mode(mode | 0o644));
                }
            }
        }
        // symlinks and special entries are skipped
    }

    Ok(())
}

fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let to = dst.join(entry.file_name());
        if ty.is_dir() {
            copy_dir_all(&entry.path(), &to)?;
        } else if ty.is_file() {
            fs::copy(entry.path(), to)?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tar::Builder;
    use tempfile::tempdir;

    /// Gzipped tarball with the given `(path, content)` entries.
    pub(crate) fn tgz(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut tar_bytes = Vec::new();
        {
            let mut builder = Builder::new(&mut tar_bytes);
            for (path, data) in entries {
                let mut header = tar::Header::new_gnu();
                header.set_path(path).unwrap();
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append(&header, data.as_bytes()).unwrap();
            }
            builder.finish().unwrap();
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_extract_package_prefix() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("left-pad").join("package");
        let bytes = tgz(&[
            ("package/package.json", r#"{"name":"left-pad","version":"1.3.0"}"#),
            ("package/lib/index.js", "module.exports = 1;"),
        ]);

        extract_tgz_atomic(&bytes, &dest).unwrap();
        assert!(dest.join("package.json").exists());
        assert!(dest.join("lib").join("index.js").exists());

        // second extraction leaves the first result alone
        extract_tgz_atomic(&bytes, &dest).unwrap();
        assert_eq!(fs::read_dir(dir.path().join("left-pad")).unwrap().count(), 1);
    }

    #[test]
    fn test_extract_bare_name_prefix() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("node").join("package");
        extract_tgz_atomic(&tgz(&[("node/index.d.ts", "export {};")]), &dest).unwrap();
        assert!(dest.join("index.d.ts").exists());
    }

    #[test]
    fn test_extract_rejects_multiple_roots() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("x").join("package");
        let bytes = tgz(&[("a/one.js", "1"), ("b/two.js", "2")]);
        let err = extract_tgz_atomic(&bytes, &dest).unwrap_err();
        assert_eq!(err.code(), super::super::error::codes::PKG_EXTRACT_FAILED);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_read_local_tarball() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("pkg.tgz"), b"bytes").unwrap();
        let bytes = read_local_tarball(dir.path(), "file:pkg.tgz").await.unwrap();
        assert_eq!(&bytes[..], b"bytes");
        assert!(read_local_tarball(dir.path(), "file:missing.tgz").await.is_err());
    }
}
