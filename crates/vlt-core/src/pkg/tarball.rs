//! Package tarball extraction.

use super::error::PkgError;
use super::manifest::{Manifest, MANIFEST_NAME};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tar::Archive;

/// Whether a local path names a tarball rather than a directory.
#[must_use]
pub fn is_tarball_path(path: &str) -> bool {
    path.ends_with(".tgz") || path.ends_with(".tar.gz") || path.ends_with(".tar")
}

/// Extract a package tarball so its contents land directly in `dest`.
///
/// Entries share a single top-level directory (usually `package/`, but
/// some packages such as `@types/*` use the bare name); that prefix is
/// dropped. Extraction happens in a temp directory next to `dest`, which
/// is then renamed into place, so `dest` never holds a partial package.
///
/// # Errors
/// Returns an error if the tarball is invalid or the rename fails.
pub fn extract_package(bytes: &[u8], dest: &Path) -> Result<(), PkgError> {
    let parent = dest
        .parent()
        .ok_or_else(|| PkgError::Extract(format!("{} has no parent", dest.display())))?;
    fs::create_dir_all(parent).map_err(|e| PkgError::io(parent, e))?;

    if dest.exists() {
        return Ok(());
    }

    let temp = tempfile::Builder::new()
        .prefix(".extract-")
        .tempdir_in(parent)
        .map_err(|e| PkgError::io(parent, e))?;

    extract_tgz_to(bytes, temp.path())?;
    let root = find_extracted_root(temp.path())?;

    match fs::rename(&root, dest) {
        Ok(()) => Ok(()),
        // Another writer placed identical content first.
        Err(_) if dest.exists() => Ok(()),
        Err(e) => {
            copy_dir_all(&root, dest).map_err(|copy_err| {
                PkgError::Extract(format!(
                    "Failed to move or copy extracted package: rename={e}, copy={copy_err}"
                ))
            })?;
            Ok(())
        }
    }
}

/// Read `package.json` out of a tarball without extracting it.
///
/// # Errors
/// Returns an error if the tarball is invalid or holds no top-level manifest.
pub fn read_manifest(bytes: &[u8]) -> Result<Manifest, PkgError> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let entries = archive
        .entries()
        .map_err(|e| PkgError::Extract(format!("Failed to read tarball entries: {e}")))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| PkgError::Extract(format!("Failed to read tarball entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| PkgError::Extract(format!("Failed to read entry path: {e}")))?
            .into_owned();
        let parts: Vec<Component<'_>> = path.components().collect();
        let is_manifest = matches!(parts.as_slice(), [Component::Normal(_), Component::Normal(file)] if *file == MANIFEST_NAME);
        if !is_manifest {
            continue;
        }

        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .map_err(|e| PkgError::Extract(format!("Failed to read {}: {e}", path.display())))?;
        return Manifest::from_slice(&buf).map_err(|e| PkgError::manifest_invalid(&path, e));
    }

    Err(PkgError::Extract("Tarball does not contain a package.json".into()))
}

/// Copy a local package directory, skipping its own `node_modules` and VCS data.
///
/// # Errors
/// Returns an error if any file cannot be copied.
pub fn copy_package_dir(src: &Path, dst: &Path) -> Result<(), PkgError> {
    fs::create_dir_all(dst).map_err(|e| PkgError::io(dst, e))?;
    let entries = fs::read_dir(src).map_err(|e| PkgError::io(src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| PkgError::io(src, e))?;
        let name = entry.file_name();
        if name == "node_modules" || name == ".git" {
            continue;
        }
        let src_path = entry.path();
        let dst_path = dst.join(&name);
        let ty = entry.file_type().map_err(|e| PkgError::io(&src_path, e))?;
        if ty.is_dir() {
            copy_dir_all(&src_path, &dst_path).map_err(|e| PkgError::io(&src_path, e))?;
        } else if ty.is_file() {
            fs::copy(&src_path, &dst_path).map_err(|e| PkgError::io(&src_path, e))?;
        }
    }
    Ok(())
}

/// Find the single top-level directory in an extracted tarball.
fn find_extracted_root(temp_dir: &Path) -> Result<PathBuf, PkgError> {
    let package_dir = temp_dir.join("package");
    if package_dir.is_dir() {
        return Ok(package_dir);
    }

    let entries: Vec<_> = fs::read_dir(temp_dir)
        .map_err(|e| PkgError::Extract(format!("Failed to read extracted dir: {e}")))?
        .filter_map(Result::ok)
        .filter(|e| {
            e.file_type().map(|ft| ft.is_dir()).unwrap_or(false)
                && !e.file_name().to_string_lossy().starts_with('.')
        })
        .collect();

    match entries.as_slice() {
        [only] => Ok(only.path()),
        [] => Err(PkgError::Extract(
            "Tarball does not contain any top-level directory".into(),
        )),
        many => Err(PkgError::Extract(format!(
            "Tarball contains {} top-level directories, expected 1",
            many.len()
        ))),
    }
}

fn extract_tgz_to(bytes: &[u8], dest: &Path) -> Result<(), PkgError> {
    let mut archive = Archive::new(GzDecoder::new(bytes));

    for entry in archive
        .entries()
        .map_err(|e| PkgError::Extract(format!("Failed to read tarball entries: {e}")))?
    {
        let mut entry =
            entry.map_err(|e| PkgError::Extract(format!("Failed to read tarball entry: {e}")))?;

        let path = entry
            .path()
            .map_err(|e| PkgError::Extract(format!("Failed to read entry path: {e}")))?
            .into_owned();

        if path.is_absolute() {
            return Err(PkgError::Extract(format!(
                "Tarball contains absolute path: {}",
                path.display()
            )));
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(PkgError::Extract(format!(
                "Tarball contains path traversal: {}",
                path.display()
            )));
        }

        let dest_path = dest.join(&path);
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).map_err(|e| PkgError::io(parent, e))?;
        }

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            fs::create_dir_all(&dest_path).map_err(|e| PkgError::io(&dest_path, e))?;
        } else if kind.is_file() {
            let mut file = File::create(&dest_path).map_err(|e| PkgError::io(&dest_path, e))?;
            io::copy(&mut entry, &mut file).map_err(|e| PkgError::io(&dest_path, e))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(mode) = entry.header().mode() {
                    let _ = fs::set_permissions(&dest_path, fs::Permissions::from_mode(mode | 0o644));
                }
            }
        }
        // Links and special entries are skipped.
    }

    Ok(())
}

/// Recursively copy a directory, skipping symlinks.
///
/// # Errors
/// Returns an error if any entry cannot be read or copied.
pub fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if ty.is_dir() {
            copy_dir_all(&src_path, &dst_path)?;
        } else if ty.is_file() {
            fs::copy(&src_path, &dst_path)?;
        }
    }

    Ok(())
}
