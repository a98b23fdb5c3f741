//! Directory links for `node_modules`.
//!
//! On Unix a dependency link is a relative symlink into the store, so a
//! project directory can be moved without breaking it. Windows uses
//! junctions, which must be absolute.

use super::error::PkgError;
use crate::paths::{normalize, relative_path};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Whether `path` is a symlink or junction (not following it).
#[must_use]
pub fn is_link(path: &Path) -> bool {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return false;
    };
    if metadata.file_type().is_symlink() {
        return true;
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::MetadataExt;
        // FILE_ATTRIBUTE_REPARSE_POINT
        if metadata.file_attributes() & 0x400 != 0 {
            return true;
        }
    }
    false
}

/// Absolute, lexically normalized target of a link.
///
/// # Errors
/// Returns an error if `link` is not a link.
pub fn read_link_target(link: &Path) -> io::Result<PathBuf> {
    let target = fs::read_link(link)?;
    if target.is_absolute() {
        return Ok(normalize(&target));
    }
    let parent = link.parent().unwrap_or_else(|| Path::new(""));
    Ok(normalize(&parent.join(target)))
}

/// Whether `link` is a link resolving to `target`.
#[must_use]
pub fn link_points_to(link: &Path, target: &Path) -> bool {
    is_link(link) && read_link_target(link).is_ok_and(|t| t == normalize(target))
}

/// The value to store in a link at `link` pointing at `target`.
#[must_use]
pub fn link_value(link: &Path, target: &Path) -> PathBuf {
    if cfg!(windows) {
        return normalize(target);
    }
    let parent = link.parent().unwrap_or_else(|| Path::new(""));
    relative_path(&normalize(parent), &normalize(target))
}

/// Create a directory link at `link` pointing at `target`. Parent
/// directories are created; `link` itself must not exist.
///
/// # Errors
/// Returns an error if the link cannot be created.
pub fn create_dir_link(target: &Path, link: &Path) -> Result<(), PkgError> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).map_err(|e| PkgError::io(parent, e))?;
    }

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(link_value(link, target), link).map_err(|e| {
            PkgError::Link(format!(
                "Failed to create symlink from {} to {}: {e}",
                link.display(),
                target.display()
            ))
        })?;
    }

    #[cfg(windows)]
    {
        junction::create(link_value(link, target), link).map_err(|e| {
            PkgError::Link(format!(
                "Failed to create junction from {} to {}: {e}",
                link.display(),
                target.display()
            ))
        })?;
    }

    Ok(())
}

/// Create a file symlink (used for bin entries on Unix).
///
/// # Errors
/// Returns an error if the link cannot be created.
#[cfg(unix)]
pub fn create_file_link(target: &Path, link: &Path) -> Result<(), PkgError> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).map_err(|e| PkgError::io(parent, e))?;
    }
    std::os::unix::fs::symlink(link_value(link, target), link).map_err(|e| {
        PkgError::Link(format!(
            "Failed to create symlink from {} to {}: {e}",
            link.display(),
            target.display()
        ))
    })
}

/// Remove a symlink or junction without touching what it points at.
///
/// # Errors
/// Returns an error if `path` is not a link or cannot be removed.
pub fn remove_link(path: &Path) -> Result<(), PkgError> {
    if !is_link(path) {
        return Err(PkgError::Link(format!("{} is not a link", path.display())));
    }

    // Junctions and directory symlinks are directories on Windows.
    #[cfg(windows)]
    {
        if fs::remove_dir(path).is_ok() {
            return Ok(());
        }
    }

    fs::remove_file(path)
        .map_err(|e| PkgError::Link(format!("Failed to remove link {}: {e}", path.display())))
}
