use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-process counter so concurrent writers never share a temp file.
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Build a temp path next to `path` that is unique within this process.
#[must_use]
pub fn temp_sibling(path: &Path) -> std::path::PathBuf {
    let parent = path.parent().unwrap_or(Path::new("."));
    parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

/// Atomically write bytes to a file by writing to a temp file then renaming.
///
/// The file will either have the old contents or the new contents, never a
/// partial write. Concurrent writers of identical bytes converge.
///
/// # Errors
/// Returns an error if the write or rename fails.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let temp_path = temp_sibling(path);

    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    match fs::rename(&temp_path, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            // On Windows, rename can fail if target exists. Try copy + remove as fallback.
            if cfg!(windows) {
                fs::copy(&temp_path, path)?;
                let _ = fs::remove_file(&temp_path);
                Ok(())
            } else {
                let _ = fs::remove_file(&temp_path);
                Err(e)
            }
        }
    }
}

/// Check whether a directory has no entries.
///
/// A missing directory counts as empty.
///
/// # Errors
/// Returns an error if the directory exists but cannot be read.
pub fn dir_is_empty(dir: &Path) -> io::Result<bool> {
    match fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}

/// Remove `start` and each of its ancestors while they are empty directories,
/// never touching `stop` or anything above it.
///
/// Stops at the first level that still holds a sibling or unrelated file.
/// Returns the directories that were removed, deepest first.
///
/// # Errors
/// Returns an error if a directory cannot be inspected or removed.
pub fn vacuum_empty_dirs(start: &Path, stop: &Path) -> io::Result<Vec<std::path::PathBuf>> {
    let mut removed = Vec::new();
    let mut current = start.to_path_buf();

    while current.starts_with(stop) && current != stop {
        if !dir_is_empty(&current)? {
            break;
        }
        match fs::remove_dir(&current) {
            Ok(()) => removed.push(current.clone()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                // Someone wrote into it between the check and the removal.
                if !dir_is_empty(&current)? {
                    break;
                }
                return Err(e);
            }
        }
        if !current.pop() {
            break;
        }
    }

    Ok(removed)
}
