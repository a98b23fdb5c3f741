//! Reversible filesystem mutations.
//!
//! Every change reify makes goes through a [`Journal`], which performs it and
//! records how to undo it. Removed paths are renamed into a backup directory
//! inside the project (same filesystem, so the rename is atomic) rather than
//! deleted. [`Journal::rollback`] replays the undo log in reverse;
//! [`Journal::commit`] discards the backups.
//!
//! Each operation is a no-op when the filesystem is already in the requested
//! state, and only real changes count as mutations.

use super::error::PkgError;
use super::link;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};
use vlt_util::fs::{atomic_write, dir_is_empty, vacuum_empty_dirs};

#[derive(Debug)]
enum Undo {
    /// A file or link this journal created.
    RemoveFile(PathBuf),
    /// An empty directory this journal created.
    RemoveDir(PathBuf),
    /// A directory tree this journal moved into place.
    RemoveTree(PathBuf),
    /// A directory this journal removed while empty.
    RecreateDir(PathBuf),
    /// A path moved into the backup directory.
    Restore { backup: PathBuf, original: PathBuf },
}

/// Undo log for one reify call.
#[derive(Debug)]
pub struct Journal {
    root: PathBuf,
    backup: Option<TempDir>,
    backups: usize,
    undo: Vec<Undo>,
    mutations: usize,
}

impl Journal {
    /// Start a journal. Backups are kept under `root`.
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            backup: None,
            backups: 0,
            undo: Vec::new(),
            mutations: 0,
        }
    }

    /// Number of changes applied so far.
    #[must_use]
    pub fn mutations(&self) -> usize {
        self.mutations
    }

    fn record(&mut self, undo: Undo) {
        debug!(undo = ?undo, "journal");
        self.undo.push(undo);
        self.mutations += 1;
    }

    fn backup_path(&mut self) -> Result<PathBuf, PkgError> {
        if self.backup.is_none() {
            let dir = tempfile::Builder::new()
                .prefix(".vlt-backup-")
                .tempdir_in(&self.root)
                .map_err(|e| PkgError::io(&self.root, e))?;
            self.backup = Some(dir);
        }
        let dir = self
            .backup
            .as_ref()
            .map(TempDir::path)
            .ok_or_else(|| PkgError::Link("backup directory unavailable".into()))?;
        self.backups += 1;
        Ok(dir.join(self.backups.to_string()))
    }

    /// Create `dir` and any missing parents.
    ///
    /// # Errors
    /// Returns an error if a directory cannot be created.
    pub fn create_dir_all(&mut self, dir: &Path) -> Result<(), PkgError> {
        let mut missing = Vec::new();
        let mut current = Some(dir);
        while let Some(path) = current {
            if fs::symlink_metadata(path).is_ok() {
                break;
            }
            missing.push(path.to_path_buf());
            current = path.parent();
        }

        for path in missing.into_iter().rev() {
            match fs::create_dir(&path) {
                Ok(()) => self.record(Undo::RemoveDir(path)),
                // Another writer got there first.
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(PkgError::io(&path, e)),
            }
        }
        Ok(())
    }

    /// Move whatever is at `path` into the backup directory. Returns whether
    /// anything was there.
    ///
    /// # Errors
    /// Returns an error if the path cannot be moved.
    pub fn remove(&mut self, path: &Path) -> Result<bool, PkgError> {
        if fs::symlink_metadata(path).is_err() {
            return Ok(false);
        }
        let backup = self.backup_path()?;
        fs::rename(path, &backup).map_err(|e| PkgError::io(path, e))?;
        self.record(Undo::Restore {
            backup,
            original: path.to_path_buf(),
        });
        Ok(true)
    }

    /// Point a directory link at `target`, replacing whatever is at `link`.
    /// Returns whether anything changed.
    ///
    /// # Errors
    /// Returns an error if the link cannot be created.
    pub fn link_dir(&mut self, target: &Path, link_path: &Path) -> Result<bool, PkgError> {
        if link::link_points_to(link_path, target) {
            return Ok(false);
        }
        self.remove(link_path)?;
        if let Some(parent) = link_path.parent() {
            self.create_dir_all(parent)?;
        }
        link::create_dir_link(target, link_path)?;
        self.record(Undo::RemoveFile(link_path.to_path_buf()));
        Ok(true)
    }

    /// Point a file symlink at `target`, replacing whatever is at `link`.
    ///
    /// # Errors
    /// Returns an error if the link cannot be created.
    #[cfg(unix)]
    pub fn link_file(&mut self, target: &Path, link_path: &Path) -> Result<bool, PkgError> {
        if link::link_points_to(link_path, target) {
            return Ok(false);
        }
        self.remove(link_path)?;
        if let Some(parent) = link_path.parent() {
            self.create_dir_all(parent)?;
        }
        link::create_file_link(target, link_path)?;
        self.record(Undo::RemoveFile(link_path.to_path_buf()));
        Ok(true)
    }

    /// Write `bytes` to `path` unless it already holds exactly that content.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn write_file(&mut self, path: &Path, bytes: &[u8]) -> Result<bool, PkgError> {
        if fs::read(path).is_ok_and(|existing| existing == bytes) {
            return Ok(false);
        }
        self.remove(path)?;
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent)?;
        }
        atomic_write(path, bytes).map_err(|e| PkgError::io(path, e))?;
        self.record(Undo::RemoveFile(path.to_path_buf()));
        Ok(true)
    }

    /// Move a staged directory to `dest`. When `dest` already exists the
    /// staged copy is left for the caller to discard.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be moved.
    pub fn place_dir(&mut self, staged: &Path, dest: &Path) -> Result<bool, PkgError> {
        if fs::symlink_metadata(dest).is_ok() {
            return Ok(false);
        }
        if let Some(parent) = dest.parent() {
            self.create_dir_all(parent)?;
        }
        fs::rename(staged, dest).map_err(|e| PkgError::io(dest, e))?;
        self.record(Undo::RemoveTree(dest.to_path_buf()));
        Ok(true)
    }

    /// Remove `dir` if it exists and is empty.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read or removed.
    pub fn remove_empty_dir(&mut self, dir: &Path) -> Result<bool, PkgError> {
        if !dir.is_dir() || link::is_link(dir) {
            return Ok(false);
        }
        if !dir_is_empty(dir).map_err(|e| PkgError::io(dir, e))? {
            return Ok(false);
        }
        fs::remove_dir(dir).map_err(|e| PkgError::io(dir, e))?;
        self.record(Undo::RecreateDir(dir.to_path_buf()));
        Ok(true)
    }

    /// Remove empty directories from `start` up to, not including, `stop`.
    /// Stops at the first directory that still has any entry.
    ///
    /// # Errors
    /// Returns an error if a directory cannot be read or removed.
    pub fn vacuum(&mut self, start: &Path, stop: &Path) -> Result<usize, PkgError> {
        let removed = vacuum_empty_dirs(start, stop).map_err(|e| PkgError::io(start, e))?;
        let count = removed.len();
        for dir in removed {
            self.record(Undo::RecreateDir(dir));
        }
        Ok(count)
    }

    /// Keep every change and drop the backups.
    pub fn commit(self) -> usize {
        debug!(mutations = self.mutations, "journal committed");
        self.mutations
    }

    /// Undo every change in reverse order. Keeps going past failures and
    /// reports the first one.
    ///
    /// # Errors
    /// Returns the first undo step that failed.
    pub fn rollback(mut self) -> Result<(), PkgError> {
        let mut first_error = None;
        let steps = std::mem::take(&mut self.undo);
        for step in steps.into_iter().rev() {
            if let Err(e) = undo(&step) {
                warn!(step = ?step, error = %e, "rollback step failed");
                first_error.get_or_insert(e);
            }
        }
        debug!(mutations = self.mutations, "journal rolled back");
        first_error.map_or(Ok(()), Err)
    }
}

fn undo(step: &Undo) -> Result<(), PkgError> {
    match step {
        Undo::RemoveFile(path) => {
            if link::is_link(path) {
                link::remove_link(path)
            } else {
                fs::remove_file(path).map_err(|e| PkgError::io(path, e))
            }
        }
        Undo::RemoveDir(path) => fs::remove_dir(path).map_err(|e| PkgError::io(path, e)),
        Undo::RemoveTree(path) => fs::remove_dir_all(path).map_err(|e| PkgError::io(path, e)),
        Undo::RecreateDir(path) => fs::create_dir_all(path).map_err(|e| PkgError::io(path, e)),
        Undo::Restore { backup, original } => {
            fs::rename(backup, original).map_err(|e| PkgError::io(original, e))
        }
    }
}
