//! Executable entries in `node_modules/.bin`.
//!
//! Each `bin` of a linked dependency gets an entry in the `.bin` directory
//! next to the link. Unix uses a relative symlink through the dependency
//! link; Windows gets a `.cmd` and a `.ps1` shim, and both are removed
//! together.

use super::error::PkgError;
use super::journal::Journal;
use super::link::read_link_target;
use super::manifest::Manifest;
use crate::paths::{normalize, relative_path, to_slash, BIN_DIR};
use std::path::{Path, PathBuf};
use tracing::debug;

/// How bin entries are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShimStyle {
    /// One symlink per bin.
    Symlink,
    /// A `.cmd` + `.ps1` pair per bin.
    Windows,
}

impl ShimStyle {
    /// The style for the current platform.
    #[must_use]
    pub fn native() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Symlink
        }
    }

    /// Files one bin named `name` occupies in `bin_dir`.
    #[must_use]
    pub fn paths(self, bin_dir: &Path, name: &str) -> Vec<PathBuf> {
        match self {
            Self::Symlink => vec![bin_dir.join(name)],
            Self::Windows => vec![
                bin_dir.join(format!("{name}.cmd")),
                bin_dir.join(format!("{name}.ps1")),
            ],
        }
    }
}

/// Reject bin names that would escape `.bin`.
///
/// # Errors
/// Returns a link error for empty names, path separators, or dot segments.
pub fn validate_bin_name(name: &str) -> Result<(), PkgError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(PkgError::Link(format!("Invalid bin name '{name}'")));
    }
    Ok(())
}

/// The `.bin` directory for links in `node_modules`.
#[must_use]
pub fn bin_dir(node_modules: &Path) -> PathBuf {
    node_modules.join(BIN_DIR)
}

fn cmd_shim(rel: &str) -> String {
    let rel = rel.replace('/', "\\");
    format!("@ECHO off\r\nnode \"%~dp0\\{rel}\" %*\r\n")
}

fn ps1_shim(rel: &str) -> String {
    format!("#!/usr/bin/env pwsh\n& node \"$PSScriptRoot/{rel}\" $args\nexit $LASTEXITCODE\n")
}

/// Link every bin of the dependency linked at `link_path`.
///
/// `link_path` is `<node_modules>/<name>`; entries go to
/// `<node_modules>/.bin`. Returns the number of entries changed.
///
/// # Errors
/// Returns an error for an invalid bin name or a failed write.
pub fn link_bins(
    journal: &mut Journal,
    node_modules: &Path,
    link_path: &Path,
    manifest: &Manifest,
    style: ShimStyle,
) -> Result<usize, PkgError> {
    let bins = manifest.bins();
    if bins.is_empty() {
        return Ok(0);
    }
    let dir = bin_dir(node_modules);
    let mut changed = 0;

    for (name, rel) in &bins {
        validate_bin_name(name)?;
        let target = normalize(&link_path.join(rel));
        if !target.starts_with(link_path) {
            return Err(PkgError::Link(format!("bin '{name}' points outside its package: {rel}")));
        }
        make_executable(&target);

        match style {
            ShimStyle::Symlink => {
                if link_symlink(journal, &target, &dir.join(name))? {
                    changed += 1;
                }
            }
            ShimStyle::Windows => {
                let rel = to_slash(&relative_path(&dir, &target));
                let [cmd, ps1] = [
                    dir.join(format!("{name}.cmd")),
                    dir.join(format!("{name}.ps1")),
                ];
                let wrote_cmd = journal.write_file(&cmd, cmd_shim(&rel).as_bytes())?;
                let wrote_ps1 = journal.write_file(&ps1, ps1_shim(&rel).as_bytes())?;
                if wrote_cmd || wrote_ps1 {
                    changed += 1;
                }
            }
        }
        debug!(bin = %name, target = %target.display(), "linked bin");
    }
    Ok(changed)
}

/// Remove the bin entries of the dependency linked at `link_path` from
/// `<node_modules>/.bin`. Entries another dependency has since taken over
/// are left alone. Returns the number of files removed.
///
/// # Errors
/// Returns an error if an entry cannot be removed.
pub fn unlink_bins(
    journal: &mut Journal,
    node_modules: &Path,
    link_path: &Path,
    manifest: &Manifest,
    style: ShimStyle,
) -> Result<usize, PkgError> {
    let dir = bin_dir(node_modules);
    let package = normalize(link_path);
    let mut removed = 0;
    for name in manifest.bins().keys() {
        if validate_bin_name(name).is_err() {
            continue;
        }
        for path in style.paths(&dir, name) {
            if !entry_points_into(&path, &dir, &package, style) {
                debug!(bin = %name, entry = %path.display(), "bin owned by another package, keeping");
                continue;
            }
            if journal.remove(&path)? {
                removed += 1;
            }
        }
    }
    if removed > 0 {
        journal.remove_empty_dir(&dir)?;
    }
    Ok(removed)
}

/// Whether the `.bin` entry at `entry` runs something inside `package`.
fn entry_points_into(entry: &Path, dir: &Path, package: &Path, style: ShimStyle) -> bool {
    match style {
        ShimStyle::Symlink => read_link_target(entry).is_ok_and(|t| t.starts_with(package)),
        ShimStyle::Windows => {
            let Ok(body) = std::fs::read_to_string(entry) else {
                return false;
            };
            let rel = to_slash(&relative_path(dir, package));
            body.contains(&format!("%~dp0\\{}\\", rel.replace('/', "\\")))
                || body.contains(&format!("$PSScriptRoot/{rel}/"))
        }
    }
}

#[cfg(unix)]
fn link_symlink(journal: &mut Journal, target: &Path, link_path: &Path) -> Result<bool, PkgError> {
    journal.link_file(target, link_path)
}

#[cfg(not(unix))]
fn link_symlink(_: &mut Journal, _: &Path, link_path: &Path) -> Result<bool, PkgError> {
    Err(PkgError::Link(format!(
        "symlinked bins are not supported on this platform: {}",
        link_path.display()
    )))
}

#[cfg(unix)]
fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let Ok(meta) = std::fs::metadata(path) else {
        return;
    };
    let mode = meta.permissions().mode();
    if mode & 0o111 != 0o111 {
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode | 0o111)) {
            tracing::warn!(path = %path.display(), error = %e, "failed to mark bin executable");
        }
    }
}

#[cfg(not(unix))]
fn make_executable(_: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::manifest::Bin;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::tempdir;

    fn tool(bins: &[(&str, &str)]) -> Manifest {
        Manifest {
            name: Some("tool".into()),
            bin: Some(Bin::Map(
                bins.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect::<BTreeMap<_, _>>(),
            )),
            ..Manifest::default()
        }
    }

    fn setup(root: &Path) -> (PathBuf, PathBuf) {
        let node_modules = root.join("node_modules");
        let pkg = node_modules.join("tool");
        fs::create_dir_all(pkg.join("bin")).unwrap();
        fs::write(pkg.join("bin/cli.js"), "#!/usr/bin/env node\n").unwrap();
        (node_modules, pkg)
    }

    #[test]
    fn test_validate_bin_name() {
        assert!(validate_bin_name("tsc").is_ok());
        assert!(validate_bin_name("").is_err());
        assert!(validate_bin_name("..").is_err());
        assert!(validate_bin_name("../evil").is_err());
        assert!(validate_bin_name("a\\b").is_err());
    }

    #[test]
    fn test_windows_shims_written_and_removed_in_pairs() {
        let dir = tempdir().unwrap();
        let (node_modules, pkg) = setup(dir.path());
        let manifest = tool(&[("tool", "bin/cli.js")]);

        let mut journal = Journal::new(dir.path());
        assert_eq!(
            link_bins(&mut journal, &node_modules, &pkg, &manifest, ShimStyle::Windows).unwrap(),
            1
        );
        let cmd = fs::read_to_string(node_modules.join(".bin/tool.cmd")).unwrap();
        assert!(cmd.contains("%~dp0\\..\\tool\\bin\\cli.js"));
        let ps1 = fs::read_to_string(node_modules.join(".bin/tool.ps1")).unwrap();
        assert!(ps1.contains("$PSScriptRoot/../tool/bin/cli.js"));

        // Second pass changes nothing
        assert_eq!(
            link_bins(&mut journal, &node_modules, &pkg, &manifest, ShimStyle::Windows).unwrap(),
            0
        );

        assert_eq!(
            unlink_bins(&mut journal, &node_modules, &pkg, &manifest, ShimStyle::Windows).unwrap(),
            2
        );
        assert!(!node_modules.join(".bin").exists());
        journal.commit();
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_bins() {
        let dir = tempdir().unwrap();
        let (node_modules, pkg) = setup(dir.path());
        let manifest = tool(&[("tool", "bin/cli.js")]);

        let mut journal = Journal::new(dir.path());
        link_bins(&mut journal, &node_modules, &pkg, &manifest, ShimStyle::Symlink).unwrap();

        let link_path = node_modules.join(".bin/tool");
        assert_eq!(fs::read_link(&link_path).unwrap(), PathBuf::from("../tool/bin/cli.js"));
        assert_eq!(unlink_bins(&mut journal, &node_modules, &pkg, &manifest, ShimStyle::Symlink).unwrap(), 1);
        // Only the symlink is touched
        assert!(pkg.join("bin/cli.js").exists());
        journal.commit();
    }

    fn second_tool(node_modules: &Path) -> PathBuf {
        let other = node_modules.join("other");
        fs::create_dir_all(other.join("bin")).unwrap();
        fs::write(other.join("bin/cli.js"), "#!/usr/bin/env node\n").unwrap();
        other
    }

    #[test]
    fn test_shared_bin_name_kept_for_last_linked_owner() {
        for style in [ShimStyle::Windows, ShimStyle::Symlink] {
            if style == ShimStyle::Symlink && !cfg!(unix) {
                continue;
            }
            let dir = tempdir().unwrap();
            let (node_modules, pkg) = setup(dir.path());
            let other = second_tool(&node_modules);
            let manifest = tool(&[("tool", "bin/cli.js")]);

            let mut journal = Journal::new(dir.path());
            link_bins(&mut journal, &node_modules, &pkg, &manifest, style).unwrap();
            link_bins(&mut journal, &node_modules, &other, &manifest, style).unwrap();

            // "other" took the name over, so removing "tool" leaves it alone
            assert_eq!(
                unlink_bins(&mut journal, &node_modules, &pkg, &manifest, style).unwrap(),
                0
            );
            for path in style.paths(&bin_dir(&node_modules), "tool") {
                assert!(path.symlink_metadata().is_ok(), "{}", path.display());
            }

            let removed = unlink_bins(&mut journal, &node_modules, &other, &manifest, style).unwrap();
            assert_eq!(removed, style.paths(&node_modules, "tool").len());
            assert!(!node_modules.join(".bin").exists());
            journal.commit();
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_read_only_bin_target_still_links() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let (node_modules, pkg) = setup(dir.path());
        let cli = pkg.join("bin/cli.js");
        fs::set_permissions(&cli, fs::Permissions::from_mode(0o644)).unwrap();

        let mut journal = Journal::new(dir.path());
        let manifest = tool(&[("tool", "bin/cli.js")]);
        link_bins(&mut journal, &node_modules, &pkg, &manifest, ShimStyle::Symlink).unwrap();
        let mode = fs::metadata(&cli).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        journal.commit();
    }

    #[test]
    fn test_bad_bin_name_is_an_error() {
        let dir = tempdir().unwrap();
        let (node_modules, pkg) = setup(dir.path());
        let manifest = tool(&[("../escape", "bin/cli.js")]);

        let mut journal = Journal::new(dir.path());
        let err = link_bins(&mut journal, &node_modules, &pkg, &manifest, ShimStyle::Windows).unwrap_err();
        assert_eq!(err.code(), crate::pkg::error::codes::PKG_LINK_FAILED);
        journal.rollback().unwrap();
    }

    #[test]
    fn test_bin_outside_package_rejected() {
        let dir = tempdir().unwrap();
        let (node_modules, pkg) = setup(dir.path());
        let manifest = tool(&[("tool", "../../etc/passwd")]);

        let mut journal = Journal::new(dir.path());
        assert!(link_bins(&mut journal, &node_modules, &pkg, &manifest, ShimStyle::Windows).is_err());
    }
}
