use crate::version::SCHEMA_VERSION;
use std::path::{Component, Path, PathBuf};

/// Name of the per-project install directory.
pub const NODE_MODULES: &str = "node_modules";

/// Name of the content-addressed store directory inside `node_modules`.
pub const STORE_DIR: &str = ".vlt";

/// Name of the executable link directory inside `node_modules`.
pub const BIN_DIR: &str = ".bin";

/// Find the project root by walking up from `cwd` looking for `package.json` or `.git`.
///
/// Returns the first directory containing either marker, or `None` if neither is found.
#[must_use]
pub fn project_root(cwd: &Path) -> Option<PathBuf> {
    let mut current = cwd.to_path_buf();

    loop {
        if current.join("package.json").exists() || current.join(".git").exists() {
            return Some(current);
        }

        if !current.pop() {
            return None;
        }
    }
}

/// Get the cache directory for vlt.
///
/// Uses platform-appropriate locations with versioning:
/// - Linux: `$XDG_CACHE_HOME/vlt/v{N}` or `~/.cache/vlt/v{N}`
/// - macOS: `~/Library/Caches/vlt/v{N}`
/// - Windows: `%LOCALAPPDATA%\vlt\v{N}`
#[must_use]
pub fn cache_dir() -> PathBuf {
    let base = dirs_next::cache_dir().map_or_else(
        || {
            dirs_next::home_dir().map_or_else(
                || PathBuf::from(".vlt-cache"),
                |p| p.join(".cache").join("vlt"),
            )
        },
        |p| p.join("vlt"),
    );

    base.join(format!("v{SCHEMA_VERSION}"))
}

/// `<project>/node_modules/.vlt`
#[must_use]
pub fn store_root(project_root: &Path) -> PathBuf {
    project_root.join(NODE_MODULES).join(STORE_DIR)
}

/// Directory owning one store entry: `<project>/node_modules/.vlt/<dep-id>`.
#[must_use]
pub fn store_entry_dir(project_root: &Path, dep_id: &str) -> PathBuf {
    store_root(project_root).join(dep_id)
}

/// Where a store entry's package content lives:
/// `<project>/node_modules/.vlt/<dep-id>/node_modules/<name>`.
///
/// Keeping the package inside its own `node_modules` lets the entry's
/// dependencies be linked as siblings.
#[must_use]
pub fn store_package_dir(project_root: &Path, dep_id: &str, name: &str) -> PathBuf {
    package_path(&store_entry_dir(project_root, dep_id).join(NODE_MODULES), name)
}

/// Join a possibly-scoped package name onto a `node_modules` directory.
#[must_use]
pub fn package_path(node_modules: &Path, name: &str) -> PathBuf {
    name.split('/')
        .fold(node_modules.to_path_buf(), |acc, part| acc.join(part))
}

/// Convert a path to a forward-slash relative string, as stored in lockfiles.
#[must_use]
pub fn to_slash(path: &Path) -> String {
    let s = path.to_string_lossy().replace('\\', "/");
    if s.is_empty() {
        ".".to_string()
    } else {
        s
    }
}

/// Compute `to` relative to the directory `from`. Both must be absolute or
/// both relative to the same base.
#[must_use]
pub fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from: Vec<_> = from.components().collect();
    let to_parts: Vec<_> = to.components().collect();
    let common = from
        .iter()
        .zip(to_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..from.len() {
        rel.push("..");
    }
    for part in &to_parts[common..] {
        rel.push(part.as_os_str());
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    rel
}

/// Resolve `.` and `..` components lexically, without touching the disk.
///
/// A `..` that would climb above a relative path's start is kept.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}
