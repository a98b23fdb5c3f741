//! Workspace discovery for monorepos.
//!
//! The root manifest's `workspaces` globs (`packages/*`, `apps/*`) name the
//! directories of sibling importers. Patterns starting with `!` exclude.

use super::context::ManifestCache;
use super::depid::DepId;
use super::error::PkgError;
use super::manifest::{Manifest, MANIFEST_NAME};
use crate::paths::{relative_path, to_slash};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A workspace member importer.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceMember {
    pub id: DepId,
    /// Slash-separated path relative to the project root.
    pub location: String,
    pub manifest: Manifest,
}

impl WorkspaceMember {
    /// The member's package name, falling back to its location.
    #[must_use]
    pub fn name(&self) -> &str {
        self.manifest.name.as_deref().unwrap_or(&self.location)
    }
}

/// Expand the root manifest's workspace globs into members, ordered by location.
///
/// Matched directories without a `package.json` are skipped.
///
/// # Errors
/// Returns an error if a glob is invalid or a member manifest cannot be parsed.
pub fn discover(
    root: &Path,
    root_manifest: &Manifest,
    manifests: &ManifestCache,
) -> Result<Vec<WorkspaceMember>, PkgError> {
    let mut include: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut exclude: Vec<glob::Pattern> = Vec::new();

    for pattern in root_manifest.workspace_patterns() {
        if let Some(negated) = pattern.strip_prefix('!') {
            let full = root.join(negated.trim_end_matches('/'));
            let compiled = glob::Pattern::new(&full.to_string_lossy())
                .map_err(|e| PkgError::spec_invalid(format!("Invalid workspace pattern '{pattern}': {e}")))?;
            exclude.push(compiled);
            continue;
        }

        let full = root.join(pattern.trim_end_matches('/'));
        let entries = glob::glob(&full.to_string_lossy())
            .map_err(|e| PkgError::spec_invalid(format!("Invalid workspace pattern '{pattern}': {e}")))?;
        for dir in entries.flatten() {
            if !dir.join(MANIFEST_NAME).is_file() || dir == root {
                continue;
            }
            let location = to_slash(&relative_path(root, &dir));
            include.insert(location, dir);
        }
    }

    let mut members = Vec::new();
    for (location, dir) in include {
        if exclude.iter().any(|p| p.matches_path(&dir)) {
            continue;
        }
        let manifest = manifests.load(&dir.join(MANIFEST_NAME))?;
        members.push(WorkspaceMember {
            id: DepId::workspace(&location),
            location,
            manifest,
        });
    }
    Ok(members)
}

/// Find the workspace root by walking up the directory tree.
///
/// Returns the first directory whose `package.json` declares workspaces.
#[must_use]
pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        if let Ok(manifest) = Manifest::read_dir(&current) {
            if manifest.workspaces.is_some() {
                return Some(current);
            }
        }

        if !current.pop() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_pkg(dir: &Path, json: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("package.json"), json).unwrap();
    }

    #[test]
    fn test_discover_array_format() {
        let root = tempdir().unwrap();
        let manifest: Manifest =
            serde_json::from_str(r#"{"name": "monorepo", "workspaces": ["packages/*"]}"#).unwrap();
        write_pkg(
            &root.path().join("packages").join("my-lib"),
            r#"{"name": "@myorg/my-lib", "version": "1.0.0"}"#,
        );
        // Not a package: no manifest
        fs::create_dir_all(root.path().join("packages").join("docs")).unwrap();

        let members = discover(root.path(), &manifest, &ManifestCache::default()).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].location, "packages/my-lib");
        assert_eq!(members[0].name(), "@myorg/my-lib");
        assert_eq!(members[0].id, DepId::workspace("packages/my-lib"));
    }

    #[test]
    fn test_discover_object_format_and_exclusion() {
        let root = tempdir().unwrap();
        let manifest: Manifest = serde_json::from_str(
            r#"{"name": "monorepo", "workspaces": {"packages": ["packages/*", "!packages/private"]}}"#,
        )
        .unwrap();
        write_pkg(&root.path().join("packages").join("utils"), r#"{"name": "utils"}"#);
        write_pkg(&root.path().join("packages").join("private"), r#"{"name": "private"}"#);

        let members = discover(root.path(), &manifest, &ManifestCache::default()).unwrap();
        let names: Vec<&str> = members.iter().map(WorkspaceMember::name).collect();
        assert_eq!(names, vec!["utils"]);
    }

    #[test]
    fn test_no_workspaces() {
        let root = tempdir().unwrap();
        let manifest = Manifest {
            name: Some("regular-project".into()),
            ..Manifest::default()
        };
        assert!(discover(root.path(), &manifest, &ManifestCache::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_invalid_member_manifest_is_an_error() {
        let root = tempdir().unwrap();
        let manifest: Manifest = serde_json::from_str(r#"{"workspaces": ["packages/*"]}"#).unwrap();
        write_pkg(&root.path().join("packages").join("broken"), "{ nope");
        let err = discover(root.path(), &manifest, &ManifestCache::default()).unwrap_err();
        assert_eq!(err.code(), crate::pkg::error::codes::PKG_MANIFEST_INVALID);
    }

    #[test]
    fn test_find_workspace_root() {
        let root = tempdir().unwrap();
        write_pkg(root.path(), r#"{"name": "monorepo", "workspaces": ["packages/*"]}"#);
        let nested = root.path().join("packages").join("nested").join("deep");
        fs::create_dir_all(&nested).unwrap();

        let found = find_workspace_root(&nested).unwrap();
        assert_eq!(found, root.path());
    }
}
