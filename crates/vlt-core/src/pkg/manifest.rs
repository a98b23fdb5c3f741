//! `package.json` manifests.
//!
//! Only the fields the resolver and reifier need are typed; everything else
//! is carried through `extra` untouched.

use super::error::PkgError;
use super::graph::DepType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Manifest file name.
pub const MANIFEST_NAME: &str = "package.json";

/// `bin` is either a single path (named after the package) or a map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Bin {
    Single(String),
    Map(BTreeMap<String, String>),
}

/// `workspaces` is either a list of globs or `{ "packages": [...] }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Workspaces {
    List(Vec<String>),
    Object {
        #[serde(default)]
        packages: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMeta {
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dist {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tarball: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shasum: Option<String>,
}

/// A parsed `package.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_dependencies_meta: BTreeMap<String, PeerMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<Bin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist: Option<Dist>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspaces: Option<Workspaces>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Manifest {
    /// Read `package.json` from a package directory.
    ///
    /// # Errors
    /// Returns `NotFound` if the file is absent, `ManifestInvalid` if it does not parse.
    pub fn read_dir(dir: &Path) -> Result<Self, PkgError> {
        Self::read(&dir.join(MANIFEST_NAME))
    }

    /// Read a manifest file.
    ///
    /// # Errors
    /// Returns `NotFound` if the file is absent, `ManifestInvalid` if it does not parse.
    pub fn read(path: &Path) -> Result<Self, PkgError> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PkgError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(PkgError::io(path, e)),
        };
        Self::from_slice(&bytes).map_err(|e| PkgError::manifest_invalid(path, e))
    }

    /// Parse manifest bytes.
    ///
    /// # Errors
    /// Returns the JSON error message if the bytes are not a manifest object.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(bytes).map_err(|e| format!("Invalid JSON: {e}"))
    }

    /// Dependency maps in the order they are resolved. A name that appears
    /// in more than one map is governed by the last one.
    pub fn dep_maps(&self) -> [(DepType, &BTreeMap<String, String>); 4] {
        [
            (DepType::Prod, &self.dependencies),
            (DepType::Dev, &self.dev_dependencies),
            (DepType::Optional, &self.optional_dependencies),
            (DepType::Peer, &self.peer_dependencies),
        ]
    }

    /// Flattened dependencies, last map wins per name.
    #[must_use]
    pub fn declared_deps(&self) -> BTreeMap<String, (DepType, String)> {
        let mut out = BTreeMap::new();
        for (dep_type, map) in self.dep_maps() {
            for (name, bare) in map {
                out.insert(name.clone(), (dep_type, bare.clone()));
            }
        }
        out
    }

    /// Whether a peer dependency is marked optional.
    #[must_use]
    pub fn peer_is_optional(&self, name: &str) -> bool {
        self.peer_dependencies_meta
            .get(name)
            .is_some_and(|m| m.optional)
    }

    fn map_mut(&mut self, dep_type: DepType) -> &mut BTreeMap<String, String> {
        match dep_type {
            DepType::Prod => &mut self.dependencies,
            DepType::Dev => &mut self.dev_dependencies,
            DepType::Optional => &mut self.optional_dependencies,
            DepType::Peer => &mut self.peer_dependencies,
        }
    }

    /// Declare a dependency, removing the name from every other map first.
    pub fn set_dependency(&mut self, dep_type: DepType, name: &str, bare: &str) {
        self.remove_dependency(name);
        self.map_mut(dep_type)
            .insert(name.to_string(), bare.to_string());
    }

    /// Remove a dependency from every map. Returns whether it was declared.
    pub fn remove_dependency(&mut self, name: &str) -> bool {
        let mut removed = false;
        for dep_type in DepType::ALL {
            removed |= self.map_mut(dep_type).remove(name).is_some();
        }
        self.peer_dependencies_meta.remove(name);
        removed
    }

    /// Executables this package exposes, keyed by command name.
    #[must_use]
    pub fn bins(&self) -> BTreeMap<String, String> {
        match &self.bin {
            Some(Bin::Map(map)) => map.clone(),
            Some(Bin::Single(path)) => match &self.name {
                Some(name) => {
                    let cmd = name.rsplit('/').next().unwrap_or(name);
                    BTreeMap::from([(cmd.to_string(), path.clone())])
                }
                None => BTreeMap::new(),
            },
            None => BTreeMap::new(),
        }
    }

    /// Workspace globs declared by this manifest.
    #[must_use]
    pub fn workspace_patterns(&self) -> &[String] {
        match &self.workspaces {
            Some(Workspaces::List(list)) => list,
            Some(Workspaces::Object { packages }) => packages,
            None => &[],
        }
    }

    /// The fields a lockfile keeps so a locked build needs no manifest fetch.
    #[must_use]
    pub fn subset(&self) -> Self {
        Self {
            name: self.name.clone(),
            version: self.version.clone(),
            dependencies: self.dependencies.clone(),
            dev_dependencies: BTreeMap::new(),
            optional_dependencies: self.optional_dependencies.clone(),
            peer_dependencies: self.peer_dependencies.clone(),
            peer_dependencies_meta: self.peer_dependencies_meta.clone(),
            bin: self.bin.clone(),
            dist: None,
            workspaces: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Whether the dependency maps of two manifests differ.
    #[must_use]
    pub fn deps_differ(&self, other: &Self) -> bool {
        self.dependencies != other.dependencies
            || self.dev_dependencies != other.dev_dependencies
            || self.optional_dependencies != other.optional_dependencies
            || self.peer_dependencies != other.peer_dependencies
    }
}

/// Rewrite the dependency maps of existing `package.json` bytes, leaving every
/// other key as it was. Returns the new file contents.
///
/// # Errors
/// Returns an error if the existing file is not a JSON object.
pub fn render_with_deps(existing: &[u8], manifest: &Manifest) -> Result<String, String> {
    let mut root: Value = if existing.is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_slice(existing).map_err(|e| format!("Invalid JSON: {e}"))?
    };
    let obj = root
        .as_object_mut()
        .ok_or_else(|| "package.json must be a JSON object".to_string())?;

    for (key, map) in [
        ("dependencies", &manifest.dependencies),
        ("devDependencies", &manifest.dev_dependencies),
        ("optionalDependencies", &manifest.optional_dependencies),
        ("peerDependencies", &manifest.peer_dependencies),
    ] {
        if map.is_empty() {
            obj.shift_remove(key);
        } else {
            let section: serde_json::Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            obj.insert(key.to_string(), Value::Object(section));
        }
    }

    let mut out = serde_json::to_string_pretty(&root).map_err(|e| e.to_string())?;
    out.push('\n');
    Ok(out)
}
