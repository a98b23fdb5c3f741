//! Lockfile codec.
//!
//! `vlt-lock.json` records a built graph compactly:
//!
//! ```json
//! {
//!   "registries": { "acme": "https://npm.acme.test/" },
//!   "nodes": {
//!     "··lodash@4.17.21": ["lodash", "sha512-…", "https://…/lodash-4.17.21.tgz", { "name": "lodash", … }]
//!   },
//!   "edges": [
//!     ["file·.", "prod", "lodash@^4", "··lodash@4.17.21"]
//!   ]
//! }
//! ```
//!
//! A node entry is `[name, integrity?, resolved?, manifestSubset?]` with
//! trailing absent fields dropped. Importers are recorded by name only. An
//! edge is `[from, type, "name@spec", to | null]`; `null` marks a missing
//! dependency.

use super::depid::{DepId, DepIdTuple};
use super::error::PkgError;
use super::graph::{DepType, Graph, Node};
use super::manifest::Manifest;
use crate::config::Config;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Lockfile filename.
pub const LOCKFILE_NAME: &str = "vlt-lock.json";

/// Lockfile error codes.
pub mod codes {
    pub const PKG_LOCK_INVALID_JSON: &str = "PKG_LOCK_INVALID_JSON";
    pub const PKG_LOCK_INVALID_NODE: &str = "PKG_LOCK_INVALID_NODE";
    pub const PKG_LOCK_INVALID_EDGE: &str = "PKG_LOCK_INVALID_EDGE";
    pub const PKG_LOCK_WRITE_FAILED: &str = "PKG_LOCK_WRITE_FAILED";
}

/// Errors reading or writing a lockfile.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockfileError {
    #[error("Invalid lockfile JSON: {0}")]
    InvalidJson(String),

    #[error("Invalid lockfile node '{id}': {reason}")]
    InvalidNode { id: String, reason: String },

    #[error("Invalid lockfile edge #{index}: {reason}")]
    InvalidEdge { index: usize, reason: String },

    #[error("Failed to write lockfile {}: {message}", path.display())]
    Write { path: PathBuf, message: String },
}

impl LockfileError {
    /// Get the stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => codes::PKG_LOCK_INVALID_JSON,
            Self::InvalidNode { .. } => codes::PKG_LOCK_INVALID_NODE,
            Self::InvalidEdge { .. } => codes::PKG_LOCK_INVALID_EDGE,
            Self::Write { .. } => codes::PKG_LOCK_WRITE_FAILED,
        }
    }
}

impl From<LockfileError> for PkgError {
    fn from(e: LockfileError) -> Self {
        PkgError::Lockfile(e.to_string())
    }
}

/// `[from, type, "name@spec", to]`
type EdgeRow = (String, String, String, Option<String>);

#[derive(Debug, Default, Serialize, Deserialize)]
struct LockfileData {
    #[serde(default)]
    registries: BTreeMap<String, String>,
    #[serde(default)]
    nodes: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    edges: Vec<EdgeRow>,
}

/// Path of the lockfile for a project.
#[must_use]
pub fn lockfile_path(project_root: &Path) -> PathBuf {
    project_root.join(LOCKFILE_NAME)
}

/// Serialize a graph. Output is deterministic: nodes and edges are ordered
/// by id, then dependency name.
#[must_use]
pub fn save(graph: &Graph, config: &Config) -> String {
    let mut data = LockfileData {
        registries: config.registries.clone(),
        ..LockfileData::default()
    };

    for node in graph.nodes() {
        data.nodes.insert(node.id.to_string(), node_row(node));
    }
    for edge in graph.edges() {
        data.edges.push((
            edge.from.to_string(),
            edge.dep_type.as_str().to_string(),
            format!("{}@{}", edge.name, edge.spec),
            edge.to.as_ref().map(ToString::to_string),
        ));
    }

    // Plain strings, maps and vectors always serialize.
    let mut out = serde_json::to_string_pretty(&data).unwrap_or_default();
    out.push('\n');
    out
}

fn node_row(node: &Node) -> Vec<Value> {
    let subset = if node.importer {
        None
    } else {
        node.manifest
            .as_ref()
            .and_then(|m| serde_json::to_value(m.subset()).ok())
    };

    let mut row = vec![
        Value::String(node.name.clone()),
        node.integrity.clone().map_or(Value::Null, Value::String),
        node.resolved.clone().map_or(Value::Null, Value::String),
        subset.unwrap_or(Value::Null),
    ];
    while row.len() > 1 && row.last().is_some_and(Value::is_null) {
        row.pop();
    }
    row
}

/// Parse a lockfile back into a graph.
///
/// The main importer carries only its name; callers that need its manifest
/// read `package.json`. Workspace entries become importers.
///
/// # Errors
/// Returns an error for invalid JSON, malformed ids, or edges that name
/// unknown nodes.
pub fn load(text: &str) -> Result<Graph, LockfileError> {
    let data: LockfileData =
        serde_json::from_str(text).map_err(|e| LockfileError::InvalidJson(e.to_string()))?;

    let main = DepId::main_importer();
    let main_name = data
        .nodes
        .get(main.as_str())
        .and_then(|row| row.first())
        .and_then(Value::as_str)
        .map(str::to_string);
    let mut graph = Graph::new(Manifest {
        name: main_name,
        ..Manifest::default()
    });

    for (key, row) in &data.nodes {
        let id = DepId::parse(key).map_err(|e| invalid_node(key, e.to_string()))?;
        if id == main {
            continue;
        }
        let name = field_str(row, 0)
            .ok_or_else(|| invalid_node(key, "missing package name"))?
            .to_string();

        if let DepIdTuple::Workspace { path } = id.tuple() {
            let manifest = Manifest {
                name: Some(name),
                ..Manifest::default()
            };
            let location = path.clone();
            graph.add_importer(id, manifest, location);
            continue;
        }

        let manifest = match row.get(3) {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                serde_json::from_value::<Manifest>(value.clone())
                    .map_err(|e| invalid_node(key, format!("invalid manifest: {e}")))?,
            ),
        };
        let node = graph.add_node(id, &name, manifest, None);
        node.integrity = field_str(row, 1).map(str::to_string);
        node.resolved = field_str(row, 2).map(str::to_string);
    }

    for (index, (from, dep_type, spec, to)) in data.edges.iter().enumerate() {
        let bad = |reason: String| LockfileError::InvalidEdge { index, reason };
        let from = DepId::parse(from).map_err(|e| bad(e.to_string()))?;
        let to = to
            .as_deref()
            .map(DepId::parse)
            .transpose()
            .map_err(|e| bad(e.to_string()))?;
        let dep_type = DepType::parse(dep_type).ok_or_else(|| bad(format!("unknown type '{dep_type}'")))?;
        let (name, spec) = split_edge_spec(spec).ok_or_else(|| bad(format!("invalid spec '{spec}'")))?;

        graph
            .add_edge(dep_type, spec, &from, name, to.as_ref())
            .map_err(|e| bad(e.to_string()))?;
    }

    graph.classify();
    Ok(graph)
}

/// Read the project's lockfile. `Ok(None)` when there is none.
///
/// # Errors
/// Returns an error if the file exists but cannot be read or parsed.
pub fn read(project_root: &Path) -> Result<Option<Graph>, LockfileError> {
    let path = lockfile_path(project_root);
    match fs::read_to_string(&path) {
        Ok(text) => load(&text).map(Some),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LockfileError::InvalidJson(format!(
            "Failed to read {}: {e}",
            path.display()
        ))),
    }
}

/// Write the project's lockfile atomically.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write(project_root: &Path, graph: &Graph, config: &Config) -> Result<(), LockfileError> {
    let path = lockfile_path(project_root);
    vlt_util::fs::atomic_write(&path, save(graph, config).as_bytes()).map_err(|e| LockfileError::Write {
        path: path.clone(),
        message: e.to_string(),
    })
}

fn invalid_node(id: &str, reason: impl Into<String>) -> LockfileError {
    LockfileError::InvalidNode {
        id: id.to_string(),
        reason: reason.into(),
    }
}

fn field_str(row: &[Value], index: usize) -> Option<&str> {
    row.get(index).and_then(Value::as_str)
}

/// Split `name@spec`, respecting a scope. The spec may be empty.
fn split_edge_spec(s: &str) -> Option<(&str, &str)> {
    let search_from = usize::from(s.starts_with('@'));
    let at = s[search_from..].find('@')? + search_from;
    let name = &s[..at];
    if name.is_empty() || name == "@" {
        return None;
    }
    Some((name, &s[at + 1..]))
}
