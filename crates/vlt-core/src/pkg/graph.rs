//! In-memory dependency graph.
//!
//! Nodes live in an arena keyed by [`DepId`]; edges refer to nodes by id, so
//! removing a node never leaves a dangling reference. Every structural change
//! goes through [`Graph::add_node`], [`Graph::add_edge`], [`Graph::remove_edge`]
//! or [`Graph::remove_node`], which keep the `edges_in`/`edges_out` indexes,
//! the flat edge set and the missing/extraneous sets consistent.

use super::depid::DepId;
use super::error::PkgError;
use super::manifest::Manifest;
use crate::paths::{NODE_MODULES, STORE_DIR};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// How a dependency was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepType {
    Prod,
    Dev,
    Optional,
    Peer,
}

impl DepType {
    pub const ALL: [Self; 4] = [Self::Prod, Self::Dev, Self::Optional, Self::Peer];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prod => "prod",
            Self::Dev => "dev",
            Self::Optional => "optional",
            Self::Peer => "peer",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prod" => Some(Self::Prod),
            "dev" => Some(Self::Dev),
            "optional" => Some(Self::Optional),
            "peer" => Some(Self::Peer),
            _ => None,
        }
    }
}

impl fmt::Display for DepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies an edge: one outgoing edge per dependency name per node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeKey {
    pub from: DepId,
    pub name: String,
}

/// A dependency relationship. `to == None` means the dependency is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: DepId,
    pub name: String,
    pub dep_type: DepType,
    pub spec: String,
    pub to: Option<DepId>,
}

impl Edge {
    #[must_use]
    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            from: self.from.clone(),
            name: self.name.clone(),
        }
    }

    #[must_use]
    pub fn is_missing(&self) -> bool {
        self.to.is_none()
    }
}

/// One resolved package instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: DepId,
    pub name: String,
    pub version: Option<String>,
    /// Absent for "bare" nodes found on disk without a readable manifest.
    pub manifest: Option<Manifest>,
    /// Slash-separated path relative to the project root.
    pub location: String,
    pub importer: bool,
    pub main_importer: bool,
    pub dev: bool,
    pub optional: bool,
    pub resolved: Option<String>,
    pub integrity: Option<String>,
    pub edges_out: BTreeMap<String, Edge>,
    pub edges_in: BTreeSet<EdgeKey>,
}

impl Node {
    fn new(id: DepId, name: String, manifest: Option<Manifest>, location: String) -> Self {
        let version = manifest
            .as_ref()
            .and_then(|m| m.version.clone())
            .or_else(|| id.version().map(str::to_string));
        Self {
            id,
            name,
            version,
            manifest,
            location,
            importer: false,
            main_importer: false,
            dev: false,
            optional: false,
            resolved: None,
            integrity: None,
            edges_out: BTreeMap::new(),
            edges_in: BTreeSet::new(),
        }
    }

    /// `name@version`, or just the name when the version is unknown.
    #[must_use]
    pub fn display_name(&self) -> String {
        match &self.version {
            Some(v) => format!("{}@{v}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Where a store node lives relative to the project root.
#[must_use]
pub fn store_location(id: &DepId, name: &str) -> String {
    format!("{NODE_MODULES}/{STORE_DIR}/{}/{NODE_MODULES}/{name}", id.as_str())
}

/// The dependency graph.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: BTreeMap<DepId, Node>,
    edges: BTreeSet<EdgeKey>,
    by_name: BTreeMap<String, BTreeSet<DepId>>,
    importers: BTreeSet<DepId>,
    main_importer: DepId,
    missing: BTreeSet<EdgeKey>,
    extraneous: BTreeSet<DepId>,
}

impl Graph {
    /// Create a graph holding only the main importer.
    #[must_use]
    pub fn new(main_manifest: Manifest) -> Self {
        let main = DepId::main_importer();
        let name = main_manifest
            .name
            .clone()
            .unwrap_or_else(|| "(root)".to_string());
        let mut node = Node::new(main.clone(), name.clone(), Some(main_manifest), ".".into());
        node.importer = true;
        node.main_importer = true;

        Self {
            nodes: BTreeMap::from([(main.clone(), node)]),
            edges: BTreeSet::new(),
            by_name: BTreeMap::from([(name, BTreeSet::from([main.clone()]))]),
            importers: BTreeSet::from([main.clone()]),
            main_importer: main,
            missing: BTreeSet::new(),
            extraneous: BTreeSet::new(),
        }
    }

    /// Add a workspace member importer. Returns the existing node if the id
    /// is already present.
    pub fn add_importer(&mut self, id: DepId, manifest: Manifest, location: String) -> &mut Node {
        let name = manifest.name.clone().unwrap_or_else(|| location.clone());
        self.extraneous.remove(&id);
        self.importers.insert(id.clone());
        self.by_name
            .entry(name.clone())
            .or_default()
            .insert(id.clone());
        self.nodes.entry(id.clone()).or_insert_with(|| {
            let mut node = Node::new(id, name, Some(manifest), location);
            node.importer = true;
            node
        })
    }

    /// Add a package node, deduplicating by id. A node added again keeps its
    /// first placement but gains a manifest if it had none.
    pub fn add_node(
        &mut self,
        id: DepId,
        name: &str,
        manifest: Option<Manifest>,
        location: Option<String>,
    ) -> &mut Node {
        match self.nodes.entry(id) {
            Entry::Occupied(entry) => {
                let node = entry.into_mut();
                if node.manifest.is_none() {
                    if let Some(version) = manifest.as_ref().and_then(|m| m.version.clone()) {
                        node.version = Some(version);
                    }
                    node.manifest = manifest;
                }
                node
            }
            Entry::Vacant(entry) => {
                let id = entry.key().clone();
                let location = location.unwrap_or_else(|| store_location(&id, name));
                self.by_name
                    .entry(name.to_string())
                    .or_default()
                    .insert(id.clone());
                self.extraneous.insert(id.clone());
                entry.insert(Node::new(id, name.to_string(), manifest, location))
            }
        }
    }

    /// Add or replace the edge `from -> name`. The previous edge with that
    /// name, if any, is removed first (last write wins).
    ///
    /// # Errors
    /// Returns an error if `from` or `to` is not in the graph.
    pub fn add_edge(
        &mut self,
        dep_type: DepType,
        spec: &str,
        from: &DepId,
        name: &str,
        to: Option<&DepId>,
    ) -> Result<&Edge, PkgError> {
        if !self.nodes.contains_key(from) {
            return Err(PkgError::NotFound(format!("edge source {from}")));
        }
        if let Some(to) = to {
            if !self.nodes.contains_key(to) {
                return Err(PkgError::NotFound(format!("edge target {to}")));
            }
        }

        self.remove_edge(from, name);

        let edge = Edge {
            from: from.clone(),
            name: name.to_string(),
            dep_type,
            spec: spec.to_string(),
            to: to.cloned(),
        };
        let key = edge.key();

        match to {
            Some(to) => {
                if let Some(target) = self.nodes.get_mut(to) {
                    target.edges_in.insert(key.clone());
                }
                self.extraneous.remove(to);
            }
            None => {
                self.missing.insert(key.clone());
            }
        }
        self.edges.insert(key);

        let source = self
            .nodes
            .get_mut(from)
            .ok_or_else(|| PkgError::NotFound(format!("edge source {from}")))?;
        source.edges_out.insert(name.to_string(), edge);
        source
            .edges_out
            .get(name)
            .ok_or_else(|| PkgError::NotFound(format!("edge {from} -> {name}")))
    }

    /// Remove the edge `from -> name`, returning it.
    pub fn remove_edge(&mut self, from: &DepId, name: &str) -> Option<Edge> {
        let edge = self.nodes.get_mut(from)?.edges_out.remove(name)?;
        let key = edge.key();
        self.edges.remove(&key);
        self.missing.remove(&key);

        if let Some(to) = &edge.to {
            if let Some(target) = self.nodes.get_mut(to) {
                target.edges_in.remove(&key);
                if target.edges_in.is_empty() && !target.importer {
                    self.extraneous.insert(to.clone());
                }
            }
        }
        Some(edge)
    }

    /// Remove a node. Incoming edges are repointed at `replacement` when one
    /// is given, and otherwise become missing. Importers cannot be removed.
    pub fn remove_node(&mut self, id: &DepId, replacement: Option<&DepId>) -> Option<Node> {
        if self.importers.contains(id) {
            return None;
        }
        let replacement = replacement.filter(|r| *r != id && self.nodes.contains_key(*r));

        let names: Vec<String> = self.nodes.get(id)?.edges_out.keys().cloned().collect();
        for name in names {
            self.remove_edge(id, &name);
        }

        let incoming: Vec<EdgeKey> = self.nodes.get(id)?.edges_in.iter().cloned().collect();
        for key in incoming {
            let Some(edge) = self.remove_edge(&key.from, &key.name) else {
                continue;
            };
            // Both endpoints are known to exist, so re-adding cannot fail.
            let _ = self.add_edge(edge.dep_type, &edge.spec, &key.from, &key.name, replacement);
        }

        let node = self.nodes.remove(id)?;
        self.extraneous.remove(id);
        if let Some(ids) = self.by_name.get_mut(&node.name) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_name.remove(&node.name);
            }
        }
        Some(node)
    }

    #[must_use]
    pub fn node(&self, id: &DepId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &DepId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    #[must_use]
    pub fn contains(&self, id: &DepId) -> bool {
        self.nodes.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes with the given package name.
    pub fn nodes_named<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a Node> + 'a {
        self.by_name
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|id| self.nodes.get(id))
    }

    #[must_use]
    pub fn edge(&self, from: &DepId, name: &str) -> Option<&Edge> {
        self.nodes.get(from)?.edges_out.get(name)
    }

    /// All edges, ordered by source id then dependency name.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter_map(|k| self.edge(&k.from, &k.name))
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    #[must_use]
    pub fn importers(&self) -> &BTreeSet<DepId> {
        &self.importers
    }

    #[must_use]
    pub fn main_importer_id(&self) -> &DepId {
        &self.main_importer
    }

    /// The root project node. Only absent if the graph was built by hand
    /// without one, which [`Graph::new`] never does.
    #[must_use]
    pub fn main_importer(&self) -> Option<&Node> {
        self.nodes.get(&self.main_importer)
    }

    /// Edges whose target could not be resolved.
    pub fn missing_dependencies(&self) -> impl Iterator<Item = &Edge> {
        self.missing.iter().filter_map(|k| self.edge(&k.from, &k.name))
    }

    /// Non-importer nodes with no incoming edge.
    #[must_use]
    pub fn extraneous_dependencies(&self) -> &BTreeSet<DepId> {
        &self.extraneous
    }

    /// Recompute the `dev` and `optional` flags from reachability.
    ///
    /// A node is `dev` when every path from an importer goes through a dev
    /// edge, and `optional` when every path goes through an optional edge.
    /// Unreachable nodes carry neither flag.
    pub fn classify(&mut self) {
        let reachable = self.reach(|_| true);
        let via_prod = self.reach(|t| t != DepType::Dev);
        let via_required = self.reach(|t| t != DepType::Optional);

        for (id, node) in &mut self.nodes {
            if node.importer || !reachable.contains(id) {
                node.dev = false;
                node.optional = false;
                continue;
            }
            node.dev = !via_prod.contains(id);
            node.optional = !via_required.contains(id);
        }
    }

    fn reach(&self, follow: impl Fn(DepType) -> bool) -> BTreeSet<DepId> {
        let mut seen: BTreeSet<DepId> = BTreeSet::new();
        let mut queue: VecDeque<&DepId> = self.importers.iter().collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            for edge in node.edges_out.values() {
                if let Some(to) = &edge.to {
                    if follow(edge.dep_type) && !seen.contains(to) {
                        queue.push_back(to);
                    }
                }
            }
        }
        seen
    }
}
