//! Ideal-versus-actual comparison.
//!
//! Nodes compare by [`DepId`]. Edges compare by `(from, name, to)`; missing
//! edges have nothing on disk and are ignored. A node that is installed but
//! bare (no readable manifest) is treated as absent so reify replaces it.

use super::depid::DepId;
use super::graph::{Edge, Graph};
use std::collections::BTreeSet;

/// An edge as it exists on disk: a link named `name` in `from`'s
/// `node_modules` pointing at `to`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkKey {
    pub from: DepId,
    pub name: String,
    pub to: DepId,
}

impl LinkKey {
    fn of(edge: &Edge) -> Option<Self> {
        Some(Self {
            from: edge.from.clone(),
            name: edge.name.clone(),
            to: edge.to.clone()?,
        })
    }
}

/// The edit script turning the actual graph into the ideal one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    /// Store entries to create.
    pub nodes_add: BTreeSet<DepId>,
    /// Store entries to remove.
    pub nodes_remove: BTreeSet<DepId>,
    /// Store entries present on both sides.
    pub nodes_retain: BTreeSet<DepId>,
    pub edges_add: BTreeSet<LinkKey>,
    pub edges_remove: BTreeSet<LinkKey>,
    pub edges_retain: BTreeSet<LinkKey>,
}

impl Diff {
    /// Compare two graphs. Importers are never added or removed; only their
    /// edges are.
    #[must_use]
    pub fn between(ideal: &Graph, actual: &Graph) -> Self {
        let mut diff = Self::default();

        for node in ideal.nodes().filter(|n| !n.importer) {
            let installed = actual
                .node(&node.id)
                .is_some_and(|a| a.manifest.is_some() || node.manifest.is_none());
            if installed {
                diff.nodes_retain.insert(node.id.clone());
            } else {
                diff.nodes_add.insert(node.id.clone());
            }
        }
        for node in actual.nodes().filter(|n| !n.importer) {
            if !ideal.contains(&node.id) {
                diff.nodes_remove.insert(node.id.clone());
            }
        }

        let ideal_links: BTreeSet<LinkKey> = ideal.edges().filter_map(LinkKey::of).collect();
        let actual_links: BTreeSet<LinkKey> = actual.edges().filter_map(LinkKey::of).collect();
        for link in &ideal_links {
            // A re-added node's links are rebuilt along with it.
            if actual_links.contains(link) && !diff.nodes_add.contains(&link.from) {
                diff.edges_retain.insert(link.clone());
            } else {
                diff.edges_add.insert(link.clone());
            }
        }
        for link in actual_links {
            if !ideal_links.contains(&link) {
                diff.edges_remove.insert(link);
            }
        }
        diff
    }

    /// Whether the graphs already match.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes_add.is_empty()
            && self.nodes_remove.is_empty()
            && self.edges_add.is_empty()
            && self.edges_remove.is_empty()
    }
}

/// Shorthand for [`Diff::between`].
#[must_use]
pub fn diff(ideal: &Graph, actual: &Graph) -> Diff {
    Diff::between(ideal, actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::graph::DepType;
    use crate::pkg::manifest::Manifest;

    fn manifest(name: &str, version: &str) -> Option<Manifest> {
        Some(Manifest {
            name: Some(name.into()),
            version: Some(version.into()),
            ..Manifest::default()
        })
    }

    fn graph(deps: &[(&str, &str)]) -> Graph {
        let mut g = Graph::new(Manifest::default());
        let main = DepId::main_importer();
        for (name, version) in deps {
            let id = DepId::registry("", name, version);
            g.add_node(id.clone(), name, manifest(name, version), None);
            g.add_edge(DepType::Prod, "*", &main, name, Some(&id)).unwrap();
        }
        g
    }

    #[test]
    fn test_identical_graphs_have_empty_diff() {
        let a = graph(&[("lodash", "4.17.21")]);
        let d = diff(&a, &a.clone());
        assert!(d.is_empty());
        assert_eq!(d.nodes_retain.len(), 1);
        assert_eq!(d.edges_retain.len(), 1);
    }

    #[test]
    fn test_swap_package() {
        let ideal = graph(&[("underscore", "1.13.6")]);
        let actual = graph(&[("lodash", "4.17.21")]);
        let d = diff(&ideal, &actual);

        assert_eq!(d.nodes_add, BTreeSet::from([DepId::registry("", "underscore", "1.13.6")]));
        assert_eq!(d.nodes_remove, BTreeSet::from([DepId::registry("", "lodash", "4.17.21")]));
        assert_eq!(d.edges_add.len(), 1);
        assert_eq!(d.edges_remove.len(), 1);
    }

    #[test]
    fn test_repointed_edge() {
        let ideal = graph(&[("a", "2.0.0")]);
        let mut actual = graph(&[("a", "1.0.0")]);
        actual.classify();
        let d = diff(&ideal, &actual);

        let removed: Vec<&LinkKey> = d.edges_remove.iter().collect();
        assert_eq!(removed[0].to, DepId::registry("", "a", "1.0.0"));
        assert_eq!(d.edges_add.iter().next().unwrap().to, DepId::registry("", "a", "2.0.0"));
    }

    #[test]
    fn test_missing_edges_ignored() {
        let mut ideal = graph(&[]);
        ideal
            .add_edge(DepType::Optional, "^1", &DepId::main_importer(), "gone", None)
            .unwrap();
        assert!(diff(&ideal, &graph(&[])).is_empty());
    }

    #[test]
    fn test_bare_installed_node_is_readded() {
        let ideal = graph(&[("a", "1.0.0")]);
        let mut actual = Graph::new(Manifest::default());
        let id = DepId::registry("", "a", "1.0.0");
        actual.add_node(id.clone(), "a", None, None);
        actual
            .add_edge(DepType::Prod, "*", &DepId::main_importer(), "a", Some(&id))
            .unwrap();

        let d = diff(&ideal, &actual);
        assert!(d.nodes_add.contains(&id));
        assert!(d.nodes_remove.is_empty());
        // The importer's link is still valid; only the entry is rebuilt
        assert!(d.edges_add.is_empty());
        assert_eq!(d.edges_retain.len(), 1);
    }
}
