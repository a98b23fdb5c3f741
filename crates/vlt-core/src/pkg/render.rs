//! Human-readable graph output.

use super::depid::DepId;
use super::graph::{DepType, Graph};
use std::collections::BTreeSet;
use std::fmt::Write;

/// Label for an edge whose target could not be resolved.
pub const MISSING_LABEL: &str = "<missing package>";

/// Render the graph as an indented tree, one importer at a time.
///
/// A node already printed on the current path is marked `(cycle)`; one
/// printed elsewhere is marked `(deduped)` and not expanded again.
///
/// ```text
/// app
/// ├── lodash@4.17.21
/// └── ghost@^1 <missing package>
/// ```
#[must_use]
pub fn render_tree(graph: &Graph) -> String {
    let mut out = String::new();
    let mut printed: BTreeSet<DepId> = BTreeSet::new();

    for id in graph.importers() {
        let Some(node) = graph.node(id) else {
            continue;
        };
        let label = if node.main_importer {
            node.display_name()
        } else {
            format!("{} ({})", node.display_name(), node.location)
        };
        let _ = writeln!(out, "{label}");
        let mut path = vec![id.clone()];
        render_children(graph, id, "", &mut path, &mut printed, &mut out);
    }
    out
}

fn render_children(
    graph: &Graph,
    id: &DepId,
    prefix: &str,
    path: &mut Vec<DepId>,
    printed: &mut BTreeSet<DepId>,
    out: &mut String,
) {
    let Some(node) = graph.node(id) else {
        return;
    };
    let count = node.edges_out.len();

    for (i, edge) in node.edges_out.values().enumerate() {
        let last = i + 1 == count;
        let branch = if last { "└── " } else { "├── " };
        let marker = match edge.dep_type {
            DepType::Prod => "",
            DepType::Dev => " (dev)",
            DepType::Optional => " (optional)",
            DepType::Peer => " (peer)",
        };

        let Some(to) = &edge.to else {
            let _ = writeln!(out, "{prefix}{branch}{}@{} {MISSING_LABEL}{marker}", edge.name, edge.spec);
            continue;
        };
        let Some(child) = graph.node(to) else {
            continue;
        };

        let label = if child.name == edge.name {
            child.display_name()
        } else {
            format!("{} -> {}", edge.name, child.display_name())
        };

        if path.contains(to) {
            let _ = writeln!(out, "{prefix}{branch}{label}{marker} (cycle)");
            continue;
        }
        if child.importer || !printed.insert(to.clone()) {
            let note = if child.importer { " (workspace)" } else { " (deduped)" };
            let _ = writeln!(out, "{prefix}{branch}{label}{marker}{note}");
            continue;
        }

        let _ = writeln!(out, "{prefix}{branch}{label}{marker}");
        let child_prefix = format!("{prefix}{}", if last { "    " } else { "│   " });
        path.push(to.clone());
        render_children(graph, to, &child_prefix, path, printed, out);
        path.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::manifest::Manifest;

    fn add(graph: &mut Graph, name: &str, version: &str) -> DepId {
        let id = DepId::registry("", name, version);
        let manifest = Manifest {
            name: Some(name.into()),
            version: Some(version.into()),
            ..Manifest::default()
        };
        graph.add_node(id.clone(), name, Some(manifest), None);
        id
    }

    fn app() -> Graph {
        Graph::new(Manifest {
            name: Some("app".into()),
            version: Some("1.0.0".into()),
            ..Manifest::default()
        })
    }

    #[test]
    fn test_missing_edge_rendered() {
        let mut graph = app();
        let main = DepId::main_importer();
        let lodash = add(&mut graph, "lodash", "4.17.21");
        graph.add_edge(DepType::Prod, "^4", &main, "lodash", Some(&lodash)).unwrap();
        graph.add_edge(DepType::Prod, "^1", &main, "ghost", None).unwrap();

        assert_eq!(
            render_tree(&graph),
            "app@1.0.0\n├── ghost@^1 <missing package>\n└── lodash@4.17.21\n"
        );
    }

    #[test]
    fn test_cycles_and_dedupe_terminate() {
        let mut graph = app();
        let main = DepId::main_importer();
        let a = add(&mut graph, "a", "1.0.0");
        let b = add(&mut graph, "b", "1.0.0");
        graph.add_edge(DepType::Prod, "^1", &main, "a", Some(&a)).unwrap();
        graph.add_edge(DepType::Dev, "^1", &main, "b", Some(&b)).unwrap();
        graph.add_edge(DepType::Prod, "^1", &a, "b", Some(&b)).unwrap();
        graph.add_edge(DepType::Prod, "^1", &b, "a", Some(&a)).unwrap();

        let text = render_tree(&graph);
        assert_eq!(
            text,
            "app@1.0.0\n\
             ├── a@1.0.0\n\
             │   └── b@1.0.0\n\
             │       └── a@1.0.0 (cycle)\n\
             └── b@1.0.0 (dev) (deduped)\n"
        );
    }

    #[test]
    fn test_alias_and_workspace_labels() {
        let mut graph = app();
        let main = DepId::main_importer();
        let ws = DepId::workspace("packages/lib");
        graph.add_importer(
            ws.clone(),
            Manifest {
                name: Some("lib".into()),
                ..Manifest::default()
            },
            "packages/lib".into(),
        );
        let real = add(&mut graph, "real", "2.0.0");
        graph.add_edge(DepType::Prod, "npm:real@^2", &main, "alias", Some(&real)).unwrap();
        graph.add_edge(DepType::Prod, "workspace:*", &main, "lib", Some(&ws)).unwrap();

        let text = render_tree(&graph);
        assert!(text.contains("alias -> real@2.0.0"));
        assert!(text.contains("└── lib (workspace)"));
        assert!(text.contains("lib (packages/lib)\n"));
    }
}
