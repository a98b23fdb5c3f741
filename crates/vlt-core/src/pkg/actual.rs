//! Actual-graph loader.
//!
//! Reconstructs the installed graph from disk. Store entries under
//! `node_modules/.vlt/<dep-id>` become nodes; symlinks in each importer's
//! `node_modules` and in each store entry's own `node_modules` become edges.

use super::context::Context;
use super::depid::DepId;
use super::error::PkgError;
use super::graph::{DepType, Graph};
use super::link::{is_link, read_link_target};
use super::manifest::{Manifest, MANIFEST_NAME};
use super::workspaces::{discover, WorkspaceMember};
use crate::config::Config;
use crate::paths::{normalize, package_path, store_root, to_slash, NODE_MODULES};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Reads an installed project.
pub struct ActualLoader<'a> {
    root: PathBuf,
    config: &'a Config,
    ctx: &'a Context,
}

impl<'a> ActualLoader<'a> {
    #[must_use]
    pub fn new(ctx: &'a Context) -> Self {
        Self {
            root: normalize(ctx.project_root()),
            config: ctx.config(),
            ctx,
        }
    }

    /// Build the graph of what is installed for these importers.
    ///
    /// # Errors
    /// Returns `MalformedId` for an undecodable store entry,
    /// `UnconfiguredRegistry` for an entry from a registry alias that is not
    /// configured, or an I/O error.
    pub fn load(&self, root_manifest: Manifest, workspaces: Vec<WorkspaceMember>) -> Result<Graph, PkgError> {
        let mut graph = Graph::new(root_manifest);
        for member in workspaces {
            graph.add_importer(member.id, member.manifest, member.location);
        }

        let store = self.load_store(&mut graph)?;

        let importers: Vec<DepId> = graph.importers().iter().cloned().collect();
        for id in importers {
            let Some(node) = graph.node(&id) else {
                continue;
            };
            let node_modules = self.root.join(&node.location).join(NODE_MODULES);
            let declared = node.manifest.as_ref().map(Manifest::declared_deps);
            self.load_edges(&mut graph, &id, &node_modules, declared, true)?;
        }

        for (id, node_modules) in store {
            let declared = graph
                .node(&id)
                .and_then(|n| n.manifest.as_ref())
                .map(Manifest::declared_deps);
            self.load_edges(&mut graph, &id, &node_modules, declared, false)?;
        }

        graph.classify();
        info!(
            nodes = graph.len(),
            edges = graph.edge_count(),
            missing = graph.missing_dependencies().count(),
            "loaded actual graph"
        );
        Ok(graph)
    }

    /// Add a node per store entry. Returns each entry's `node_modules`.
    fn load_store(&self, graph: &mut Graph) -> Result<Vec<(DepId, PathBuf)>, PkgError> {
        let store = store_root(&self.root);
        let entries = match fs::read_dir(&store) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PkgError::io(&store, e)),
        };

        let mut names: Vec<String> = Vec::new();
        for entry in entries {
            // Entries can vanish between listing and reading.
            let Ok(entry) = entry else { continue };
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            names.push(name);
        }
        names.sort();

        let mut out = Vec::with_capacity(names.len());
        for entry_name in names {
            let id = DepId::parse(&entry_name)?;
            if let Some(alias) = id.registry_alias() {
                if self.config.registry_url(alias).is_none() {
                    return Err(PkgError::UnconfiguredRegistry {
                        alias: alias.to_string(),
                        id: entry_name,
                    });
                }
            }

            let node_modules = store.join(&entry_name).join(NODE_MODULES);
            let package = match id.name() {
                Some(name) => Some((name.to_string(), package_path(&node_modules, name))),
                None => find_package_dir(&node_modules),
            };
            let (name, manifest) = match &package {
                Some((name, dir)) => (name.clone(), self.read_manifest(dir)),
                None => (entry_name.clone(), None),
            };
            if manifest.is_none() {
                debug!(id = %id, "bare store entry");
            }

            graph.add_node(id.clone(), &name, manifest, None);
            out.push((id, node_modules));
        }
        Ok(out)
    }

    fn read_manifest(&self, dir: &Path) -> Option<Manifest> {
        match self.ctx.manifests().load(&dir.join(MANIFEST_NAME)) {
            Ok(manifest) => Some(manifest),
            Err(e) if e.is_missing() => None,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "unreadable manifest, treating as bare");
                None
            }
        }
    }

    fn load_edges(
        &self,
        graph: &mut Graph,
        from: &DepId,
        node_modules: &Path,
        declared: Option<BTreeMap<String, (DepType, String)>>,
        importer: bool,
    ) -> Result<(), PkgError> {
        let mut links: BTreeMap<String, DepId> = BTreeMap::new();
        for (name, path) in list_links(node_modules) {
            match self.link_target(graph, &path) {
                Some(to) => {
                    links.insert(name, to);
                }
                None => debug!(link = %path.display(), "link does not point into the project"),
            }
        }

        match declared {
            Some(declared) => {
                for (name, (dep_type, bare)) in &declared {
                    if *dep_type == DepType::Dev && !importer {
                        continue;
                    }
                    graph.add_edge(*dep_type, bare, from, name, links.get(name))?;
                }
                for (name, to) in &links {
                    if !declared.contains_key(name) {
                        graph.add_edge(DepType::Prod, "*", from, name, Some(to))?;
                    }
                }
            }
            // Bare node: every link is an edge.
            None => {
                for (name, to) in &links {
                    graph.add_edge(DepType::Prod, "*", from, name, Some(to))?;
                }
            }
        }
        Ok(())
    }

    /// Map a link to the node it points at: a store entry's package
    /// directory or an importer's directory.
    fn link_target(&self, graph: &Graph, link: &Path) -> Option<DepId> {
        let target = read_link_target(link).ok()?;

        let store = store_root(&self.root);
        if let Ok(rest) = target.strip_prefix(&store) {
            let entry = rest.components().next()?;
            let id = DepId::parse(&entry.as_os_str().to_string_lossy()).ok()?;
            return graph.contains(&id).then_some(id);
        }

        let rel = target.strip_prefix(&self.root).ok()?;
        let location = to_slash(rel);
        graph
            .importers()
            .iter()
            .find(|id| graph.node(id).is_some_and(|n| n.location == location))
            .cloned()
    }
}

/// The first real package directory in a store entry's `node_modules`.
fn find_package_dir(node_modules: &Path) -> Option<(String, PathBuf)> {
    let mut candidates: Vec<(String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(node_modules).ok()?.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        if name.starts_with('.') || is_link(&path) || !path.is_dir() {
            continue;
        }
        if name.starts_with('@') {
            for inner in fs::read_dir(&path).into_iter().flatten().flatten() {
                let inner_path = inner.path();
                if !is_link(&inner_path) && inner_path.is_dir() {
                    let inner_name = inner.file_name().to_string_lossy().into_owned();
                    candidates.push((format!("{name}/{inner_name}"), inner_path));
                }
            }
        } else {
            candidates.push((name, path));
        }
    }
    candidates.sort();
    candidates.into_iter().next()
}

/// Dependency links in a `node_modules` directory, scoped names included.
fn list_links(node_modules: &Path) -> Vec<(String, PathBuf)> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(node_modules) else {
        return out;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        if name.starts_with('.') {
            continue;
        }
        if is_link(&path) {
            out.push((name, path));
        } else if name.starts_with('@') && path.is_dir() {
            for inner in fs::read_dir(&path).into_iter().flatten().flatten() {
                let inner_path = inner.path();
                if is_link(&inner_path) {
                    let inner_name = inner.file_name().to_string_lossy().into_owned();
                    out.push((format!("{name}/{inner_name}"), inner_path));
                }
            }
        }
    }
    out.sort();
    out
}

/// Load the installed graph of the project in `ctx`.
///
/// # Errors
/// See [`ActualLoader::load`].
pub fn load_actual(ctx: &Context) -> Result<Graph, PkgError> {
    let root_manifest = ctx.root_manifest()?;
    let members = discover(ctx.project_root(), &root_manifest, ctx.manifests())?;
    ActualLoader::new(ctx).load(root_manifest, members)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::pkg::link::create_dir_link;
    use crate::paths::store_package_dir;
    use tempfile::tempdir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn install(root: &Path, id: &DepId, name: &str, manifest: &str) -> PathBuf {
        let dir = store_package_dir(root, id.as_str(), name);
        write(&dir.join("package.json"), manifest);
        dir
    }

    fn ctx(root: &Path) -> Context {
        Context::new(Config::new(root.to_path_buf()))
    }

    #[test]
    fn test_empty_project() {
        let dir = tempdir().unwrap();
        write(&dir.path().join("package.json"), r#"{"name":"app","dependencies":{"a":"^1"}}"#);

        let graph = load_actual(&ctx(dir.path())).unwrap();
        assert_eq!(graph.len(), 1);
        let missing: Vec<&str> = graph.missing_dependencies().map(|e| e.name.as_str()).collect();
        assert_eq!(missing, vec!["a"]);
    }

    #[test]
    fn test_store_entries_and_links() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(&root.join("package.json"), r#"{"name":"app","dependencies":{"a":"^1","@s/b":"^2"}}"#);

        let a = DepId::registry("", "a", "1.0.0");
        let b = DepId::registry("", "@s/b", "2.0.0");
        let a_dir = install(root, &a, "a", r#"{"name":"a","version":"1.0.0","dependencies":{"@s/b":"^2"}}"#);
        let b_dir = install(root, &b, "@s/b", r#"{"name":"@s/b","version":"2.0.0"}"#);

        create_dir_link(&a_dir, &root.join("node_modules/a")).unwrap();
        create_dir_link(&b_dir, &root.join("node_modules/@s/b")).unwrap();
        // a's dependency is a sibling in its own store entry
        create_dir_link(&b_dir, &a_dir.parent().unwrap().join("@s/b")).unwrap();

        let graph = load_actual(&ctx(root)).unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.missing_dependencies().count(), 0);
        assert_eq!(graph.node(&b).unwrap().edges_in.len(), 2);
        assert_eq!(graph.edge(&a, "@s/b").unwrap().spec, "^2");
        assert_eq!(graph.edge(&DepId::main_importer(), "a").unwrap().to, Some(a.clone()));
        assert!(graph.extraneous_dependencies().is_empty());
    }

    #[test]
    fn test_bare_node_and_undeclared_link() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(&root.join("package.json"), r#"{"name":"app"}"#);

        let a = DepId::registry("", "a", "1.0.0");
        let a_dir = store_package_dir(root, a.as_str(), "a");
        fs::create_dir_all(&a_dir).unwrap();
        create_dir_link(&a_dir, &root.join("node_modules/a")).unwrap();

        let graph = load_actual(&ctx(root)).unwrap();
        let node = graph.node(&a).unwrap();
        assert!(node.manifest.is_none());
        assert_eq!(node.version.as_deref(), Some("1.0.0"));
        let edge = graph.edge(&DepId::main_importer(), "a").unwrap();
        assert_eq!((edge.dep_type, edge.spec.as_str()), (DepType::Prod, "*"));
    }

    #[test]
    fn test_extraneous_store_entry() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(&root.join("package.json"), r#"{"name":"app"}"#);
        let old = DepId::registry("", "old", "0.1.0");
        install(root, &old, "old", r#"{"name":"old","version":"0.1.0"}"#);

        let graph = load_actual(&ctx(root)).unwrap();
        assert!(graph.extraneous_dependencies().contains(&old));
    }

    #[test]
    fn test_file_origin_entry_finds_package_dir() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(&root.join("package.json"), r#"{"name":"app","dependencies":{"local":"file:./vendor/local"}}"#);
        let id = DepId::file("vendor/local");
        let pkg = install(root, &id, "local", r#"{"name":"local","version":"0.0.1"}"#);
        create_dir_link(&pkg, &root.join("node_modules/local")).unwrap();

        let graph = load_actual(&ctx(root)).unwrap();
        let node = graph.node(&id).unwrap();
        assert_eq!(node.name, "local");
        assert_eq!(graph.edge(&DepId::main_importer(), "local").unwrap().to, Some(id));
    }

    #[test]
    fn test_unconfigured_registry_is_fatal() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(&root.join("package.json"), r#"{"name":"app"}"#);
        install(root, &DepId::registry("acme", "x", "1.0.0"), "x", r#"{"name":"x"}"#);

        let err = load_actual(&ctx(root)).unwrap_err();
        assert_eq!(err.code(), crate::pkg::error::codes::PKG_UNCONFIGURED_REGISTRY);

        let config = Config::new(root.to_path_buf()).with_registry_alias("acme", "https://npm.acme.test/");
        assert!(load_actual(&Context::new(config)).is_ok());
    }

    #[test]
    fn test_malformed_store_entry_is_fatal() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(&root.join("package.json"), r#"{"name":"app"}"#);
        fs::create_dir_all(store_root(root).join("not-an-id")).unwrap();

        let err = load_actual(&ctx(root)).unwrap_err();
        assert_eq!(err.code(), crate::pkg::error::codes::PKG_MALFORMED_ID);
    }

    #[test]
    fn test_workspace_link() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(
            &root.join("package.json"),
            r#"{"name":"app","workspaces":["packages/*"],"dependencies":{"lib":"workspace:*"}}"#,
        );
        write(&root.join("packages/lib/package.json"), r#"{"name":"lib","version":"1.0.0"}"#);
        create_dir_link(&root.join("packages/lib"), &root.join("node_modules/lib")).unwrap();

        let graph = load_actual(&ctx(root)).unwrap();
        assert_eq!(
            graph.edge(&DepId::main_importer(), "lib").unwrap().to,
            Some(DepId::workspace("packages/lib"))
        );
    }
}
