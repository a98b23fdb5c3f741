//! Reification: make the disk match the ideal graph.
//!
//! New store entries are extracted into a staging directory first, so a
//! failed fetch changes nothing. Then, through one [`Journal`]:
//!
//! 1. stale links and their bins are removed, along with store entries
//!    that are no longer in the graph
//! 2. staged entries are moved into the store
//! 3. links are created, then their bins
//! 4. importer manifests and the lockfile are written
//! 5. emptied directories are vacuumed
//!
//! Any failure rolls every change back before the error is returned.

use super::bins::{link_bins, unlink_bins, ShimStyle};
use super::context::Context;
use super::depid::DepId;
use super::diff::{Diff, LinkKey};
use super::error::PkgError;
use super::graph::{DepType, Graph, Node};
use super::journal::Journal;
use super::lockfile::{lockfile_path, save};
use super::manifest::{render_with_deps, Manifest, MANIFEST_NAME};
use super::source::PackageSource;
use crate::paths::{normalize, package_path, store_entry_dir, store_package_dir, store_root, NODE_MODULES};
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Reify behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReifyOptions {
    pub shim_style: ShimStyle,
    pub write_lockfile: bool,
}

impl Default for ReifyOptions {
    fn default() -> Self {
        Self {
            shim_style: ShimStyle::native(),
            write_lockfile: true,
        }
    }
}

/// What a reify call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReifyReport {
    pub nodes_added: usize,
    pub nodes_removed: usize,
    pub nodes_retained: usize,
    pub edges_added: usize,
    pub edges_removed: usize,
    pub edges_retained: usize,
    pub bins_linked: usize,
    /// Filesystem changes made. Zero when the project was already up to date.
    pub mutations: usize,
    /// Optional dependencies that could not be resolved, as `from: name@spec`.
    pub missing_optional: Vec<String>,
}

/// Fail if a required dependency of the root project is missing.
///
/// # Errors
/// Returns `MissingDependency` for the first missing prod or non-optional
/// peer edge of the main importer.
pub fn check_missing(ideal: &Graph) -> Result<(), PkgError> {
    let main = ideal.main_importer_id();
    let optional_peer = |name: &str| {
        ideal
            .main_importer()
            .and_then(|n| n.manifest.as_ref())
            .is_some_and(|m| m.peer_is_optional(name))
    };
    for edge in ideal.missing_dependencies() {
        if &edge.from != main {
            continue;
        }
        let required = match edge.dep_type {
            DepType::Prod => true,
            DepType::Peer => !optional_peer(&edge.name),
            DepType::Dev | DepType::Optional => false,
        };
        if required {
            return Err(PkgError::MissingDependency {
                from: edge.from.to_string(),
                name: edge.name.clone(),
                spec: edge.spec.clone(),
            });
        }
    }
    Ok(())
}

/// Apply `ideal` to the project in `ctx`, given what `actual` says is there.
///
/// # Errors
/// Returns `MissingDependency` (before touching anything) if the root
/// project lacks a required dependency, and `PartialReify` wrapping the
/// cause for any failure after that. The project is left as it was.
pub async fn reify(
    ctx: &Context,
    source: &dyn PackageSource,
    ideal: &Graph,
    actual: &Graph,
    options: ReifyOptions,
) -> Result<ReifyReport, PkgError> {
    check_missing(ideal)?;

    let diff = Diff::between(ideal, actual);
    let root = normalize(ctx.project_root());
    let mut reifier = Reifier {
        ctx,
        root: root.clone(),
        ideal,
        actual,
        options,
        journal: Journal::new(&root),
        bins_linked: 0,
    };

    match reifier.apply(source, &diff).await {
        Ok(()) => {
            let bins_linked = reifier.bins_linked;
            let mutations = reifier.journal.commit();
            let report = ReifyReport {
                nodes_added: diff.nodes_add.len(),
                nodes_removed: diff.nodes_remove.len(),
                nodes_retained: diff.nodes_retain.len(),
                edges_added: diff.edges_add.len(),
                edges_removed: diff.edges_remove.len(),
                edges_retained: diff.edges_retain.len(),
                bins_linked,
                mutations,
                missing_optional: missing_optional(ideal),
            };
            info!(
                added = report.nodes_added,
                removed = report.nodes_removed,
                retained = report.nodes_retained,
                mutations,
                "reify complete"
            );
            Ok(report)
        }
        Err(e) => {
            error!(error = %e, mutations = reifier.journal.mutations(), "reify failed, rolling back");
            if let Err(undo) = reifier.journal.rollback() {
                error!(error = %undo, "rollback incomplete");
            }
            ctx.manifests().clear();
            Err(PkgError::partial_reify(e))
        }
    }
}

/// Missing optional dependencies and optional peers.
fn missing_optional(ideal: &Graph) -> Vec<String> {
    let optional_peer = |from: &DepId, name: &str| {
        ideal
            .node(from)
            .and_then(|n| n.manifest.as_ref())
            .is_some_and(|m| m.peer_is_optional(name))
    };
    ideal
        .missing_dependencies()
        .filter(|e| match e.dep_type {
            DepType::Optional => true,
            DepType::Peer => optional_peer(&e.from, &e.name),
            DepType::Prod | DepType::Dev => false,
        })
        .map(|e| format!("{}: {}@{}", e.from.human(), e.name, e.spec))
        .collect()
}

struct Reifier<'a> {
    ctx: &'a Context,
    root: PathBuf,
    ideal: &'a Graph,
    actual: &'a Graph,
    options: ReifyOptions,
    journal: Journal,
    bins_linked: usize,
}

impl<'a> Reifier<'a> {
    async fn apply(&mut self, source: &dyn PackageSource, diff: &Diff) -> Result<(), PkgError> {
        let staging = self.stage(source, diff).await?;
        let mut vacuum: BTreeSet<(PathBuf, PathBuf)> = BTreeSet::new();

        // Stale links first, so nothing points into an entry being removed.
        for link in &diff.edges_remove {
            if diff.nodes_remove.contains(&link.from) || diff.nodes_add.contains(&link.from) {
                continue;
            }
            self.unlink(link, &mut vacuum)?;
        }

        // Removed entries, plus bare entries about to be replaced.
        let actual = self.actual;
        for id in diff
            .nodes_remove
            .iter()
            .chain(diff.nodes_add.iter().filter(|id| actual.contains(id)))
        {
            let entry = store_entry_dir(&self.root, id.as_str());
            if self.journal.remove(&entry)? {
                debug!(id = %id, "removed store entry");
            }
        }

        if let Some((_dir, staged)) = &staging {
            for (id, path) in staged {
                let node = self.ideal_node(id)?;
                let dest = store_package_dir(&self.root, id.as_str(), &node.name);
                self.journal.place_dir(path, &dest)?;
            }
        }

        for link in &diff.edges_add {
            self.link(link)?;
        }

        self.write_manifests()?;
        if self.options.write_lockfile {
            let text = save(self.ideal, self.ctx.config());
            self.journal.write_file(&lockfile_path(&self.root), text.as_bytes())?;
        }

        for (start, stop) in &vacuum {
            self.journal.vacuum(start, stop)?;
        }
        let store = store_root(&self.root);
        self.journal.vacuum(&store, &self.root)?;
        Ok(())
    }

    /// Extract every new node into a staging directory inside the project.
    async fn stage(
        &self,
        source: &dyn PackageSource,
        diff: &Diff,
    ) -> Result<Option<(tempfile::TempDir, Vec<(DepId, PathBuf)>)>, PkgError> {
        if diff.nodes_add.is_empty() {
            return Ok(None);
        }
        let dir = tempfile::Builder::new()
            .prefix(".vlt-staging-")
            .tempdir_in(&self.root)
            .map_err(|e| PkgError::io(&self.root, e))?;

        let mut jobs: Vec<(&Node, PathBuf)> = Vec::with_capacity(diff.nodes_add.len());
        for (index, id) in diff.nodes_add.iter().enumerate() {
            jobs.push((self.ideal_node(id)?, dir.path().join(index.to_string())));
        }

        let concurrency = self.ctx.config().concurrency.max(1);
        let results: Vec<Result<(), PkgError>> = stream::iter(jobs.iter())
            .map(|(node, dest)| async move {
                debug!(id = %node.id, "extracting");
                source.extract(node, dest).await
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        results.into_iter().collect::<Result<Vec<()>, _>>()?;

        let staged = jobs.into_iter().map(|(node, path)| (node.id.clone(), path)).collect();
        Ok(Some((dir, staged)))
    }

    fn ideal_node(&self, id: &DepId) -> Result<&'a Node, PkgError> {
        let ideal: &'a Graph = self.ideal;
        ideal
            .node(id)
            .ok_or_else(|| PkgError::NotFound(format!("node {id}")))
    }

    /// Remove a link and its bins, remembering where to vacuum afterwards.
    fn unlink(&mut self, link: &LinkKey, vacuum: &mut BTreeSet<(PathBuf, PathBuf)>) -> Result<(), PkgError> {
        let actual = self.actual;
        let Some(from) = actual.node(&link.from) else {
            return Ok(());
        };
        let node_modules = node_modules_of(&self.root, from);
        let path = package_path(&node_modules, &link.name);
        if let Some(manifest) = actual.node(&link.to).and_then(|n| n.manifest.as_ref()) {
            unlink_bins(&mut self.journal, &node_modules, &path, manifest, self.options.shim_style)?;
        }

        if super::link::is_link(&path) {
            self.journal.remove(&path)?;
            if let Some(parent) = path.parent() {
                let stop = if from.importer {
                    normalize(&self.root.join(&from.location))
                } else {
                    store_entry_dir(&self.root, from.id.as_str())
                };
                vacuum.insert((normalize(parent), stop));
            }
        }
        Ok(())
    }

    fn link(&mut self, link: &LinkKey) -> Result<(), PkgError> {
        let from = self.ideal_node(&link.from)?;
        let to = self.ideal_node(&link.to)?;
        let node_modules = node_modules_of(&self.root, from);
        let path = package_path(&node_modules, &link.name);
        let target = package_dir_of(&self.root, to);

        self.journal.link_dir(&target, &path)?;
        if let Some(manifest) = &to.manifest {
            self.bins_linked += link_bins(
                &mut self.journal,
                &node_modules,
                &path,
                manifest,
                self.options.shim_style,
            )?;
        }
        Ok(())
    }

    /// Rewrite importer manifests whose dependency maps changed.
    fn write_manifests(&mut self) -> Result<(), PkgError> {
        let ideal = self.ideal;
        for id in ideal.importers() {
            let Some(node) = ideal.node(id) else {
                continue;
            };
            let Some(manifest) = &node.manifest else {
                continue;
            };
            let path = self.root.join(&node.location).join(MANIFEST_NAME);
            let existing = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(PkgError::io(&path, e)),
            };
            let on_disk = if existing.is_empty() {
                Manifest::default()
            } else {
                Manifest::from_slice(&existing).map_err(|e| PkgError::manifest_invalid(&path, e))?
            };
            if !manifest.deps_differ(&on_disk) {
                continue;
            }

            let text = render_with_deps(&existing, manifest).map_err(|e| PkgError::manifest_invalid(&path, e))?;
            self.journal.write_file(&path, text.as_bytes())?;
            self.ctx.manifests().invalidate(&path);
            debug!(importer = %id, "updated manifest");
        }
        Ok(())
    }
}

/// The `node_modules` directory holding a node's dependency links.
fn node_modules_of(root: &Path, node: &Node) -> PathBuf {
    if node.importer {
        normalize(&root.join(&node.location)).join(NODE_MODULES)
    } else {
        store_entry_dir(root, node.id.as_str()).join(NODE_MODULES)
    }
}

/// The directory a link to `node` points at.
fn package_dir_of(root: &Path, node: &Node) -> PathBuf {
    if node.importer {
        normalize(&root.join(&node.location))
    } else {
        store_package_dir(root, node.id.as_str(), &node.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pkg::manifest::PeerMeta;
    use crate::pkg::source::Resolution;
    use crate::pkg::spec::Spec;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use tempfile::tempdir;

    /// Extracts a `package.json` for the node; fails for names in `broken`.
    #[derive(Default)]
    struct Writer {
        broken: Vec<String>,
    }

    impl PackageSource for Writer {
        fn resolve<'a>(&'a self, spec: &'a Spec, _: Option<&'a str>) -> BoxFuture<'a, Result<Resolution, PkgError>> {
            async move { Err(PkgError::NotFound(spec.to_string())) }.boxed()
        }

        fn extract<'a>(&'a self, node: &'a Node, dest: &'a Path) -> BoxFuture<'a, Result<(), PkgError>> {
            async move {
                if self.broken.contains(&node.name) {
                    return Err(PkgError::fetch(node.name.clone(), "connection reset"));
                }
                fs::create_dir_all(dest).map_err(|e| PkgError::io(dest, e))?;
                let json = serde_json::to_vec(node.manifest.as_ref().unwrap()).unwrap();
                fs::write(dest.join("package.json"), json).map_err(|e| PkgError::io(dest, e))
            }
            .boxed()
        }
    }

    fn project() -> (tempfile::TempDir, Context) {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("package.json"), "{\"name\":\"app\"}\n").unwrap();
        let ctx = Context::new(Config::new(dir.path().to_path_buf()));
        (dir, ctx)
    }

    fn ideal_with(deps: &[(&str, &str)]) -> Graph {
        let mut graph = Graph::new(Manifest {
            name: Some("app".into()),
            ..Manifest::default()
        });
        for (name, version) in deps {
            let id = DepId::registry("", name, version);
            let manifest = Manifest {
                name: Some((*name).to_string()),
                version: Some((*version).to_string()),
                ..Manifest::default()
            };
            graph.add_node(id.clone(), name, Some(manifest), None);
            graph
                .add_edge(DepType::Prod, "*", &DepId::main_importer(), name, Some(&id))
                .unwrap();
        }
        graph
    }

    fn no_lock() -> ReifyOptions {
        ReifyOptions {
            write_lockfile: false,
            ..ReifyOptions::default()
        }
    }

    #[tokio::test]
    async fn test_missing_required_dep_fails_before_mutation() {
        let (dir, ctx) = project();
        let mut ideal = ideal_with(&[]);
        ideal
            .add_edge(DepType::Prod, "^1", &DepId::main_importer(), "ghost", None)
            .unwrap();
        let actual = ideal_with(&[]);

        let err = reify(&ctx, &Writer::default(), &ideal, &actual, no_lock())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::pkg::error::codes::PKG_MISSING_DEPENDENCY);
        assert!(!dir.path().join("node_modules").exists());
    }

    #[tokio::test]
    async fn test_missing_optional_is_reported() {
        let (_dir, ctx) = project();
        let mut ideal = ideal_with(&[]);
        ideal
            .add_edge(DepType::Optional, "^1", &DepId::main_importer(), "fsevents", None)
            .unwrap();

        let report = reify(&ctx, &Writer::default(), &ideal, &ideal_with(&[]), no_lock())
            .await
            .unwrap();
        assert_eq!(report.missing_optional, vec!["file:.: fsevents@^1".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_dev_not_reported_but_optional_peer_is() {
        let (_dir, ctx) = project();
        let mut ideal = Graph::new(Manifest {
            name: Some("app".into()),
            peer_dependencies_meta: [("maybe".to_string(), PeerMeta { optional: true })].into(),
            ..Manifest::default()
        });
        let main = DepId::main_importer();
        ideal.add_edge(DepType::Dev, "^1", &main, "lint", None).unwrap();
        ideal.add_edge(DepType::Peer, "^2", &main, "maybe", None).unwrap();

        let report = reify(&ctx, &Writer::default(), &ideal, &ideal_with(&[]), no_lock())
            .await
            .unwrap();
        assert_eq!(report.missing_optional, vec!["file:.: maybe@^2".to_string()]);
    }

    #[tokio::test]
    async fn test_fetch_failure_leaves_project_untouched() {
        let (dir, ctx) = project();
        let before = vlt_util::hash::tree_digest(dir.path()).unwrap();
        let source = Writer {
            broken: vec!["b".into()],
        };

        let err = reify(&ctx, &source, &ideal_with(&[("a", "1.0.0"), ("b", "1.0.0")]), &ideal_with(&[]), no_lock())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::pkg::error::codes::PKG_PARTIAL_REIFY);
        assert_eq!(vlt_util::hash::tree_digest(dir.path()).unwrap(), before);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_then_noop() {
        let (dir, ctx) = project();
        let ideal = ideal_with(&[("a", "1.0.0")]);

        let report = reify(&ctx, &Writer::default(), &ideal, &ideal_with(&[]), ReifyOptions::default())
            .await
            .unwrap();
        assert_eq!(report.nodes_added, 1);
        assert!(report.mutations > 0);
        assert!(dir.path().join("node_modules/a/package.json").exists());
        assert!(dir.path().join("vlt-lock.json").exists());

        let actual = crate::pkg::actual::load_actual(&ctx).unwrap();
        let again = reify(&ctx, &Writer::default(), &ideal, &actual, ReifyOptions::default())
            .await
            .unwrap();
        assert_eq!(again.mutations, 0);
        assert_eq!(again.nodes_retained, 1);
    }
}
