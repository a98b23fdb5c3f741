//! Ideal-graph builder.
//!
//! Starting from every importer's manifest, dependencies are resolved in
//! breadth-first waves. Each wave's distinct specifiers are resolved
//! concurrently (bounded by `concurrency`), then placed in a deterministic
//! order: importers first, then by source id and dependency name. Every
//! resolved package becomes exactly one node keyed by its [`DepId`]; a
//! second request resolving to the same id only adds an edge.

use super::context::Context;
use super::depid::{DepId, DepIdTuple};
use super::error::PkgError;
use super::graph::{DepType, Graph};
use super::manifest::Manifest;
use super::source::{PackageSource, Resolution};
use super::spec::{Spec, SpecKind};
use super::version::version_satisfies;
use super::workspaces::{discover, WorkspaceMember};
use crate::config::Config;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Add a dependency to an importer's manifest before resolving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub importer: DepId,
    pub dep_type: DepType,
    pub name: String,
    pub bare: String,
}

impl AddRequest {
    /// Add to the root project.
    #[must_use]
    pub fn new(dep_type: DepType, name: &str, bare: &str) -> Self {
        Self {
            importer: DepId::main_importer(),
            dep_type,
            name: name.to_string(),
            bare: bare.to_string(),
        }
    }
}

/// Remove a dependency from an importer's manifest before resolving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveRequest {
    pub importer: DepId,
    pub name: String,
}

impl RemoveRequest {
    /// Remove from the root project.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            importer: DepId::main_importer(),
            name: name.to_string(),
        }
    }
}

/// Inputs beyond the manifests themselves.
#[derive(Debug, Clone, Default)]
pub struct IdealBuildOptions {
    /// A previously built graph (usually the lockfile). An edge whose
    /// specifier is unchanged reuses the locked resolution.
    pub lockfile: Option<Graph>,
    pub add: Vec<AddRequest>,
    pub remove: Vec<RemoveRequest>,
}

/// A dependency waiting to be placed.
#[derive(Debug, Clone)]
struct Pending {
    from: DepId,
    /// Directory relative `file:` specs resolve against.
    base: Option<String>,
    dep_type: DepType,
    spec: Spec,
    optional_peer: bool,
}

impl Pending {
    fn memo_key(&self) -> String {
        match &self.spec.kind {
            SpecKind::File { .. } => format!(
                "{}\u{0}{}",
                self.base.as_deref().unwrap_or(""),
                self.spec.resolution_key()
            ),
            _ => self.spec.resolution_key(),
        }
    }

    fn tolerates(&self, error: &PkgError) -> bool {
        matches!(self.dep_type, DepType::Optional) || self.optional_peer || error.is_missing()
    }
}

/// How one pending dependency will be satisfied.
#[derive(Debug, Clone)]
enum Plan {
    /// Link to a sibling importer.
    Workspace,
    /// Reuse a node already in the graph.
    Reuse(DepId),
    /// Take the locked resolution.
    Locked(Resolution),
    /// Leave the edge missing without resolving (unmatched optional peer).
    Skip,
    /// Resolve through the source; the memo key.
    Resolve(String),
}

/// Builds ideal graphs.
pub struct IdealBuilder<'a> {
    config: &'a Config,
    source: &'a dyn PackageSource,
    options: IdealBuildOptions,
}

impl<'a> IdealBuilder<'a> {
    #[must_use]
    pub fn new(config: &'a Config, source: &'a dyn PackageSource) -> Self {
        Self {
            config,
            source,
            options: IdealBuildOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: IdealBuildOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the graph for a root manifest and its workspace members.
    ///
    /// Unresolvable dependencies become missing edges. Invalid specifiers in
    /// importer manifests and non-`missing` failures of required
    /// dependencies (network, integrity) are errors.
    ///
    /// # Errors
    /// See above.
    pub async fn build(&self, root: Manifest, workspaces: Vec<WorkspaceMember>) -> Result<Graph, PkgError> {
        let mut graph = Graph::new(root);
        for member in workspaces {
            graph.add_importer(member.id, member.manifest, member.location);
        }
        self.apply_edits(&mut graph)?;

        let mut queue = Vec::new();
        let importers: Vec<DepId> = graph.importers().iter().cloned().collect();
        for id in &importers {
            self.enqueue(&mut graph, id, &mut queue)?;
        }

        let mut memo: HashMap<String, Result<Resolution, PkgError>> = HashMap::new();
        let mut waves = 0usize;
        while !queue.is_empty() {
            waves += 1;
            let wave = std::mem::take(&mut queue);
            let plans: Vec<Plan> = wave.iter().map(|dep| self.plan(&graph, dep)).collect();
            self.resolve_wave(&wave, &plans, &mut memo).await;

            for (dep, plan) in wave.into_iter().zip(plans) {
                self.place(&mut graph, dep, plan, &memo, &mut queue)?;
            }
        }

        graph.classify();
        info!(
            nodes = graph.len(),
            edges = graph.edge_count(),
            missing = graph.missing_dependencies().count(),
            waves,
            "built ideal graph"
        );
        Ok(graph)
    }

    fn apply_edits(&self, graph: &mut Graph) -> Result<(), PkgError> {
        for request in &self.options.remove {
            let manifest = importer_manifest(graph, &request.importer)?;
            if !manifest.remove_dependency(&request.name) {
                debug!(name = %request.name, importer = %request.importer, "not a dependency, nothing to remove");
            }
        }
        for request in &self.options.add {
            // Validate before touching the manifest.
            Spec::parse(&request.name, &request.bare, self.config)?;
            let manifest = importer_manifest(graph, &request.importer)?;
            manifest.set_dependency(request.dep_type, &request.name, &request.bare);
        }
        Ok(())
    }

    /// Queue every dependency `id` declares. Dev dependencies are followed
    /// for importers only.
    fn enqueue(&self, graph: &mut Graph, id: &DepId, queue: &mut Vec<Pending>) -> Result<(), PkgError> {
        let Some(node) = graph.node(id) else {
            return Ok(());
        };
        let Some(manifest) = node.manifest.clone() else {
            return Ok(());
        };
        let importer = node.importer;
        let base = if importer {
            Some(node.location.clone())
        } else if let DepIdTuple::File { path } = id.tuple() {
            Some(path.clone())
        } else {
            None
        };

        let declared: BTreeMap<String, (DepType, String)> = manifest.declared_deps();
        for (name, (dep_type, bare)) in declared {
            if dep_type == DepType::Dev && !importer {
                continue;
            }
            match Spec::parse(&name, &bare, self.config) {
                Ok(spec) => queue.push(Pending {
                    from: id.clone(),
                    base: base.clone(),
                    dep_type,
                    spec,
                    optional_peer: dep_type == DepType::Peer && manifest.peer_is_optional(&name),
                }),
                Err(e) if importer => return Err(e),
                Err(e) => {
                    warn!(from = %id, name = %name, error = %e, "invalid dependency specifier");
                    graph.add_edge(dep_type, &bare, id, &name, None)?;
                }
            }
        }
        Ok(())
    }

    fn plan(&self, graph: &Graph, dep: &Pending) -> Plan {
        if let SpecKind::Workspace { .. } = dep.spec.kind {
            return Plan::Workspace;
        }

        if dep.dep_type == DepType::Peer {
            if let SpecKind::Registry { package, range, .. } = &dep.spec.kind {
                let existing = graph.nodes_named(package).find(|n| {
                    !n.importer
                        && n.version
                            .as_deref()
                            .is_some_and(|v| version_satisfies(v, range))
                });
                if let Some(node) = existing {
                    return Plan::Reuse(node.id.clone());
                }
            }
            if dep.optional_peer {
                return Plan::Skip;
            }
        }

        if let Some(locked) = self.locked(dep) {
            return Plan::Locked(locked);
        }
        Plan::Resolve(dep.memo_key())
    }

    /// The lockfile's resolution for this edge, if its specifier is unchanged.
    fn locked(&self, dep: &Pending) -> Option<Resolution> {
        let lock = self.options.lockfile.as_ref()?;
        let edge = lock.edge(&dep.from, &dep.spec.name)?;
        if edge.spec != dep.spec.bare {
            return None;
        }
        let node = lock.node(edge.to.as_ref()?)?;
        if node.importer {
            return None;
        }
        Some(Resolution {
            id: node.id.clone(),
            name: node.name.clone(),
            manifest: node.manifest.clone()?,
            resolved: node.resolved.clone(),
            integrity: node.integrity.clone(),
        })
    }

    async fn resolve_wave(
        &self,
        wave: &[Pending],
        plans: &[Plan],
        memo: &mut HashMap<String, Result<Resolution, PkgError>>,
    ) {
        let mut jobs: BTreeMap<String, &Pending> = BTreeMap::new();
        for (dep, plan) in wave.iter().zip(plans) {
            if let Plan::Resolve(key) = plan {
                if !memo.contains_key(key) {
                    jobs.entry(key.clone()).or_insert(dep);
                }
            }
        }
        if jobs.is_empty() {
            return;
        }

        debug!(count = jobs.len(), "resolving wave");
        let results: Vec<(String, Result<Resolution, PkgError>)> = stream::iter(jobs)
            .map(|(key, dep)| async move {
                let result = self.source.resolve(&dep.spec, dep.base.as_deref()).await;
                (key, result)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        memo.extend(results);
    }

    fn place(
        &self,
        graph: &mut Graph,
        dep: Pending,
        plan: Plan,
        memo: &HashMap<String, Result<Resolution, PkgError>>,
        queue: &mut Vec<Pending>,
    ) -> Result<(), PkgError> {
        let outcome = match plan {
            Plan::Workspace => return place_workspace(graph, &dep),
            Plan::Reuse(id) => {
                graph.add_edge(dep.dep_type, &dep.spec.bare, &dep.from, &dep.spec.name, Some(&id))?;
                return Ok(());
            }
            Plan::Skip => {
                debug!(from = %dep.from, name = %dep.spec.name, "optional peer not present");
                graph.add_edge(dep.dep_type, &dep.spec.bare, &dep.from, &dep.spec.name, None)?;
                return Ok(());
            }
            Plan::Locked(resolution) => Ok(resolution),
            Plan::Resolve(key) => memo.get(&key).cloned().unwrap_or_else(|| {
                Err(PkgError::MissingDependency {
                    from: dep.from.to_string(),
                    name: dep.spec.name.clone(),
                    spec: dep.spec.bare.clone(),
                })
            }),
        };

        match outcome {
            Ok(resolution) => {
                let is_new = !graph.contains(&resolution.id);
                if is_new {
                    let node = graph.add_node(
                        resolution.id.clone(),
                        &resolution.name,
                        Some(resolution.manifest),
                        None,
                    );
                    node.resolved = resolution.resolved;
                    node.integrity = resolution.integrity;
                }
                graph.add_edge(
                    dep.dep_type,
                    &dep.spec.bare,
                    &dep.from,
                    &dep.spec.name,
                    Some(&resolution.id),
                )?;
                if is_new {
                    self.enqueue(graph, &resolution.id, queue)?;
                }
                Ok(())
            }
            Err(e) if dep.tolerates(&e) => {
                warn!(from = %dep.from, spec = %dep.spec, error = %e, "dependency left missing");
                graph.add_edge(dep.dep_type, &dep.spec.bare, &dep.from, &dep.spec.name, None)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn importer_manifest<'g>(graph: &'g mut Graph, importer: &DepId) -> Result<&'g mut Manifest, PkgError> {
    graph
        .node_mut(importer)
        .filter(|n| n.importer)
        .and_then(|n| n.manifest.as_mut())
        .ok_or_else(|| PkgError::NotFound(format!("importer {importer}")))
}

/// Link a `workspace:` dependency to the sibling importer of that name.
fn place_workspace(graph: &mut Graph, dep: &Pending) -> Result<(), PkgError> {
    let SpecKind::Workspace { range } = &dep.spec.kind else {
        return Ok(());
    };
    let target = graph
        .nodes_named(&dep.spec.name)
        .find(|n| n.importer && n.id != dep.from)
        .filter(|n| {
            matches!(range.as_str(), "*" | "^" | "~")
                || n.version.as_deref().map_or(true, |v| version_satisfies(v, range))
        })
        .map(|n| n.id.clone());

    if target.is_none() {
        warn!(from = %dep.from, spec = %dep.spec, "no matching workspace");
    }
    graph.add_edge(dep.dep_type, &dep.spec.bare, &dep.from, &dep.spec.name, target.as_ref())?;
    Ok(())
}

/// Build the ideal graph for the project in `ctx`.
///
/// # Errors
/// Returns an error if manifests cannot be read or a required dependency
/// fails for a reason other than not existing.
pub async fn build_ideal(
    ctx: &Context,
    source: &dyn PackageSource,
    options: IdealBuildOptions,
) -> Result<Graph, PkgError> {
    let root = ctx.root_manifest()?;
    let members = discover(ctx.project_root(), &root, ctx.manifests())?;
    IdealBuilder::new(ctx.config(), source)
        .with_options(options)
        .build(root, members)
        .await
}
