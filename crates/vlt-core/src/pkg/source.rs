//! Where packages come from.
//!
//! [`PackageSource`] is the seam between graph building/reification and the
//! outside world: it turns a [`Spec`] into a concrete [`Resolution`], and
//! later writes a resolved node's files into the store. [`PackageInfoClient`]
//! is the real implementation, dispatching on the origin kind.

use super::depid::{DepId, DepIdTuple};
use super::error::PkgError;
use super::git::GitClient;
use super::graph::Node;
use super::integrity::Integrity;
use super::manifest::Manifest;
use super::registry::{default_tarball_url, RegistryClient};
use super::spec::{Spec, SpecKind};
use super::tarball::{copy_package_dir, extract_package, is_tarball_path, read_manifest};
use crate::config::Config;
use crate::paths::{normalize, to_slash};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A specifier resolved to one concrete package.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub id: DepId,
    /// Package name; differs from the dependency name for `npm:` aliases.
    pub name: String,
    pub manifest: Manifest,
    /// Tarball URL, git `url#sha`, or absent for local paths.
    pub resolved: Option<String>,
    pub integrity: Option<String>,
}

/// Resolves specifiers and materializes packages.
pub trait PackageSource: Send + Sync {
    /// Resolve `spec`. `base` is the project-relative directory that relative
    /// `file:` specifiers are resolved against; `None` where they are not
    /// meaningful (inside registry packages).
    fn resolve<'a>(
        &'a self,
        spec: &'a Spec,
        base: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Resolution, PkgError>>;

    /// Write the files of `node` into `dest`, which does not exist yet.
    fn extract<'a>(&'a self, node: &'a Node, dest: &'a Path) -> BoxFuture<'a, Result<(), PkgError>>;
}

/// The production [`PackageSource`]: registries, git, local paths and
/// remote tarballs.
#[derive(Clone)]
pub struct PackageInfoClient {
    config: Config,
    registry: RegistryClient,
    git: Arc<dyn GitClient>,
}

impl std::fmt::Debug for PackageInfoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageInfoClient")
            .field("project_root", &self.config.project_root)
            .finish_non_exhaustive()
    }
}

impl PackageInfoClient {
    #[must_use]
    pub fn new(config: Config, registry: RegistryClient, git: Arc<dyn GitClient>) -> Self {
        Self {
            config,
            registry,
            git,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &RegistryClient {
        &self.registry
    }

    fn registry_url(&self, alias: &str, what: &str) -> Result<&str, PkgError> {
        self.config
            .registry_url(alias)
            .ok_or_else(|| PkgError::UnconfiguredRegistry {
                alias: alias.to_string(),
                id: what.to_string(),
            })
    }

    /// Clone URL for a git remote as written in a spec.
    fn git_url(&self, remote: &str) -> Result<String, PkgError> {
        if let Some(rest) = remote.strip_prefix("git+") {
            return Ok(rest.to_string());
        }
        if remote.contains("://") || remote.starts_with("git@") {
            return Ok(remote.to_string());
        }
        let (host, path) = remote
            .split_once(':')
            .ok_or_else(|| PkgError::Git(format!("unrecognized git remote '{remote}'")))?;
        self.config
            .git_host_url(host, path)
            .ok_or_else(|| PkgError::Git(format!("unknown git host '{host}'")))
    }

    fn local_path(&self, rel: &str) -> PathBuf {
        self.config.project_root.join(rel)
    }

    async fn resolve_registry(
        &self,
        spec: &Spec,
        registry: &str,
        package: &str,
        range: &str,
    ) -> Result<Resolution, PkgError> {
        let url = self.registry_url(registry, &spec.to_string())?;
        let found = self.registry.resolve(url, package, range).await?;
        Ok(Resolution {
            id: DepId::registry(registry, package, &found.version),
            name: package.to_string(),
            manifest: found.manifest,
            resolved: Some(found.tarball),
            integrity: found.integrity,
        })
    }

    async fn resolve_git(
        &self,
        spec: &Spec,
        remote: &str,
        committish: Option<&str>,
        semver: Option<&str>,
    ) -> Result<Resolution, PkgError> {
        let url = self.git_url(remote)?;
        let sha = self.git.resolve_ref(&url, committish, semver).await?;

        let checkout = tempfile::tempdir().map_err(|e| PkgError::Git(format!("temp dir: {e}")))?;
        let dest = checkout.path().join("repo");
        self.git.clone_at(&url, &sha, &dest).await?;
        let manifest = Manifest::read_dir(&dest)?;

        Ok(Resolution {
            id: DepId::git(remote, &sha),
            name: manifest.name.clone().unwrap_or_else(|| spec.name.clone()),
            manifest,
            resolved: Some(format!("{url}#{sha}")),
            integrity: None,
        })
    }

    async fn resolve_file(&self, spec: &Spec, path: &str, base: Option<&str>) -> Result<Resolution, PkgError> {
        let base = base.ok_or_else(|| {
            PkgError::spec_invalid(format!("{spec}: local paths are only allowed in project manifests"))
        })?;
        let rel = to_slash(&normalize(&Path::new(base).join(path)));
        let abs = self.local_path(&rel);

        let (manifest, integrity) = if is_tarball_path(&rel) {
            let bytes = read_local(&abs).await?;
            (read_manifest(&bytes)?, Some(Integrity::compute(&bytes).to_string()))
        } else {
            (Manifest::read_dir(&abs)?, None)
        };

        Ok(Resolution {
            id: DepId::file(&rel),
            name: manifest.name.clone().unwrap_or_else(|| spec.name.clone()),
            manifest,
            resolved: None,
            integrity,
        })
    }

    async fn resolve_remote(&self, spec: &Spec, url: &str) -> Result<Resolution, PkgError> {
        let bytes = self.registry.fetch_tarball(url, None).await?;
        let manifest = read_manifest(&bytes)?;
        Ok(Resolution {
            id: DepId::remote(url),
            name: manifest.name.clone().unwrap_or_else(|| spec.name.clone()),
            manifest,
            resolved: Some(url.to_string()),
            integrity: Some(Integrity::compute(&bytes).to_string()),
        })
    }

    async fn extract_node(&self, node: &Node, dest: &Path) -> Result<(), PkgError> {
        match node.id.tuple() {
            DepIdTuple::Registry {
                registry,
                name,
                version,
            } => {
                let url = match &node.resolved {
                    Some(url) => url.clone(),
                    None => default_tarball_url(self.registry_url(registry, node.id.as_str())?, name, version)?,
                };
                let bytes = self.registry.fetch_tarball(&url, node.integrity.as_deref()).await?;
                unpack(bytes, dest).await
            }
            DepIdTuple::Remote { url } => {
                let bytes = self.registry.fetch_tarball(url, node.integrity.as_deref()).await?;
                unpack(bytes, dest).await
            }
            DepIdTuple::Git { remote, committish } => {
                let url = self.git_url(remote)?;
                self.git.clone_at(&url, committish, dest).await?;
                let git_dir = dest.join(".git");
                if git_dir.exists() {
                    fs::remove_dir_all(&git_dir).map_err(|e| PkgError::io(&git_dir, e))?;
                }
                Ok(())
            }
            DepIdTuple::File { path } => {
                let abs = self.local_path(path);
                if is_tarball_path(path) {
                    let bytes = read_local(&abs).await?;
                    unpack(bytes, dest).await
                } else {
                    copy_package_dir(&abs, dest)
                }
            }
            DepIdTuple::Workspace { path } => Err(PkgError::Extract(format!(
                "workspace {path} is linked, never extracted"
            ))),
        }
    }
}

impl PackageSource for PackageInfoClient {
    fn resolve<'a>(
        &'a self,
        spec: &'a Spec,
        base: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Resolution, PkgError>> {
        async move {
            debug!(spec = %spec, "resolving");
            match &spec.kind {
                SpecKind::Registry {
                    registry,
                    package,
                    range,
                } => self.resolve_registry(spec, registry, package, range).await,
                SpecKind::Git {
                    remote,
                    committish,
                    semver,
                } => {
                    self.resolve_git(spec, remote, committish.as_deref(), semver.as_deref())
                        .await
                }
                SpecKind::File { path } => self.resolve_file(spec, path, base).await,
                SpecKind::Remote { url } => self.resolve_remote(spec, url).await,
                SpecKind::Workspace { .. } => Err(PkgError::spec_invalid(format!(
                    "{spec}: workspace specifiers resolve against importers"
                ))),
            }
        }
        .boxed()
    }

    fn extract<'a>(&'a self, node: &'a Node, dest: &'a Path) -> BoxFuture<'a, Result<(), PkgError>> {
        self.extract_node(node, dest).boxed()
    }
}

async fn read_local(path: &Path) -> Result<Bytes, PkgError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Bytes::from(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(PkgError::NotFound(path.display().to_string()))
        }
        Err(e) => Err(PkgError::io(path, e)),
    }
}

/// Extract off the async threads.
async fn unpack(bytes: Bytes, dest: &Path) -> Result<(), PkgError> {
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_package(&bytes, &dest))
        .await
        .map_err(|e| PkgError::Extract(format!("extract task failed: {e}")))?
}
