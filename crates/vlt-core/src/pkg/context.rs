//! Explicit per-run context.
//!
//! Everything that would otherwise be process-global (configuration, the
//! request cache, parsed manifests) hangs off a [`Context`], so independent
//! instances never share state.

use super::cache::{Cache, CacheOptions};
use super::error::PkgError;
use super::git::{GitCli, GitClient};
use super::manifest::{Manifest, MANIFEST_NAME};
use super::registry::RegistryClient;
use super::source::PackageInfoClient;
use crate::config::Config;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

/// Identity of a file version: modification time plus length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl Stamp {
    fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

/// Parsed `package.json` files keyed by path, revalidated by stamp.
#[derive(Debug, Default)]
pub struct ManifestCache {
    entries: Mutex<HashMap<PathBuf, (Stamp, Manifest)>>,
}

impl ManifestCache {
    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, (Stamp, Manifest)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load a manifest, reusing the parsed copy while the file is unchanged.
    ///
    /// # Errors
    /// Returns `NotFound` if the file is absent, `ManifestInvalid` if it does not parse.
    pub fn load(&self, path: &Path) -> Result<Manifest, PkgError> {
        let stamp = Stamp::of(path);
        if let Some(stamp) = stamp {
            if let Some((cached, manifest)) = self.lock().get(path) {
                if *cached == stamp {
                    return Ok(manifest.clone());
                }
            }
        }

        let manifest = Manifest::read(path)?;
        if let Some(stamp) = stamp {
            self.lock()
                .insert(path.to_path_buf(), (stamp, manifest.clone()));
        }
        Ok(manifest)
    }

    /// Load `<dir>/package.json`.
    ///
    /// # Errors
    /// See [`ManifestCache::load`].
    pub fn load_dir(&self, dir: &Path) -> Result<Manifest, PkgError> {
        self.load(&dir.join(MANIFEST_NAME))
    }

    /// Forget one path, e.g. after writing it.
    pub fn invalidate(&self, path: &Path) {
        self.lock().remove(path);
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Configuration, cache and manifest cache for one project.
#[derive(Debug)]
pub struct Context {
    config: Config,
    cache: Cache,
    manifests: ManifestCache,
}

impl Context {
    /// Build a context; the cache is sized from the config.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let cache = Cache::new(CacheOptions::from_config(&config));
        Self {
            config,
            cache,
            manifests: ManifestCache::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.config.project_root
    }

    #[must_use]
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    #[must_use]
    pub fn manifests(&self) -> &ManifestCache {
        &self.manifests
    }

    /// The root project manifest; an absent file reads as an empty manifest.
    ///
    /// # Errors
    /// Returns an error if the manifest exists but cannot be parsed.
    pub fn root_manifest(&self) -> Result<Manifest, PkgError> {
        match self.manifests.load_dir(self.project_root()) {
            Err(PkgError::NotFound(_)) => Ok(Manifest::default()),
            other => other,
        }
    }

    /// The production package source, using the `git` executable.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn package_source(&self) -> Result<PackageInfoClient, PkgError> {
        self.package_source_with_git(Arc::new(GitCli::default()))
    }

    /// The production package source with a custom git collaborator.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn package_source_with_git(&self, git: Arc<dyn GitClient>) -> Result<PackageInfoClient, PkgError> {
        let registry = RegistryClient::new(&self.config, self.cache.clone())?;
        Ok(PackageInfoClient::new(self.config.clone(), registry, git))
    }
}
