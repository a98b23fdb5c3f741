//! npm registry client.
//!
//! Every request goes through the [`Cache`] keyed by its URL, so concurrent
//! lookups of one packument or tarball share a single download, and repeat
//! runs read from disk.

use super::cache::Cache;
use super::error::PkgError;
use super::manifest::Manifest;
use super::retry::RetryPolicy;
use super::version::resolve_version;
use crate::config::Config;
use crate::version::user_agent;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Maximum tarball size (200 MB).
pub const MAX_TARBALL_SIZE: u64 = 200 * 1024 * 1024;

/// Abbreviated-metadata media type; registries answer it with a smaller document.
const CORGI_ACCEPT: &str =
    "application/vnd.npm.install-v1+json; q=1.0, application/json; q=0.8, */*";

/// Package metadata document: every published version's manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Packument {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "dist-tags")]
    pub dist_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub versions: BTreeMap<String, Manifest>,
}

/// The outcome of resolving a registry range.
#[derive(Debug, Clone)]
pub struct RegistryResolution {
    pub version: String,
    pub manifest: Manifest,
    pub tarball: String,
    pub integrity: Option<String>,
}

/// Registry client for packuments and tarballs.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: Client,
    cache: Cache,
    retry: RetryPolicy,
}

impl RegistryClient {
    /// Create a client that fetches through `cache`.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: &Config, cache: Cache) -> Result<Self, PkgError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .user_agent(user_agent())
            .build()
            .map_err(|e| PkgError::Registry(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            cache,
            retry: RetryPolicy::from_config(config),
        })
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Fetch the packument for `name` from the registry at `registry_url`.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown package, or a fetch error.
    pub async fn fetch_packument(&self, registry_url: &str, name: &str) -> Result<Packument, PkgError> {
        let url = packument_url(registry_url, name)?;
        let bytes = self.get(url.as_str(), None, Some(CORGI_ACCEPT)).await?;
        let mut packument: Packument = serde_json::from_slice(&bytes).map_err(|e| {
            PkgError::Registry(format!("Invalid packument for '{name}' from {url}: {e}"))
        })?;
        if packument.name.is_empty() {
            packument.name = name.to_string();
        }
        Ok(packument)
    }

    /// Fetch tarball bytes, verifying `integrity` when given.
    ///
    /// # Errors
    /// Returns a fetch error or an integrity mismatch.
    pub async fn fetch_tarball(&self, url: &str, integrity: Option<&str>) -> Result<Bytes, PkgError> {
        self.get(url, integrity, None).await
    }

    /// Resolve `range` for `package` to a concrete version.
    ///
    /// # Errors
    /// Returns `NotFound`/`VersionNotFound` when nothing matches, or a fetch error.
    pub async fn resolve(
        &self,
        registry_url: &str,
        package: &str,
        range: &str,
    ) -> Result<RegistryResolution, PkgError> {
        let packument = self.fetch_packument(registry_url, package).await?;
        let version = resolve_version(&packument, range)?;
        let manifest = packument
            .versions
            .get(&version)
            .cloned()
            .ok_or_else(|| PkgError::version_not_found(package, range))?;

        let dist = manifest.dist.clone().unwrap_or_default();
        let tarball = match dist.tarball {
            Some(url) => url,
            None => default_tarball_url(registry_url, package, &version)?,
        };

        debug!(package = %package, range = %range, version = %version, "resolved");
        Ok(RegistryResolution {
            version,
            manifest,
            tarball,
            integrity: dist.integrity,
        })
    }

    async fn get(&self, url: &str, integrity: Option<&str>, accept: Option<&'static str>) -> Result<Bytes, PkgError> {
        let http = self.http.clone();
        let retry = self.retry;
        let owned = url.to_string();
        self.cache
            .fetch(url, integrity, move || async move {
                retry
                    .run(&owned, || download(&http, &owned, accept, MAX_TARBALL_SIZE))
                    .await
            })
            .await
    }
}

/// One GET, classifying failures: 404 is `NotFound`, 408/429/5xx are
/// transient, anything else is a permanent fetch error.
async fn download(
    http: &Client,
    url: &str,
    accept: Option<&str>,
    max_bytes: u64,
) -> Result<Bytes, PkgError> {
    let mut request = http.get(url);
    if let Some(accept) = accept {
        request = request.header(reqwest::header::ACCEPT, accept);
    }
    let response = request.send().await?;
    let status = response.status();

    if status == StatusCode::NOT_FOUND {
        return Err(PkgError::NotFound(url.to_string()));
    }
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        return Err(PkgError::fetch_transient(url, format!("registry returned {status}")));
    }
    if !status.is_success() {
        return Err(PkgError::fetch(url, format!("registry returned {status}")));
    }

    if response.content_length().is_some_and(|len| len > max_bytes) {
        return Err(PkgError::fetch(url, format!("response larger than {max_bytes} bytes")));
    }
    let bytes = response.bytes().await?;
    if bytes.len() as u64 > max_bytes {
        return Err(PkgError::fetch(url, format!("response larger than {max_bytes} bytes")));
    }
    Ok(bytes)
}

/// `<registry>/<name>`, with the scope slash escaped as registries expect.
///
/// # Errors
/// Returns an error if the registry URL is invalid.
pub fn packument_url(registry_url: &str, name: &str) -> Result<Url, PkgError> {
    let base = base_url(registry_url)?;
    base.join(&name.replace('/', "%2F"))
        .map_err(|e| PkgError::Registry(format!("Failed to build URL for '{name}': {e}")))
}

/// The conventional tarball location for registries that omit `dist.tarball`.
///
/// # Errors
/// Returns an error if the registry URL is invalid.
pub fn default_tarball_url(registry_url: &str, name: &str, version: &str) -> Result<String, PkgError> {
    let base = base_url(registry_url)?;
    let file = name.rsplit('/').next().unwrap_or(name);
    base.join(&format!("{name}/-/{file}-{version}.tgz"))
        .map(|u| u.to_string())
        .map_err(|e| PkgError::Registry(format!("Failed to build tarball URL for '{name}': {e}")))
}

fn base_url(registry_url: &str) -> Result<Url, PkgError> {
    let mut raw = registry_url.to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    Url::parse(&raw).map_err(|e| PkgError::Registry(format!("Invalid registry URL '{registry_url}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packument_url() {
        assert_eq!(
            packument_url("https://registry.npmjs.org/", "react").unwrap().as_str(),
            "https://registry.npmjs.org/react"
        );
        assert_eq!(
            packument_url("https://npm.corp/api/npm", "@types/node").unwrap().as_str(),
            "https://npm.corp/api/npm/@types%2Fnode"
        );
        assert!(packument_url("not a url", "x").is_err());
    }

    #[test]
    fn test_default_tarball_url() {
        assert_eq!(
            default_tarball_url("https://registry.npmjs.org", "@types/node", "20.0.0").unwrap(),
            "https://registry.npmjs.org/@types/node/-/node-20.0.0.tgz"
        );
    }

    #[test]
    fn test_packument_deserialize() {
        let packument: Packument = serde_json::from_value(serde_json::json!({
            "name": "react",
            "dist-tags": { "latest": "18.2.0" },
            "versions": {
                "18.2.0": {
                    "name": "react",
                    "version": "18.2.0",
                    "dependencies": { "loose-envify": "^1.1.0" },
                    "dist": {
                        "tarball": "https://registry.npmjs.org/react/-/react-18.2.0.tgz",
                        "integrity": "sha512-abc"
                    }
                }
            }
        }))
        .unwrap();

        assert_eq!(packument.dist_tags["latest"], "18.2.0");
        let manifest = &packument.versions["18.2.0"];
        assert_eq!(manifest.dependencies["loose-envify"], "^1.1.0");
        assert_eq!(
            manifest.dist.as_ref().and_then(|d| d.integrity.as_deref()),
            Some("sha512-abc")
        );
    }
}
