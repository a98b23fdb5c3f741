use crate::error::Error;
use crate::paths::cache_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Default npm registry URL.
pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org/";

/// Environment variable overriding the default registry.
pub const REGISTRY_ENV: &str = "VLT_REGISTRY";

/// Environment variable overriding the cache directory.
pub const CACHE_DIR_ENV: &str = "VLT_CACHE_DIR";

/// Environment variable overriding the fetch concurrency.
pub const CONCURRENCY_ENV: &str = "VLT_CONCURRENCY";

/// Runtime configuration for resolution and installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Project directory.
    pub project_root: PathBuf,

    /// Root of the content-addressable request cache.
    pub cache_dir: PathBuf,

    /// Default registry URL.
    pub registry: String,

    /// Named registries (`alias -> url`) usable as `alias:name@range`.
    pub registries: BTreeMap<String, String>,

    /// Git host shorthands (`github -> https://github.com/$1.git`).
    pub git_hosts: BTreeMap<String, String>,

    /// Retries for transient fetch failures.
    pub fetch_retries: usize,

    /// Backoff multiplier between retries.
    pub fetch_retry_factor: u64,

    /// First retry delay in milliseconds.
    pub fetch_retry_mintimeout: u64,

    /// Retry delay cap in milliseconds.
    pub fetch_retry_maxtimeout: u64,

    /// In-memory cache entry bound.
    pub cache_max_entries: usize,

    /// In-memory cache entry age bound in seconds.
    pub cache_ttl_secs: u64,

    /// Values larger than this are cached on disk only.
    pub cache_max_entry_size: usize,

    /// Concurrent fetch/extract operations.
    pub concurrency: usize,

    /// Whether to emit JSON logs.
    pub json_logs: bool,

    /// Verbosity level (0 = INFO, 1 = DEBUG, 2+ = TRACE).
    pub verbosity: u8,
}

fn default_git_hosts() -> BTreeMap<String, String> {
    [
        ("github", "https://github.com/$1.git"),
        ("gitlab", "https://gitlab.com/$1.git"),
        ("bitbucket", "https://bitbucket.org/$1.git"),
        ("gist", "https://gist.github.com/$1.git"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            cache_dir: cache_dir(),
            registry: DEFAULT_REGISTRY.to_string(),
            registries: BTreeMap::new(),
            git_hosts: default_git_hosts(),
            fetch_retries: 3,
            fetch_retry_factor: 2,
            fetch_retry_mintimeout: 10,
            fetch_retry_maxtimeout: 60_000,
            cache_max_entries: 10_000,
            cache_ttl_secs: 300,
            cache_max_entry_size: 4 * 1024 * 1024,
            concurrency: 32,
            json_logs: false,
            verbosity: 0,
        }
    }
}

impl Config {
    /// Create a new config for the given project directory.
    #[must_use]
    pub fn new(project_root: PathBuf) -> Self {
        Self {
            project_root,
            ..Default::default()
        }
    }

    /// Defaults with `VLT_REGISTRY`, `VLT_CACHE_DIR` and `VLT_CONCURRENCY` applied.
    ///
    /// # Errors
    /// Returns an error if `VLT_CONCURRENCY` is not a positive integer.
    pub fn from_env(project_root: PathBuf) -> Result<Self, Error> {
        let mut config = Self::new(project_root);
        if let Ok(registry) = std::env::var(REGISTRY_ENV) {
            config.registry = registry;
        }
        if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Ok(raw) = std::env::var(CONCURRENCY_ENV) {
            config.concurrency = raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| Error::invalid_config(CONCURRENCY_ENV, &raw))?;
        }
        Ok(config)
    }

    /// Set the cache directory.
    #[must_use]
    pub fn with_cache_dir(mut self, dir: PathBuf) -> Self {
        self.cache_dir = dir;
        self
    }

    /// Set the default registry.
    #[must_use]
    pub fn with_registry(mut self, url: impl Into<String>) -> Self {
        self.registry = url.into();
        self
    }

    /// Add a named registry.
    #[must_use]
    pub fn with_registry_alias(mut self, alias: &str, url: &str) -> Self {
        self.registries.insert(alias.to_string(), url.to_string());
        self
    }

    /// Set the retry budget.
    #[must_use]
    pub fn with_fetch_retries(mut self, retries: usize) -> Self {
        self.fetch_retries = retries;
        self
    }

    /// Set the concurrency limit.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set verbosity level.
    #[must_use]
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Set JSON log output.
    #[must_use]
    pub fn with_json_logs(mut self, json: bool) -> Self {
        self.json_logs = json;
        self
    }

    /// URL of a registry alias; the empty alias is the default registry.
    #[must_use]
    pub fn registry_url(&self, alias: &str) -> Option<&str> {
        if alias.is_empty() {
            Some(&self.registry)
        } else {
            self.registries.get(alias).map(String::as_str)
        }
    }

    /// Clone URL for a git host shorthand such as `github:user/repo`.
    #[must_use]
    pub fn git_host_url(&self, host: &str, path: &str) -> Option<String> {
        self.git_hosts
            .get(host)
            .map(|template| template.replace("$1", path))
    }

    /// Look up a setting by its key name, rendered as a string.
    ///
    /// `registries.<alias>` and `git-hosts.<host>` address map entries.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(alias) = key.strip_prefix("registries.") {
            return self.registries.get(alias).cloned();
        }
        if let Some(host) = key.strip_prefix("git-hosts.") {
            return self.git_hosts.get(host).cloned();
        }
        let value = match key {
            "project-root" => self.project_root.display().to_string(),
            "cache" => self.cache_dir.display().to_string(),
            "registry" => self.registry.clone(),
            "fetch-retries" => self.fetch_retries.to_string(),
            "fetch-retry-factor" => self.fetch_retry_factor.to_string(),
            "fetch-retry-mintimeout" => self.fetch_retry_mintimeout.to_string(),
            "fetch-retry-maxtimeout" => self.fetch_retry_maxtimeout.to_string(),
            "cache-max-entries" => self.cache_max_entries.to_string(),
            "cache-ttl" => self.cache_ttl_secs.to_string(),
            "cache-max-entry-size" => self.cache_max_entry_size.to_string(),
            "concurrency" => self.concurrency.to_string(),
            "json-logs" => self.json_logs.to_string(),
            "verbosity" => self.verbosity.to_string(),
            _ => return None,
        };
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = Config::new(PathBuf::from("/proj"));
        assert_eq!(config.get("registry").as_deref(), Some(DEFAULT_REGISTRY));
        assert_eq!(config.get("fetch-retries").as_deref(), Some("3"));
        assert_eq!(config.get("fetch-retry-factor").as_deref(), Some("2"));
        assert_eq!(config.get("fetch-retry-mintimeout").as_deref(), Some("10"));
        assert_eq!(config.get("fetch-retry-maxtimeout").as_deref(), Some("60000"));
        assert_eq!(config.get("project-root").as_deref(), Some("/proj"));
        assert_eq!(config.get("nope"), None);
    }

    #[test]
    fn test_registry_url() {
        let config = Config::default().with_registry_alias("corp", "https://npm.corp/");
        assert_eq!(config.registry_url(""), Some(DEFAULT_REGISTRY));
        assert_eq!(config.registry_url("corp"), Some("https://npm.corp/"));
        assert_eq!(config.registry_url("other"), None);
        assert_eq!(config.get("registries.corp").as_deref(), Some("https://npm.corp/"));
    }

    #[test]
    fn test_git_host_url() {
        let config = Config::default();
        assert_eq!(
            config.git_host_url("github", "user/repo").as_deref(),
            Some("https://github.com/user/repo.git")
        );
        assert_eq!(config.git_host_url("sourcehut", "x/y"), None);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var(REGISTRY_ENV, "http://127.0.0.1:9/");
        std::env::set_var(CACHE_DIR_ENV, "/tmp/vlt-cache");
        std::env::set_var(CONCURRENCY_ENV, "4");
        let config = Config::from_env(PathBuf::from("/proj")).unwrap();
        std::env::remove_var(REGISTRY_ENV);
        std::env::remove_var(CACHE_DIR_ENV);
        std::env::remove_var(CONCURRENCY_ENV);

        assert_eq!(config.registry, "http://127.0.0.1:9/");
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/vlt-cache"));
        assert_eq!(config.concurrency, 4);
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_concurrency() {
        std::env::set_var(CONCURRENCY_ENV, "zero");
        let result = Config::from_env(PathBuf::from("/proj"));
        std::env::remove_var(CONCURRENCY_ENV);
        assert!(result.is_err());
    }

    #[test]
    fn test_builder() {
        let config = Config::default()
            .with_verbosity(2)
            .with_json_logs(true)
            .with_concurrency(0)
            .with_fetch_retries(0);
        assert_eq!(config.verbosity, 2);
        assert!(config.json_logs);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.fetch_retries, 0);
    }
}
