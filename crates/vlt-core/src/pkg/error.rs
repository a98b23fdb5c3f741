//! Package manager error types.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Package manager error codes.
pub mod codes {
    pub const PKG_MALFORMED_ID: &str = "PKG_MALFORMED_ID";
    pub const PKG_UNCONFIGURED_REGISTRY: &str = "PKG_UNCONFIGURED_REGISTRY";
    pub const PKG_MISSING_DEPENDENCY: &str = "PKG_MISSING_DEPENDENCY";
    pub const PKG_FETCH_FAILED: &str = "PKG_FETCH_FAILED";
    pub const PKG_INTEGRITY_MISMATCH: &str = "PKG_INTEGRITY_MISMATCH";
    pub const PKG_PARTIAL_REIFY: &str = "PKG_PARTIAL_REIFY";

    pub const PKG_SPEC_INVALID: &str = "PKG_SPEC_INVALID";
    pub const PKG_NOT_FOUND: &str = "PKG_NOT_FOUND";
    pub const PKG_VERSION_NOT_FOUND: &str = "PKG_VERSION_NOT_FOUND";
    pub const PKG_REGISTRY_ERROR: &str = "PKG_REGISTRY_ERROR";
    pub const PKG_EXTRACT_FAILED: &str = "PKG_EXTRACT_FAILED";
    pub const PKG_LINK_FAILED: &str = "PKG_LINK_FAILED";
    pub const PKG_MANIFEST_INVALID: &str = "PKG_MANIFEST_INVALID";
    pub const PKG_LOCKFILE_INVALID: &str = "PKG_LOCKFILE_INVALID";
    pub const PKG_GIT_FAILED: &str = "PKG_GIT_FAILED";
    pub const PKG_CACHE_ERROR: &str = "PKG_CACHE_ERROR";
    pub const PKG_IO: &str = "PKG_IO";
}

/// Package manager error.
#[derive(Error, Debug)]
pub enum PkgError {
    /// A DepID string does not match the segment grammar.
    #[error("{}: malformed dependency id '{id}': {reason}", codes::PKG_MALFORMED_ID)]
    MalformedId { id: String, reason: String },

    /// An installed store entry references a registry alias that is not configured.
    #[error(
        "{}: '{id}' references registry '{alias}', which is not configured",
        codes::PKG_UNCONFIGURED_REGISTRY
    )]
    UnconfiguredRegistry { alias: String, id: String },

    /// A required dependency has no resolution.
    #[error("{}: {from} requires {name}@{spec}, which could not be resolved", codes::PKG_MISSING_DEPENDENCY)]
    MissingDependency {
        from: String,
        name: String,
        spec: String,
    },

    /// A network or registry fetch failed after the retry budget was spent.
    #[error("{}: {target}: {message}", codes::PKG_FETCH_FAILED)]
    Fetch {
        target: String,
        message: String,
        /// Whether a retry could plausibly succeed.
        transient: bool,
    },

    /// Downloaded bytes do not match the expected integrity.
    #[error(
        "{}: {target}: expected {expected}, got {actual}",
        codes::PKG_INTEGRITY_MISMATCH
    )]
    IntegrityMismatch {
        target: String,
        expected: String,
        actual: String,
    },

    /// A reify step failed; every filesystem mutation was rolled back.
    #[error("{}: install rolled back: {source}", codes::PKG_PARTIAL_REIFY)]
    PartialReify {
        #[source]
        source: Box<PkgError>,
    },

    #[error("{}: {0}", codes::PKG_SPEC_INVALID)]
    SpecInvalid(String),

    #[error("{}: package not found: {0}", codes::PKG_NOT_FOUND)]
    NotFound(String),

    #[error("{}: no version of {name} satisfies range: {range}", codes::PKG_VERSION_NOT_FOUND)]
    VersionNotFound { name: String, range: String },

    #[error("{}: {0}", codes::PKG_REGISTRY_ERROR)]
    Registry(String),

    #[error("{}: {0}", codes::PKG_EXTRACT_FAILED)]
    Extract(String),

    #[error("{}: {0}", codes::PKG_LINK_FAILED)]
    Link(String),

    #[error("{}: {path}: {message}", codes::PKG_MANIFEST_INVALID)]
    ManifestInvalid { path: PathBuf, message: String },

    #[error("{}: {0}", codes::PKG_LOCKFILE_INVALID)]
    Lockfile(String),

    #[error("{}: {0}", codes::PKG_GIT_FAILED)]
    Git(String),

    #[error("{}: {0}", codes::PKG_CACHE_ERROR)]
    Cache(String),

    #[error("{}: {path}: {source}", codes::PKG_IO)]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PkgError {
    /// Get the stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedId { .. } => codes::PKG_MALFORMED_ID,
            Self::UnconfiguredRegistry { .. } => codes::PKG_UNCONFIGURED_REGISTRY,
            Self::MissingDependency { .. } => codes::PKG_MISSING_DEPENDENCY,
            Self::Fetch { .. } => codes::PKG_FETCH_FAILED,
            Self::IntegrityMismatch { .. } => codes::PKG_INTEGRITY_MISMATCH,
            Self::PartialReify { .. } => codes::PKG_PARTIAL_REIFY,
            Self::SpecInvalid(_) => codes::PKG_SPEC_INVALID,
            Self::NotFound(_) => codes::PKG_NOT_FOUND,
            Self::VersionNotFound { .. } => codes::PKG_VERSION_NOT_FOUND,
            Self::Registry(_) => codes::PKG_REGISTRY_ERROR,
            Self::Extract(_) => codes::PKG_EXTRACT_FAILED,
            Self::Link(_) => codes::PKG_LINK_FAILED,
            Self::ManifestInvalid { .. } => codes::PKG_MANIFEST_INVALID,
            Self::Lockfile(_) => codes::PKG_LOCKFILE_INVALID,
            Self::Git(_) => codes::PKG_GIT_FAILED,
            Self::Cache(_) => codes::PKG_CACHE_ERROR,
            Self::Io { .. } => codes::PKG_IO,
        }
    }

    /// Create a malformed id error.
    pub fn malformed_id(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedId {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create a fetch error that retrying will not fix.
    pub fn fetch(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            target: target.into(),
            message: message.into(),
            transient: false,
        }
    }

    /// Create a fetch error that may succeed on retry.
    pub fn fetch_transient(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            target: target.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// Create a spec invalid error.
    pub fn spec_invalid(msg: impl Into<String>) -> Self {
        Self::SpecInvalid(msg.into())
    }

    /// Create a version not found error.
    #[must_use]
    pub fn version_not_found(name: &str, range: &str) -> Self {
        Self::VersionNotFound {
            name: name.to_string(),
            range: range.to_string(),
        }
    }

    /// Create a manifest invalid error.
    pub fn manifest_invalid(path: &Path, msg: impl Into<String>) -> Self {
        Self::ManifestInvalid {
            path: path.to_path_buf(),
            message: msg.into(),
        }
    }

    /// Attach a path to an IO error.
    #[must_use]
    pub fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Wrap a step failure after rollback.
    #[must_use]
    pub fn partial_reify(source: PkgError) -> Self {
        Self::PartialReify {
            source: Box::new(source),
        }
    }

    /// Whether retrying the failed operation could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Fetch { transient: true, .. })
    }

    /// Whether this error means "the package does not exist" rather than
    /// "something went wrong while looking".
    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::VersionNotFound { .. } | Self::MissingDependency { .. }
        )
    }
}

// Coalesced fetches hand the same outcome to every waiter, so errors must be
// duplicable even though `io::Error` is not `Clone`.
impl Clone for PkgError {
    fn clone(&self) -> Self {
        match self {
            Self::MalformedId { id, reason } => Self::MalformedId {
                id: id.clone(),
                reason: reason.clone(),
            },
            Self::UnconfiguredRegistry { alias, id } => Self::UnconfiguredRegistry {
                alias: alias.clone(),
                id: id.clone(),
            },
            Self::MissingDependency { from, name, spec } => Self::MissingDependency {
                from: from.clone(),
                name: name.clone(),
                spec: spec.clone(),
            },
            Self::Fetch {
                target,
                message,
                transient,
            } => Self::Fetch {
                target: target.clone(),
                message: message.clone(),
                transient: *transient,
            },
            Self::IntegrityMismatch {
                target,
                expected,
                actual,
            } => Self::IntegrityMismatch {
                target: target.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            },
            Self::PartialReify { source } => Self::PartialReify {
                source: source.clone(),
            },
            Self::SpecInvalid(m) => Self::SpecInvalid(m.clone()),
            Self::NotFound(m) => Self::NotFound(m.clone()),
            Self::VersionNotFound { name, range } => Self::VersionNotFound {
                name: name.clone(),
                range: range.clone(),
            },
            Self::Registry(m) => Self::Registry(m.clone()),
            Self::Extract(m) => Self::Extract(m.clone()),
            Self::Link(m) => Self::Link(m.clone()),
            Self::ManifestInvalid { path, message } => Self::ManifestInvalid {
                path: path.clone(),
                message: message.clone(),
            },
            Self::Lockfile(m) => Self::Lockfile(m.clone()),
            Self::Git(m) => Self::Git(m.clone()),
            Self::Cache(m) => Self::Cache(m.clone()),
            Self::Io { path, source } => Self::Io {
                path: path.clone(),
                source: io::Error::new(source.kind(), source.to_string()),
            },
        }
    }
}

impl From<reqwest::Error> for PkgError {
    fn from(e: reqwest::Error) -> Self {
        let target = e
            .url()
            .map_or_else(|| "request".to_string(), ToString::to_string);
        if e.is_timeout() {
            Self::fetch_transient(target, format!("Request timed out: {e}"))
        } else if e.is_connect() {
            Self::fetch_transient(target, format!("Connection failed: {e}"))
        } else if e.is_decode() || e.is_body() {
            Self::fetch_transient(target, e.to_string())
        } else {
            Self::fetch(target, e.to_string())
        }
    }
}

impl From<super::cache::CacheError> for PkgError {
    fn from(e: super::cache::CacheError) -> Self {
        match e {
            super::cache::CacheError::Integrity {
                key,
                expected,
                actual,
            } => Self::IntegrityMismatch {
                target: key,
                expected,
                actual,
            },
            other => Self::Cache(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        let err = PkgError::spec_invalid("bad spec");
        assert_eq!(err.code(), codes::PKG_SPEC_INVALID);
        assert!(err.to_string().contains(codes::PKG_SPEC_INVALID));
    }

    #[test]
    fn test_error_codes_uppercase() {
        let all_codes = [
            codes::PKG_MALFORMED_ID,
            codes::PKG_UNCONFIGURED_REGISTRY,
            codes::PKG_MISSING_DEPENDENCY,
            codes::PKG_FETCH_FAILED,
            codes::PKG_INTEGRITY_MISMATCH,
            codes::PKG_PARTIAL_REIFY,
            codes::PKG_SPEC_INVALID,
            codes::PKG_NOT_FOUND,
            codes::PKG_VERSION_NOT_FOUND,
            codes::PKG_REGISTRY_ERROR,
            codes::PKG_EXTRACT_FAILED,
            codes::PKG_LINK_FAILED,
            codes::PKG_MANIFEST_INVALID,
            codes::PKG_LOCKFILE_INVALID,
            codes::PKG_GIT_FAILED,
            codes::PKG_CACHE_ERROR,
            codes::PKG_IO,
        ];

        for code in all_codes {
            assert!(
                code.chars().all(|c| c.is_uppercase() || c == '_'),
                "Error code '{code}' should be SCREAMING_SNAKE_CASE"
            );
        }
    }

    #[test]
    fn test_partial_reify_keeps_cause() {
        let cause = PkgError::Link("bin escapes node_modules".into());
        let err = PkgError::partial_reify(cause);
        assert_eq!(err.code(), codes::PKG_PARTIAL_REIFY);
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains(codes::PKG_LINK_FAILED));
    }

    #[test]
    fn test_clone_keeps_io_kind() {
        let err = PkgError::io(Path::new("/x"), io::Error::new(io::ErrorKind::NotFound, "gone"));
        match err.clone() {
            PkgError::Io { path, source } => {
                assert_eq!(path, PathBuf::from("/x"));
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(PkgError::fetch_transient("x", "reset").is_transient());
        assert!(!PkgError::fetch("x", "404").is_transient());
        assert!(PkgError::NotFound("x".into()).is_missing());
        assert!(!PkgError::Registry("x".into()).is_missing());
    }
}
