//! Dependency specifier parsing.
//!
//! Parses the `name` + `bare` pairs found in manifests:
//! - `^1.0.0`, `latest`, `1.x` (default registry)
//! - `npm:other@^1` (alias on the default registry)
//! - `custom:foo@^1` (configured registry alias)
//! - `github:user/repo#v1`, `user/repo`, `git+https://host/repo.git#ref`
//! - `file:../local`, `./local`, `../pkg.tgz`
//! - `https://example.com/pkg.tgz`
//! - `workspace:*`, `workspace:^`, `workspace:^1.0.0`
//!
//! and command-line style `name@bare` strings.

use super::error::PkgError;
use crate::config::Config;
use std::fmt;

/// What a specifier points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecKind {
    /// A registry package. `registry` is the configured alias, empty for the
    /// default registry. `package` differs from the spec name for `npm:` aliases.
    Registry {
        registry: String,
        package: String,
        range: String,
    },
    /// A git repository. `remote` is the canonical form written by the user
    /// (`github:user/repo` or a full URL); `committish` selects a ref and
    /// `semver` a tag range (`#semver:^1.0`).
    Git {
        remote: String,
        committish: Option<String>,
        semver: Option<String>,
    },
    /// A local directory or tarball, relative to the depending importer.
    File { path: String },
    /// A tarball URL.
    Remote { url: String },
    /// A sibling workspace member.
    Workspace { range: String },
}

/// A parsed dependency specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spec {
    /// Dependency name (the key in the dependency map).
    pub name: String,
    /// Specifier as written (the value in the dependency map).
    pub bare: String,
    pub kind: SpecKind,
}

/// Known git host shorthands.
const GIT_HOSTS: &[&str] = &["github", "gitlab", "bitbucket", "gist"];

impl Spec {
    /// Parse a `name` + `bare` pair from a dependency map.
    ///
    /// # Errors
    /// Returns an error if the name is invalid or the specifier is malformed.
    pub fn parse(name: &str, bare: &str, config: &Config) -> Result<Self, PkgError> {
        validate_name(name)?;
        let bare_trimmed = bare.trim();
        let kind = parse_bare(name, bare_trimmed, config)?;
        Ok(Self {
            name: name.to_string(),
            bare: bare_trimmed.to_string(),
            kind,
        })
    }

    /// Parse a command-line style `name@bare` (e.g. `react@^18`, `@types/node`).
    ///
    /// A missing `@bare` means `*`.
    ///
    /// # Errors
    /// Returns an error if the string is empty or malformed.
    pub fn parse_args(input: &str, config: &Config) -> Result<Self, PkgError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(PkgError::spec_invalid("Empty package spec"));
        }

        let (name, bare) = split_name_bare(input)?;
        Self::parse(name, bare.unwrap_or("*"), config)
    }

    /// A stable key for memoizing resolutions: two specs with the same key
    /// always resolve to the same package.
    #[must_use]
    pub fn resolution_key(&self) -> String {
        match &self.kind {
            SpecKind::Registry {
                registry,
                package,
                range,
            } => format!("registry:{registry}:{package}@{range}"),
            SpecKind::Git {
                remote,
                committish,
                semver,
            } => format!(
                "git:{remote}#{}{}",
                committish.as_deref().unwrap_or(""),
                semver.as_deref().map(|s| format!("semver:{s}")).unwrap_or_default()
            ),
            SpecKind::File { path } => format!("file:{path}"),
            SpecKind::Remote { url } => format!("remote:{url}"),
            SpecKind::Workspace { range } => format!("workspace:{}@{range}", self.name),
        }
    }
}

impl fmt::Display for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.bare)
    }
}

/// Split `name@bare`, respecting a leading scope `@`.
///
/// # Errors
/// Returns an error for an empty name or an empty bare specifier.
pub fn split_name_bare(input: &str) -> Result<(&str, Option<&str>), PkgError> {
    let search_from = usize::from(input.starts_with('@'));
    let Some(at) = input[search_from..].find('@').map(|i| i + search_from) else {
        return Ok((input, None));
    };

    let name = &input[..at];
    let bare = &input[at + 1..];
    if name.is_empty() {
        return Err(PkgError::spec_invalid(format!(
            "Invalid package spec: empty name in '{input}'"
        )));
    }
    if bare.is_empty() {
        return Err(PkgError::spec_invalid(format!(
            "Invalid package spec: empty version range in '{input}'"
        )));
    }
    Ok((name, Some(bare)))
}

fn parse_bare(name: &str, bare: &str, config: &Config) -> Result<SpecKind, PkgError> {
    if let Some(range) = bare.strip_prefix("workspace:") {
        let range = if range.is_empty() { "*" } else { range };
        return Ok(SpecKind::Workspace {
            range: range.to_string(),
        });
    }

    if let Some(path) = bare.strip_prefix("file:") {
        return Ok(SpecKind::File {
            path: path.to_string(),
        });
    }

    if bare.starts_with("./")
        || bare.starts_with("../")
        || bare.starts_with('/')
        || bare.starts_with("~/")
        || bare == "."
        || bare == ".."
    {
        return Ok(SpecKind::File {
            path: bare.to_string(),
        });
    }

    if bare.starts_with("git+") || bare.starts_with("git://") {
        return Ok(parse_git(bare));
    }

    if bare.starts_with("http://") || bare.starts_with("https://") {
        return Ok(SpecKind::Remote {
            url: bare.to_string(),
        });
    }

    if let Some((prefix, rest)) = bare.split_once(':') {
        if GIT_HOSTS.contains(&prefix) {
            return Ok(parse_git(bare));
        }

        if prefix == "npm" || config.registries.contains_key(prefix) {
            let registry = if prefix == "npm" { "" } else { prefix };
            let (package, range) = split_name_bare(rest)?;
            validate_name(package)?;
            return Ok(SpecKind::Registry {
                registry: registry.to_string(),
                package: package.to_string(),
                range: range.unwrap_or("*").to_string(),
            });
        }

        // `1.0.0 || >2.0.0:` never occurs in a range, so this is an unknown alias.
        if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(PkgError::spec_invalid(format!(
                "Unknown registry alias '{prefix}' in '{name}@{bare}'"
            )));
        }
    }

    if is_github_shorthand(bare) {
        return Ok(parse_git(&format!("github:{bare}")));
    }

    let range = if bare.is_empty() { "*" } else { bare };
    Ok(SpecKind::Registry {
        registry: String::new(),
        package: name.to_string(),
        range: range.to_string(),
    })
}

fn parse_git(bare: &str) -> SpecKind {
    let (remote, fragment) = match bare.split_once('#') {
        Some((remote, fragment)) => (remote, Some(fragment)),
        None => (bare, None),
    };

    let (committish, semver) = match fragment {
        Some(f) if f.starts_with("semver:") => (None, Some(f["semver:".len()..].to_string())),
        Some(f) if !f.is_empty() => (Some(f.to_string()), None),
        _ => (None, None),
    };

    SpecKind::Git {
        remote: remote.to_string(),
        committish,
        semver,
    }
}

/// `user/repo` or `user/repo#ref`, with no scheme and no leading dot/scope.
fn is_github_shorthand(bare: &str) -> bool {
    let path = bare.split('#').next().unwrap_or(bare);
    let mut parts = path.split('/');
    let (Some(user), Some(repo), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let valid = |s: &str| {
        !s.is_empty()
            && !s.starts_with('.')
            && !s.starts_with('@')
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    valid(user) && valid(repo)
}

fn validate_name(name: &str) -> Result<(), PkgError> {
    if name.is_empty() {
        return Err(PkgError::spec_invalid("Empty package name"));
    }

    let unscoped = if let Some(rest) = name.strip_prefix('@') {
        let Some((scope, pkg)) = rest.split_once('/') else {
            return Err(PkgError::spec_invalid(format!(
                "Invalid scoped package: missing '/' in '{name}'"
            )));
        };
        if scope.is_empty() || pkg.is_empty() {
            return Err(PkgError::spec_invalid(format!(
                "Invalid scoped package: empty scope or name in '{name}'"
            )));
        }
        check_name_chars(name, scope)?;
        pkg
    } else {
        name
    };

    check_name_chars(name, unscoped)
}

fn check_name_chars(full: &str, part: &str) -> Result<(), PkgError> {
    if part.starts_with('.') {
        return Err(PkgError::spec_invalid(format!(
            "Package name cannot start with '.': '{full}'"
        )));
    }
    for c in part.chars() {
        if !c.is_alphanumeric() && c != '-' && c != '_' && c != '.' {
            return Err(PkgError::spec_invalid(format!(
                "Invalid character '{c}' in package name '{full}'"
            )));
        }
    }
    Ok(())
}
