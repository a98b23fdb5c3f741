//! Dependency identifiers.
//!
//! A [`DepId`] is a compact, sortable string naming one resolved package
//! placement. It doubles as the store directory name, so the encoding never
//! produces path separators or characters that are invalid in file names.
//!
//! Grammar (segments joined by `·`):
//!
//! ```text
//! registry:   ·<registry-alias>·<name>@<version>
//! git:        git·<remote>·<committish>
//! file:       file·<path>
//! workspace:  workspace·<path>
//! remote:     remote·<url>
//! ```
//!
//! Inside a segment `/` is written as `+`, and `%`, `·`, `+` plus the
//! characters Windows forbids in file names are percent-escaped.

use super::error::PkgError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Segment delimiter.
pub const DELIMITER: char = '·';

/// Origin kind of a resolved package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Origin {
    Registry,
    Git,
    File,
    Workspace,
    Remote,
}

impl Origin {
    /// Prefix written as the first DepID segment.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Registry => "",
            Self::Git => "git",
            Self::File => "file",
            Self::Workspace => "workspace",
            Self::Remote => "remote",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "" => Some(Self::Registry),
            "git" => Some(Self::Git),
            "file" => Some(Self::File),
            "workspace" => Some(Self::Workspace),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Registry => "registry",
            other => other.prefix(),
        })
    }
}

/// The decoded form of a [`DepId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DepIdTuple {
    /// `registry` is the configured alias; empty means the default registry.
    Registry {
        registry: String,
        name: String,
        version: String,
    },
    Git {
        remote: String,
        committish: String,
    },
    /// `path` is relative to the project root.
    File { path: String },
    /// `path` is relative to the project root.
    Workspace { path: String },
    Remote { url: String },
}

impl DepIdTuple {
    /// The origin kind of this tuple.
    #[must_use]
    pub fn origin(&self) -> Origin {
        match self {
            Self::Registry { .. } => Origin::Registry,
            Self::Git { .. } => Origin::Git,
            Self::File { .. } => Origin::File,
            Self::Workspace { .. } => Origin::Workspace,
            Self::Remote { .. } => Origin::Remote,
        }
    }
}

/// A resolved package identifier.
///
/// Equality, ordering and hashing use the encoded string only.
#[derive(Clone)]
pub struct DepId {
    encoded: String,
    tuple: DepIdTuple,
}

impl DepId {
    /// Encode a tuple. Never fails: unsafe characters are escaped.
    #[must_use]
    pub fn encode(tuple: DepIdTuple) -> Self {
        let encoded = encode(&tuple);
        Self { encoded, tuple }
    }

    /// Decode an encoded id.
    ///
    /// # Errors
    /// Returns `MalformedId` if the string does not match the grammar.
    pub fn parse(id: &str) -> Result<Self, PkgError> {
        let tuple = decode(id)?;
        // One tuple has exactly one spelling; anything else would compare unequal.
        let encoded = encode(&tuple);
        if encoded != id {
            return Err(PkgError::malformed_id(
                id,
                format!("not in canonical form, expected '{encoded}'"),
            ));
        }
        Ok(Self { encoded, tuple })
    }

    /// Registry id for `name@version` on the given alias (empty = default).
    #[must_use]
    pub fn registry(registry: &str, name: &str, version: &str) -> Self {
        Self::encode(DepIdTuple::Registry {
            registry: registry.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        })
    }

    /// Git id for a remote at a resolved committish.
    #[must_use]
    pub fn git(remote: &str, committish: &str) -> Self {
        Self::encode(DepIdTuple::Git {
            remote: remote.to_string(),
            committish: committish.to_string(),
        })
    }

    /// File id for a path relative to the project root.
    #[must_use]
    pub fn file(path: &str) -> Self {
        Self::encode(DepIdTuple::File {
            path: path.to_string(),
        })
    }

    /// Workspace id for a path relative to the project root.
    #[must_use]
    pub fn workspace(path: &str) -> Self {
        Self::encode(DepIdTuple::Workspace {
            path: path.to_string(),
        })
    }

    /// Remote tarball id.
    #[must_use]
    pub fn remote(url: &str) -> Self {
        Self::encode(DepIdTuple::Remote {
            url: url.to_string(),
        })
    }

    /// The id of the root project, `file·.`.
    #[must_use]
    pub fn main_importer() -> Self {
        Self::file(".")
    }

    /// The encoded string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// The decoded tuple.
    #[must_use]
    pub fn tuple(&self) -> &DepIdTuple {
        &self.tuple
    }

    #[must_use]
    pub fn origin(&self) -> Origin {
        self.tuple.origin()
    }

    /// Registry alias for registry ids.
    #[must_use]
    pub fn registry_alias(&self) -> Option<&str> {
        match &self.tuple {
            DepIdTuple::Registry { registry, .. } => Some(registry),
            _ => None,
        }
    }

    /// Package name for registry ids.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match &self.tuple {
            DepIdTuple::Registry { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Exact version for registry ids.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        match &self.tuple {
            DepIdTuple::Registry { version, .. } => Some(version),
            _ => None,
        }
    }

    /// A short human-readable form, e.g. `lodash@4.17.21` or `file:./local`.
    #[must_use]
    pub fn human(&self) -> String {
        match &self.tuple {
            DepIdTuple::Registry {
                registry,
                name,
                version,
            } if registry.is_empty() => format!("{name}@{version}"),
            DepIdTuple::Registry {
                registry,
                name,
                version,
            } => format!("{registry}:{name}@{version}"),
            DepIdTuple::Git { remote, committish } => format!("{remote}#{committish}"),
            DepIdTuple::File { path } => format!("file:{path}"),
            DepIdTuple::Workspace { path } => format!("workspace:{path}"),
            DepIdTuple::Remote { url } => url.clone(),
        }
    }
}

impl PartialEq for DepId {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for DepId {}

impl Hash for DepId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.encoded.hash(state);
    }
}

impl PartialOrd for DepId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DepId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.encoded.cmp(&other.encoded)
    }
}

impl fmt::Debug for DepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DepId({})", self.encoded)
    }
}

impl fmt::Display for DepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl std::str::FromStr for DepId {
    type Err = PkgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for DepId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encoded)
    }
}

impl<'de> Deserialize<'de> for DepId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Characters escaped inside a segment, with their escape sequences.
const ESCAPES: &[(char, &str)] = &[
    ('%', "%25"),
    ('+', "%2B"),
    ('·', "%B7"),
    (':', "%3A"),
    ('\\', "%5C"),
    ('*', "%2A"),
    ('?', "%3F"),
    ('"', "%22"),
    ('<', "%3C"),
    ('>', "%3E"),
    ('|', "%7C"),
    ('@', "%40"),
];

fn escape_segment(raw: &str) -> String {
    escape_with(raw, false)
}

/// Escape a registry name or version. `@` separates the two, so it is
/// escaped everywhere except a scope's leading `@`.
fn escape_spec_part(raw: &str) -> String {
    match raw.strip_prefix('@') {
        Some(rest) => format!("@{}", escape_with(rest, true)),
        None => escape_with(raw, true),
    }
}

fn escape_with(raw: &str, escape_at: bool) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '/' {
            out.push('+');
        } else if c == '@' && !escape_at {
            out.push(c);
        } else if let Some((_, esc)) = ESCAPES.iter().find(|(ch, _)| *ch == c) {
            out.push_str(esc);
        } else {
            out.push(c);
        }
    }
    out
}

fn unescape_segment(id: &str, segment: &str) -> Result<String, PkgError> {
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '+' => out.push('/'),
            '%' => {
                let seq = segment.get(i..i + 3).ok_or_else(|| {
                    PkgError::malformed_id(id, "truncated escape sequence")
                })?;
                let (ch, _) = ESCAPES
                    .iter()
                    .find(|(_, esc)| *esc == seq)
                    .ok_or_else(|| PkgError::malformed_id(id, format!("unknown escape '{seq}'")))?;
                out.push(*ch);
                chars.next();
                chars.next();
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

fn encode(tuple: &DepIdTuple) -> String {
    let mut out = String::from(tuple.origin().prefix());
    out.push(DELIMITER);
    match tuple {
        DepIdTuple::Registry {
            registry,
            name,
            version,
        } => {
            out.push_str(&escape_segment(registry));
            out.push(DELIMITER);
            out.push_str(&escape_spec_part(name));
            out.push('@');
            out.push_str(&escape_with(version, true));
        }
        DepIdTuple::Git { remote, committish } => {
            out.push_str(&escape_segment(remote));
            out.push(DELIMITER);
            out.push_str(&escape_segment(committish));
        }
        DepIdTuple::File { path } | DepIdTuple::Workspace { path } => {
            out.push_str(&escape_segment(path));
        }
        DepIdTuple::Remote { url } => out.push_str(&escape_segment(url)),
    }
    out
}

fn decode(id: &str) -> Result<DepIdTuple, PkgError> {
    let segments: Vec<&str> = id.split(DELIMITER).collect();
    let origin = Origin::from_prefix(segments[0])
        .ok_or_else(|| PkgError::malformed_id(id, format!("unknown origin '{}'", segments[0])))?;

    let expected = match origin {
        Origin::Registry | Origin::Git => 3,
        Origin::File | Origin::Workspace | Origin::Remote => 2,
    };
    if segments.len() != expected {
        return Err(PkgError::malformed_id(
            id,
            format!(
                "expected {expected} segments for {origin} id, found {}",
                segments.len()
            ),
        ));
    }

    Ok(match origin {
        Origin::Registry => {
            let registry = unescape_segment(id, segments[1])?;
            let spec = segments[2];
            // Skip a leading '@' so scoped names are not split.
            let at = spec
                .char_indices()
                .skip(1)
                .filter(|(_, c)| *c == '@')
                .map(|(i, _)| i)
                .last()
                .ok_or_else(|| PkgError::malformed_id(id, "missing '@version'"))?;
            let name = unescape_segment(id, &spec[..at])?;
            let version = unescape_segment(id, &spec[at + 1..])?;
            if name.is_empty() || version.is_empty() {
                return Err(PkgError::malformed_id(id, "empty name or version"));
            }
            DepIdTuple::Registry {
                registry,
                name,
                version,
            }
        }
        Origin::Git => DepIdTuple::Git {
            remote: unescape_segment(id, segments[1])?,
            committish: unescape_segment(id, segments[2])?,
        },
        Origin::File => DepIdTuple::File {
            path: unescape_segment(id, segments[1])?,
        },
        Origin::Workspace => DepIdTuple::Workspace {
            path: unescape_segment(id, segments[1])?,
        },
        Origin::Remote => DepIdTuple::Remote {
            url: unescape_segment(id, segments[1])?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::error::codes;

    fn all_kinds() -> Vec<DepIdTuple> {
        vec![
            DepIdTuple::Registry {
                registry: String::new(),
                name: "lodash".into(),
                version: "4.17.21".into(),
            },
            DepIdTuple::Registry {
                registry: "custom".into(),
                name: "@types/node".into(),
                version: "20.0.0+build.1".into(),
            },
            DepIdTuple::Git {
                remote: "github:user/repo".into(),
                committish: "0123abcd".into(),
            },
            DepIdTuple::Git {
                remote: "git+ssh://git@host.com:org/repo.git".into(),
                committish: "v1.0.0".into(),
            },
            DepIdTuple::File {
                path: "../local/pkg".into(),
            },
            DepIdTuple::File { path: ".".into() },
            DepIdTuple::Workspace {
                path: "packages/a·b%c+d".into(),
            },
            DepIdTuple::Remote {
                url: "https://example.com/pkg.tgz?x=1".into(),
            },
        ]
    }

    #[test]
    fn test_round_trip_all_origins() {
        for tuple in all_kinds() {
            let id = DepId::encode(tuple.clone());
            let decoded = DepId::parse(id.as_str()).unwrap();
            assert_eq!(decoded.tuple(), &tuple, "round trip of {id}");
            assert_eq!(decoded, id);
        }
    }

    #[test]
    fn test_encoding_is_injective() {
        let ids: std::collections::HashSet<String> = all_kinds()
            .into_iter()
            .map(|t| DepId::encode(t).as_str().to_string())
            .collect();
        assert_eq!(ids.len(), all_kinds().len());

        // Same characters split differently across segments must not collide.
        let a = DepId::git("a·b", "c");
        let b = DepId::git("a", "b·c");
        assert_ne!(a, b);
    }

    #[test]
    fn test_at_sign_in_name_or_version_does_not_collide() {
        let a = DepId::registry("", "a", "1@2");
        let b = DepId::registry("", "a@1", "2");
        assert_ne!(a, b);
        assert_eq!(a.as_str(), "··a@1%402");
        assert_eq!(b.as_str(), "··a%401@2");

        for id in [a, b, DepId::registry("", "@scope/x@y", "1.0.0@tag")] {
            let decoded = DepId::parse(id.as_str()).unwrap();
            assert_eq!(decoded.tuple(), id.tuple());
        }
    }

    #[test]
    fn test_non_canonical_spellings_rejected() {
        // Same tuple as "··@types+node@20.0.0", spelled differently
        for bad in ["··@types/node@20.0.0", "··a@1@2", "file·%40x"] {
            let err = DepId::parse(bad).unwrap_err();
            assert_eq!(err.code(), codes::PKG_MALFORMED_ID, "{bad}");
        }
        assert!(DepId::parse("··@types+node@20.0.0").is_ok());
    }

    #[test]
    fn test_encoded_is_a_single_path_component() {
        for tuple in all_kinds() {
            let id = DepId::encode(tuple);
            assert!(!id.as_str().contains('/'), "{id}");
            assert!(!id.as_str().contains(':'), "{id}");
            assert!(!id.as_str().contains('\\'), "{id}");
        }
    }

    #[test]
    fn test_known_encodings() {
        assert_eq!(DepId::registry("", "lodash", "4.17.21").as_str(), "··lodash@4.17.21");
        assert_eq!(
            DepId::registry("", "@types/node", "20.0.0").as_str(),
            "··@types+node@20.0.0"
        );
        assert_eq!(DepId::main_importer().as_str(), "file·.");
        assert_eq!(
            DepId::workspace("packages/a").as_str(),
            "workspace·packages+a"
        );
    }

    #[test]
    fn test_ids_sort_by_origin_then_name() {
        let mut ids = vec![
            DepId::workspace("packages/a"),
            DepId::registry("", "zod", "3.0.0"),
            DepId::file("."),
            DepId::registry("", "axios", "1.0.0"),
            DepId::git("github:a/b", "x"),
        ];
        ids.sort();
        let origins: Vec<Origin> = ids.iter().map(DepId::origin).collect();
        assert_eq!(
            origins,
            vec![
                Origin::File,
                Origin::Git,
                Origin::Workspace,
                Origin::Registry,
                Origin::Registry
            ]
        );
        assert_eq!(ids[3].human(), "axios@1.0.0");
        assert_eq!(ids[4].human(), "zod@3.0.0");
    }

    #[test]
    fn test_malformed_ids() {
        for bad in [
            "npm·x·y@1",
            "··lodash",
            "··@scope",
            "file·a·b",
            "git·only",
            "··lodash@1%ZZ",
            "··lodash@1%2",
            "··@1.0.0",
        ] {
            let err = DepId::parse(bad).unwrap_err();
            assert_eq!(err.code(), codes::PKG_MALFORMED_ID, "{bad}");
        }
    }

    #[test]
    fn test_serde_as_string() {
        let id = DepId::registry("", "lodash", "4.17.21");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"··lodash@4.17.21\"");
        let back: DepId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<DepId>("\"bogus\"").is_err());
    }

    #[test]
    fn test_human() {
        assert_eq!(DepId::registry("custom", "a", "1.0.0").human(), "custom:a@1.0.0");
        assert_eq!(DepId::file("./x").human(), "file:./x");
        assert_eq!(DepId::git("github:a/b", "abc").human(), "github:a/b#abc");
    }
}
