//! npm version ranges on top of `semver`.

use super::error::PkgError;
use super::registry::Packument;
use semver::{Version, VersionReq};

/// A parsed npm range: any of the `||` alternatives may match.
#[derive(Debug, Clone)]
pub struct Range {
    alternatives: Vec<VersionReq>,
}

impl Range {
    /// Parse an npm range.
    ///
    /// Handles, on top of plain semver requirements:
    /// - `||` alternatives (`^1.0.0 || ^2.0.0`)
    /// - hyphen ranges (`1.0.0 - 2.0.0`)
    /// - x-ranges (`1.x`, `1.0.x`, `*`, empty)
    /// - space-separated comparators (`>= 2.1.2 < 3.0.0`)
    ///
    /// Invalid alternatives are skipped as long as one parses.
    ///
    /// # Errors
    /// Returns an error if no alternative parses.
    pub fn parse(range: &str) -> Result<Self, PkgError> {
        let alternatives: Vec<VersionReq> = range
            .split("||")
            .map(str::trim)
            .filter_map(|alt| parse_comparator_set(alt).ok())
            .collect();

        if alternatives.is_empty() {
            return Err(PkgError::spec_invalid(format!(
                "Invalid version range '{range}'"
            )));
        }
        Ok(Self { alternatives })
    }

    #[must_use]
    pub fn satisfies(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }

    /// Highest version in `versions` satisfying this range.
    pub fn max_satisfying<'a>(&self, versions: impl IntoIterator<Item = &'a str>) -> Option<Version> {
        versions
            .into_iter()
            .filter_map(|v| Version::parse(v).ok())
            .filter(|v| self.satisfies(v))
            .max()
    }
}

/// Whether `version` satisfies `range`. Unparseable input never satisfies.
#[must_use]
pub fn version_satisfies(version: &str, range: &str) -> bool {
    match (Version::parse(version), Range::parse(range)) {
        (Ok(v), Ok(r)) => r.satisfies(&v),
        _ => false,
    }
}

/// Pick the version of a packument a range (or dist-tag) resolves to.
///
/// # Rules
/// - A dist-tag name (`latest`, `next`) resolves to the tagged version
/// - An exact version resolves to itself if published
/// - Otherwise `dist-tags.latest` wins if it satisfies, else the highest
///   satisfying version
///
/// # Errors
/// Returns an error if the range is invalid or nothing satisfies it.
pub fn resolve_version(packument: &Packument, range: &str) -> Result<String, PkgError> {
    let range = range.trim();

    if let Some(tagged) = packument.dist_tags.get(range) {
        if packument.versions.contains_key(tagged) {
            return Ok(tagged.clone());
        }
        return Err(PkgError::version_not_found(&packument.name, range));
    }

    if Version::parse(range).is_ok() && packument.versions.contains_key(range) {
        return Ok(range.to_string());
    }

    let parsed = Range::parse(range)?;

    if let Some(latest) = packument.dist_tags.get("latest") {
        if packument.versions.contains_key(latest)
            && Version::parse(latest).is_ok_and(|v| parsed.satisfies(&v))
        {
            return Ok(latest.clone());
        }
    }

    parsed
        .max_satisfying(packument.versions.keys().map(String::as_str))
        .map(|v| v.to_string())
        .ok_or_else(|| PkgError::version_not_found(&packument.name, range))
}

/// Parse one `||` alternative.
fn parse_comparator_set(range: &str) -> Result<VersionReq, PkgError> {
    let range = range.trim();
    let invalid = |e: semver::Error| PkgError::spec_invalid(format!("Invalid version range '{range}': {e}"));

    // "1.0.0 - 2.0.0" -> ">=1.0.0, <=2.0.0"
    if let Some((start, end)) = parse_hyphen_range(range) {
        return VersionReq::parse(&format!(">={start}, <={end}")).map_err(invalid);
    }

    // "1.x" -> ">=1.0.0, <2.0.0"
    if has_wildcard(range) {
        return VersionReq::parse(&convert_x_range(range)).map_err(invalid);
    }

    // ">= 2.1.2 < 3.0.0" -> ">=2.1.2, <3.0.0"
    VersionReq::parse(&convert_space_separated_comparators(range)).map_err(invalid)
}

fn is_wild(part: &str) -> bool {
    matches!(part, "x" | "X" | "*")
}

/// Whether any comparator uses an `x`/`*` component (so `1.0.0-next.1` does not count).
fn has_wildcard(range: &str) -> bool {
    range.is_empty()
        || range.split_whitespace().any(|token| {
            token
                .trim_start_matches(['<', '>', '=', '~', '^'])
                .split('.')
                .any(is_wild)
        })
}

fn parse_hyphen_range(range: &str) -> Option<(&str, &str)> {
    let (start, end) = range.split_once(" - ")?;
    let (start, end) = (start.trim(), end.trim());
    (!start.is_empty() && !end.is_empty()).then_some((start, end))
}

/// npm joins comparators with spaces; `semver` wants commas. Operators may
/// be separated from their version (`>= 2.1.2`).
fn convert_space_separated_comparators(range: &str) -> String {
    let mut out = String::new();
    let mut pending_op = String::new();

    for token in range.split_whitespace() {
        if token.chars().any(|c| c.is_ascii_digit()) {
            if !out.is_empty() {
                out.push_str(", ");
            }
            // npm reads a bare version as exact; semver would read it as caret
            if pending_op.is_empty() && token.starts_with(|c: char| c.is_ascii_digit()) {
                out.push('=');
            }
            out.push_str(&pending_op);
            out.push_str(token);
            pending_op.clear();
        } else {
            pending_op.push_str(token);
        }
    }

    if out.is_empty() {
        range.to_string()
    } else {
        out
    }
}

fn convert_x_range(range: &str) -> String {
    let range = range.trim();
    if matches!(range, "" | "*" | "x" | "X") {
        return ">=0.0.0".to_string();
    }

    let parts: Vec<&str> = range.split('.').collect();

    match parts.as_slice() {
        [major, w] | [major, w, _] if is_wild(w) => {
            if let Ok(m) = major.parse::<u64>() {
                return format!(">={m}.0.0, <{}.0.0", m + 1);
            }
        }
        [major, minor, w] if is_wild(w) => {
            if let (Ok(m), Ok(n)) = (major.parse::<u64>(), minor.parse::<u64>()) {
                return format!(">={m}.{n}.0, <{m}.{}.0", n + 1);
            }
        }
        _ => {}
    }

    range.replace(['x', 'X', '*'], "0")
}
