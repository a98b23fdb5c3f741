//! Subresource-integrity strings (`sha512-<base64>`).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;

/// Supported digest algorithms, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Algorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "sha256" => Some(Self::Sha256),
            "sha384" => Some(Self::Sha384),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    fn digest(self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(bytes).to_vec(),
            Self::Sha384 => Sha384::digest(bytes).to_vec(),
            Self::Sha512 => Sha512::digest(bytes).to_vec(),
        }
    }
}

/// One `algo-digest` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Integrity {
    pub algorithm: Algorithm,
    pub digest: String,
}

impl Integrity {
    /// Compute the sha512 integrity of `bytes`.
    #[must_use]
    pub fn compute(bytes: &[u8]) -> Self {
        Self::compute_with(Algorithm::Sha512, bytes)
    }

    #[must_use]
    pub fn compute_with(algorithm: Algorithm, bytes: &[u8]) -> Self {
        Self {
            algorithm,
            digest: STANDARD.encode(algorithm.digest(bytes)),
        }
    }

    /// Parse an SRI string. With several space-separated hashes the strongest
    /// supported one is used; unknown algorithms are ignored.
    #[must_use]
    pub fn parse(sri: &str) -> Option<Self> {
        sri.split_whitespace()
            .filter_map(|part| {
                let (algo, digest) = part.split_once('-')?;
                let algorithm = Algorithm::parse(algo)?;
                // strip `?opt` suffixes allowed by the SRI grammar
                let digest = digest.split('?').next().unwrap_or(digest);
                STANDARD.decode(digest).ok()?;
                Some(Self {
                    algorithm,
                    digest: digest.to_string(),
                })
            })
            .max_by_key(|i| i.algorithm)
    }

    /// Whether `bytes` hash to this digest.
    #[must_use]
    pub fn matches(&self, bytes: &[u8]) -> bool {
        Self::compute_with(self.algorithm, bytes).digest == self.digest
    }
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algorithm.as_str(), self.digest)
    }
}

/// Check `bytes` against an SRI string.
///
/// # Errors
/// Returns the integrity that was actually computed when the check fails or
/// the expected string cannot be parsed.
pub fn verify(expected: &str, bytes: &[u8]) -> Result<(), String> {
    match Integrity::parse(expected) {
        Some(integrity) if integrity.matches(bytes) => Ok(()),
        Some(integrity) => Err(Integrity::compute_with(integrity.algorithm, bytes).to_string()),
        None => Err(Integrity::compute(bytes).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_known_value() {
        // echo -n "" | openssl dgst -sha256 -binary | base64
        let i = Integrity::compute_with(Algorithm::Sha256, b"");
        assert_eq!(
            i.to_string(),
            "sha256-47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }

    #[test]
    fn test_roundtrip_and_match() {
        let i = Integrity::compute(b"hello");
        let parsed = Integrity::parse(&i.to_string()).unwrap();
        assert_eq!(parsed, i);
        assert!(parsed.matches(b"hello"));
        assert!(!parsed.matches(b"hell0"));
    }

    #[test]
    fn test_parse_picks_strongest() {
        let weak = Integrity::compute_with(Algorithm::Sha256, b"x");
        let strong = Integrity::compute(b"x");
        let parsed = Integrity::parse(&format!("{weak} md5-AAAA {strong}")).unwrap();
        assert_eq!(parsed.algorithm, Algorithm::Sha512);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Integrity::parse("").is_none());
        assert!(Integrity::parse("md5-abc").is_none());
        assert!(Integrity::parse("sha512-!!!").is_none());
    }

    #[test]
    fn test_verify_reports_actual() {
        let expected = Integrity::compute(b"a").to_string();
        assert!(verify(&expected, b"a").is_ok());
        let actual = verify(&expected, b"b").unwrap_err();
        assert_eq!(actual, Integrity::compute(b"b").to_string());
    }
}
