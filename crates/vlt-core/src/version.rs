/// The current version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Schema version for cache/data directories.
/// Bump this when changing formats that would break compatibility.
pub const SCHEMA_VERSION: u32 = 1;

/// User agent sent with registry requests.
#[must_use]
pub fn user_agent() -> String {
    format!("vlt/{VERSION}")
}
