//! Tracing subscriber setup for binaries embedding the core.
//!
//! The library itself only emits events; nothing is printed unless a
//! subscriber is installed.

use crate::error::Error;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Map a verbosity count to a level: 0 = INFO, 1 = DEBUG, 2+ = TRACE.
#[must_use]
pub fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` is honoured; the verbosity sets the level for `vlt_core`.
/// With `json` set, stable JSON lines are written to stderr:
/// ```json
/// {"timestamp":"...","level":"INFO","target":"vlt_core::pkg::reify","fields":{"message":"..."}}
/// ```
///
/// # Errors
/// Returns an error if a global subscriber is already installed.
pub fn try_init(verbosity: u8, json: bool) -> Result<(), Error> {
    let level = level_for(verbosity);

    let directive = format!("vlt_core={level}")
        .parse()
        .map_err(|e| Error::Logging(format!("{e}")))?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"))
        .add_directive(directive);

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = if json {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        subscriber
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| Error::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for() {
        assert_eq!(level_for(0), Level::INFO);
        assert_eq!(level_for(1), Level::DEBUG);
        assert_eq!(level_for(7), Level::TRACE);
    }

    #[test]
    fn test_second_init_is_an_error() {
        // The first call may race with other tests; the second must fail.
        let _ = try_init(0, false);
        assert!(matches!(try_init(1, true), Err(Error::Logging(_))));
    }
}
