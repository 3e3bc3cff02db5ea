//! # Logging
//!
//! JSON log output through `tracing-subscriber`. `RUST_LOG` directives are
//! honored on top of the default level for this crate.

use crate::error::{Error, Result};
use tracing_subscriber::EnvFilter;

/// Default directive when `RUST_LOG` says nothing about this crate
pub const DEFAULT_DIRECTIVE: &str = "phial=info";

/// Install the global JSON subscriber; a second call is a no-op
pub fn init_tracing() {
    let _ = try_init_tracing(DEFAULT_DIRECTIVE);
}

/// Install the global JSON subscriber with `directive` as the default level
///
/// # Errors
///
/// Returns `Error::Config` for an unparsable directive or when a global
/// subscriber is already installed.
pub fn try_init_tracing(directive: &str) -> Result<()> {
    let directive = directive
        .parse()
        .map_err(|e| Error::Config(format!("invalid log directive '{directive}': {e}")))?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive))
        .json()
        .try_init()
        .map_err(|e| Error::Config(format!("could not install the log subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_directive() {
        assert!(matches!(try_init_tracing("phial=loud"), Err(Error::Config(_))));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing();
        init_tracing();
        assert!(try_init_tracing(DEFAULT_DIRECTIVE).is_err());
    }
}
