//! Logging setup helpers.
//!
//! The framework logs through `tracing` everywhere; these helpers
//! install a subscriber for binaries and tests that do not bring their
//! own. The `RUST_LOG` environment variable overrides the default
//! filter.

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize plain-text logging with the given default level (e.g.
/// "info", "debug", "trellis=trace").
pub fn init(default_level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()?;
    Ok(())
}

/// Initialize JSON-formatted logging, for deployments feeding a log
/// aggregator.
pub fn init_json(default_level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_target(false))
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent_enough() {
        // Only the first global subscriber wins; the second attempt
        // must fail cleanly rather than panic.
        let first = init("info");
        let second = init("debug");
        assert!(first.is_ok() || second.is_err());
    }
}
