//! Tracing subscriber setup for evaluation jobs.

use tracing_subscriber::EnvFilter;

/// Environment variable that overrides the configured log filter.
pub const LOG_ENV_VAR: &str = "CADENCE_LOG";

/// Installs a global fmt subscriber.
///
/// `level` is any `EnvFilter` directive (`"info"`, `"cadence_eval=debug"`);
/// `CADENCE_LOG` wins when set. Fails instead of panicking if a global
/// subscriber is already installed.
pub fn init_tracing(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).or_else(|_| EnvFilter::try_new(level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let installed = if json { builder.json().try_init() } else { builder.try_init() };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_an_error() {
        // Another test may already own the global subscriber, so only the
        // second call's outcome is deterministic.
        let _ = init_tracing("info", false);
        assert!(init_tracing("debug", true).is_err());
    }
}
