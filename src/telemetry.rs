//! Tracing setup.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

const ENV_FILTER_VAR: &str = "WAYLINE_LOG";

/// Install the global subscriber. Filter precedence: `WAYLINE_LOG`, then the
/// config directive, then "info". Safe to call more than once; later calls
/// are no-ops.
pub fn init(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_env(ENV_FILTER_VAR)
        .or_else(|_| match &logging.filter {
            Some(directive) => EnvFilter::try_new(directive),
            None => EnvFilter::try_new("info"),
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
