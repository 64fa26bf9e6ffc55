//! Logging initialization.
//!
//! Logs go to stderr so stdout carries only command output.

use tracing_subscriber::EnvFilter;

/// Initialize logging. `RUST_LOG` takes precedence over `verbose`.
pub fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "tether=debug,tether_mcp=debug"
    } else {
        "tether=warn,tether_mcp=warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
