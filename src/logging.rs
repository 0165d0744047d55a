//! Tracing setup for the engine binary.
//!
//! Diagnostics go to stderr and are controlled by `RUST_LOG`; trace events on
//! the bus are the product output and are unaffected by the log filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `reify=info` if unset. `verbose` bumps the
/// default to debug for this crate.
pub fn init(verbose: bool) {
    let default = if verbose { "reify=debug" } else { "reify=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
