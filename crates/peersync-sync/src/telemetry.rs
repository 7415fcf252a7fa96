//! Tracing setup for hosts embedding the sync engine.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a global `fmt` subscriber filtered by `RUST_LOG`.
///
/// Returns false if a global subscriber was already installed.
pub fn init_tracing() -> bool {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .is_ok()
}
