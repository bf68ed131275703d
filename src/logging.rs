//! One-shot `tracing` subscriber setup for binaries embedding this crate.
//!
//! Library code never installs a subscriber itself; it only emits
//! `tracing::{trace,debug,info,warn,error}!` calls, so embedding binaries
//! compose cleanly with their own logging stack.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Install a `tracing_subscriber::registry()` with an `EnvFilter` (default
/// `info`, overridable via `RUST_LOG`) and a formatting layer. Call once,
/// before anything else runs.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}
