//! Structured logging setup
//!
//! The library only emits `tracing` events. Binaries and tests that want to
//! see them call [`init_tracing`] once; `RUST_LOG` overrides the default
//! directive.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVE: &str = "churn_store=info";

/// Install a compact fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive`.
///
/// Returns `false` if a global subscriber was already installed, so calling
/// it from several tests is harmless.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .compact()
        .try_init()
        .is_ok()
}
