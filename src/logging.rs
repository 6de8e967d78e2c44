// src/logging.rs
//
// Tracing initialization for the six binaries. Each `main` calls
// `init_logging()` once before binding its listener; level is controlled
// by `RUST_LOG` (defaults to `info`), same convention as the teacher's
// `chopin_core::logging`, trimmed down to the one variant this crate
// actually needs — there is no HTTP framework here wrapping a request
// span per call, so the pretty/JSON variants the teacher exposes for its
// multi-worker server don't have an equivalent user here.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize stdout logging. Call once, before the listener is created.
///
/// # Panics
///
/// Panics if called more than once per process.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
