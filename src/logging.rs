//! # Logging Bootstrap
//!
//! Installs a `tracing` subscriber for the tracker binary. Library code only ever uses
//! the `tracing` macros; nothing below this module decides where log lines go.
//!
//! - Compact single-line format on stderr (stdout carries published records)
//! - Configurable via the `RUST_LOG` environment variable
//! - Falls back to the supplied default directive when `RUST_LOG` is unset or invalid

use std::io;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

/// Default directive used when `RUST_LOG` is not set.
pub const DEFAULT_DIRECTIVE: &str = "info";

/// Initialize the global subscriber.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed (for example when
/// called twice from tests). The existing subscriber stays in place.
pub fn init_logging(default_directive: &str) -> Result<(), TryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(true)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init()
}
