//! Diagnostic tracing for the controller.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Diagnostics via `RUST_LOG`, output to stderr.
//!
//! - **Run output**: Progress lines, per-test results and hook output are
//!   printed to stdout by the controller and are unaffected by `RUST_LOG`.
//!   Reports are written to the xunit and text files.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "virt_ci=info,warn";

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `virt_ci=info,warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=virt_ci=debug virt-ci --smoke
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
