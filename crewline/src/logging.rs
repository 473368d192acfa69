//! Diagnostic tracing for pipeline runs.
//!
//! Tracing goes to stderr and is filtered by `RUST_LOG`. It is separate from
//! the run's product output, which result sinks (`io/sink`) write regardless
//! of the log level.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset and `--verbose` was not given.
const DEFAULT_FILTER: &str = "warn";
/// Filter used for `--verbose`: run/task lifecycle from this crate only.
const VERBOSE_FILTER: &str = "warn,crewline=info";

/// Install the global subscriber.
///
/// `RUST_LOG` always wins over `verbose`.
///
/// ```bash
/// RUST_LOG=crewline=debug crewline run --pipeline pipeline.toml
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose {
        VERBOSE_FILTER
    } else {
        DEFAULT_FILTER
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
