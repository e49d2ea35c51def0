//! Diagnostic tracing to stderr.
//!
//! Distinct from [`crate::report`]: reporters print one progress line per
//! pipeline step no matter the filter, while tracing carries the detail
//! (spans for each sandbox run and backend request) and is silent unless
//! asked for.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset: warnings from everything, or this
/// crate's debug output under `--verbose`.
fn default_directive(verbose: bool) -> &'static str {
    if verbose { "scriptgen=debug,warn" } else { "warn" }
}

/// Install the global subscriber. `RUST_LOG` always wins over `verbose`,
/// e.g. `RUST_LOG=scriptgen::io::sandbox=trace scriptgen run task.txt`.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .compact(),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_only_raises_this_crate() {
        assert_eq!(default_directive(false), "warn");
        assert_eq!(default_directive(true), "scriptgen=debug,warn");
        assert!(EnvFilter::try_new(default_directive(true)).is_ok());
    }
}
