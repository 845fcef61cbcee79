//! Logging setup for the `provisio` binary
//!
//! Logs go to stderr so that `--json` output on stdout stays parseable.
//! Debug builds print human-readable lines; release builds emit JSON records
//! that an operator can ship next to the audit log.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Targets that follow the configured level: the CLI binary and the library
const ENGINE_TARGETS: [&str; 2] = ["provisio", "provisio_engine"];

/// Filter directives for `log_level`
///
/// Dependencies stay at `warn` so a `debug` engine log is not drowned in
/// archive and runtime internals.
pub fn filter_directives(log_level: &str) -> String {
    ENGINE_TARGETS
        .iter()
        .fold(String::from("warn"), |mut acc, target| {
            acc.push_str(&format!(",{}={}", target, log_level));
            acc
        })
}

/// Install the global subscriber
///
/// `RUST_LOG` wins over `log_level`. An unparseable level falls back to
/// `info` rather than disabling logging.
pub fn init_telemetry_with_level(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directives(log_level)))
        .unwrap_or_else(|_| EnvFilter::new(filter_directives("info")));

    #[cfg(debug_assertions)]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init()
            .ok();
    }

    #[cfg(not(debug_assertions))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true),
            )
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_covers_binary_and_library() {
        assert_eq!(
            filter_directives("debug"),
            "warn,provisio=debug,provisio_engine=debug"
        );
    }

    #[test]
    fn test_directives_parse() {
        for level in ["error", "warn", "info", "debug", "trace"] {
            assert!(EnvFilter::try_new(filter_directives(level)).is_ok());
        }
        assert!(EnvFilter::try_new(filter_directives("loud")).is_err());
    }
}
