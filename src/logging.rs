//! Tracing subscriber bootstrap for the CLI.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

/// Default filter directive when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "cadforge=debug" } else { "cadforge=info" }
}

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
}

/// Install the global subscriber: console output on stderr (stdout stays clean
/// for command output), plus a daily rolling file in `log_dir` when given.
///
/// Returns the guard that must be kept alive for the duration of the program.
pub fn init(verbose: bool, format: LogFormat, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let console = match format {
        LogFormat::Human => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let (file_layer, guard) = match log_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "cadforge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // A second init (e.g. in tests) is not an error worth surfacing.
    let _ = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(console)
        .with(file_layer)
        .try_init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_raises_default_level() {
        assert_eq!(default_directive(false), "cadforge=info");
        assert_eq!(default_directive(true), "cadforge=debug");
    }

    #[test]
    fn init_with_log_dir_returns_guard() {
        let dir = tempfile::tempdir().unwrap();
        let guard = init(false, LogFormat::Json, Some(&dir.path().join("logs")));
        assert!(guard.is_some());
        assert!(dir.path().join("logs").exists());
    }
}
