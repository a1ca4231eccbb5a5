//! Structured logging setup.
//!
//! Builds an async-drained [`slog::Logger`] and installs it as both the
//! `slog_scope` global logger and the `log` facade's backend, so library
//! code can reach for either `slog::info!(log, ...)` or the ambient
//! `log::info!(...)` macro.

use slog::{Drain, Logger};

/// Output format for the root logger.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    /// Human-readable, colored terminal output.
    Term,
    /// Newline-delimited JSON, suitable for log shipping.
    Json,
}

/// Builds the root logger and wires it up as the global logger.
///
/// Returns a guard that must be kept alive for the duration of the process;
/// dropping it flushes and tears down the async drain.
#[must_use]
pub fn init(format: Format) -> slog_scope::GlobalLoggerGuard {
    let drain = match format {
        Format::Term => {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            slog_async::Async::new(drain).build().fuse()
        }
        Format::Json => {
            let drain = slog_json::Json::default(std::io::stdout()).fuse();
            slog_async::Async::new(drain).build().fuse()
        }
    };
    let drain = slog_envlogger::new(drain).fuse();
    let logger = Logger::root(drain, slog::o!());

    let guard = slog_scope::set_global_logger(logger);
    slog_stdlog::init().ok();
    guard
}
