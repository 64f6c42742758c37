//! Logging subscriber wiring (ambient stack, SPEC_FULL §A). This is the one
//! piece of "log formatter wiring" the core still owns per §1: the CLI
//! argument *parsing* is an external collaborator, but translating the
//! resolved `log_level` into an installed `tracing_subscriber::fmt`
//! subscriber is in-core plumbing, matching `utils.create_logger` in the
//! donor implementation.

use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

/// Installs a global `tracing` subscriber at the given level. Safe to call
/// at most once per process; the arbiter calls this before forking, each
/// worker calls it again after fork so that worker-local filter overrides
/// (`RUST_LOG`) still apply.
pub fn init(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_to_directive(level)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn level_to_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}
