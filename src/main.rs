//! Binary entry point: parses a handful of environment variables into a
//! [`Config`], resolves the demo application, and hands both to the
//! [`Arbiter`]. A real deployment swaps `demo_app` for its own
//! [`AppFactory`]; everything else in this file is the same regardless of
//! which application is being served.

use std::sync::Arc;

use gasket::{Application, Config, LogLevel};

#[path = "../demos/echo.rs"]
mod echo;

fn demo_app() -> Arc<dyn Application> {
    Arc::new(echo::app)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u16(name: &str, default: u16) -> u16 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_log_level(name: &str, default: LogLevel) -> LogLevel {
    match std::env::var(name).ok().as_deref() {
        Some("trace") => LogLevel::Trace,
        Some("debug") => LogLevel::Debug,
        Some("info") => LogLevel::Info,
        Some("warn") => LogLevel::Warn,
        Some("error") => LogLevel::Error,
        _ => default,
    }
}

fn main() {
    let host = std::env::var("GASKET_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = env_u16("GASKET_PORT", 5000);
    let workers = env_usize("GASKET_WORKERS", 1);
    let log_level = env_log_level("GASKET_LOG_LEVEL", LogLevel::Info);

    let config = Config::new(host, port)
        .with_workers(workers)
        .with_lifespan(true)
        .with_log_level(log_level);

    let arbiter = match gasket::Arbiter::new(demo_app, config) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = arbiter.main() {
        eprintln!("arbiter exited with error: {e}");
        std::process::exit(1);
    }
}
