//! Worker process (C9): runs after `fork()`, redirects its stdio onto the
//! pipes the arbiter set up, builds the single-threaded runtime (§5), and
//! drives one `Server` until SIGINT or the arbiter's SIGTERM. Grounded in
//! `uasgi/worker.py`'s `Worker.serve`.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use tokio::sync::watch;

use crate::config::Config;
use crate::gateway::Application;
use crate::server::Server;

/// Resolved once per worker, matching §4.9's "not in the arbiter, so that
/// imports/state don't leak across workers". A dotted `"pkg.module:factory"`
/// string has no equivalent in a statically-linked binary; the function
/// pointer plays the same "resolved inside the child" role.
pub type AppFactory = fn() -> Arc<dyn Application>;

/// `dup2`s this process's stdout/stderr onto the write ends of the pipes
/// the arbiter created, then closes the now-redundant original descriptors.
/// Must run before anything writes to stdout (including the logger).
pub(crate) fn redirect_stdio(stdout_w: RawFd, stderr_w: RawFd) {
    // SAFETY: called immediately after fork, before any other thread exists
    // in this process; `stdout_w`/`stderr_w` are valid open descriptors
    // owned by this process.
    unsafe {
        libc::dup2(stdout_w, libc::STDOUT_FILENO);
        libc::dup2(stderr_w, libc::STDERR_FILENO);
        libc::close(stdout_w);
        libc::close(stderr_w);
    }
}

/// Runs one worker to completion; returns the process exit code.
pub(crate) fn run_child(app_factory: AppFactory, mut config: Config) -> i32 {
    crate::logging::init(config.log_level);
    let pid = std::process::id();
    tracing::info!(pid, "worker starting");

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "worker failed to build runtime");
            return 1;
        }
    };

    let app = app_factory();
    let local = tokio::task::LocalSet::new();

    let result = runtime.block_on(local.run_until(async move {
        let (stop_tx, stop_rx) = watch::channel(false);

        let sigterm_tx = stop_tx.clone();
        let sigint = tokio::task::spawn_local(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("worker received SIGINT, stopping");
                let _ = stop_tx.send(true);
            }
        });

        let sigterm = tokio::task::spawn_local(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    tracing::info!("worker received SIGTERM, stopping");
                    let _ = sigterm_tx.send(true);
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                }
            }
        });

        let heartbeat = tokio::task::spawn_local(liveness_heartbeat(pid));

        let mut server = Server::new(app);
        let result = server.run(&mut config, stop_rx).await;
        sigint.abort();
        sigterm.abort();
        heartbeat.abort();
        result
    }));

    match result {
        Ok(()) => {
            tracing::info!(pid, "worker exiting cleanly");
            0
        }
        Err(e) => {
            tracing::error!(pid, error = %e, "worker exiting with error");
            1
        }
    }
}

/// Best-effort periodic liveness log, standing in for `Worker.alive()`'s
/// pipe-based `{num_connections, num_tasks}` report in the donor — this
/// core counts neither over IPC, so a heartbeat is all the arbiter gets.
async fn liveness_heartbeat(pid: u32) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
    loop {
        ticker.tick().await;
        tracing::debug!(pid, "worker alive");
    }
}
