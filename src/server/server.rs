//! Server (C8): owns the listener and shared server state, accepts
//! connections, and runs the startup/shutdown sequence from §4.8.
//! Grounded in `uasgi/server.py`'s `Server.run`/`startup`/`shutdown`; the
//! accept loop shape follows the teacher's connection-acceptance pattern
//! generalized to the gateway contract instead of hyper's `Service`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::Result;
use crate::gateway::{new_app_state, AppState, Application};
use crate::lifespan::Lifespan;
use crate::proto::h1::conn::{Connection, ConnectionConfig};
use crate::server::tcp;

/// How long shutdown waits for in-flight connections to finish on their
/// own before aborting them (§8 scenario 7: "exit within 5s").
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Server {
    app: Arc<dyn Application>,
    app_state: AppState,
    lifespan: Lifespan,
}

impl Server {
    pub fn new(app: Arc<dyn Application>) -> Self {
        let app_state = new_app_state();
        let lifespan = Lifespan::new(app.clone(), app_state.clone());
        Server { app, app_state, lifespan }
    }

    /// Runs to completion. `stop` flips to `true` when the worker wants a
    /// graceful shutdown (SIGINT trapped by `worker.rs`, or the arbiter's
    /// stop signal). Must run on a `tokio::task::LocalSet` (the connection
    /// engine and lifespan coordinator both use `spawn_local`).
    pub async fn run(&mut self, config: &mut Config, mut stop: watch::Receiver<bool>) -> Result<()> {
        let std_listener = config.socket()?;
        let listener = tcp::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;
        let root_path: Arc<str> = Arc::from(
            std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "/".to_string()),
        );

        self.lifespan.spawn();
        if config.lifespan {
            self.lifespan.startup().await?;
        }

        let should_stop = Arc::new(AtomicBool::new(false));
        let mut tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();
        let mut abort_handles: Vec<tokio::task::AbortHandle> = Vec::new();

        tracing::info!(addr = %local_addr, "server accepting connections");

        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);

                    let raw_fd = Some(std::os::unix::io::AsRawFd::as_raw_fd(&stream));
                    let (reader, writer) = stream.into_split();

                    let cfg = ConnectionConfig {
                        scheme: "http",
                        client: (peer_addr.ip().to_string(), peer_addr.port()),
                        server: (local_addr.ip().to_string(), local_addr.port()),
                        root_path: root_path.clone(),
                        app_state: self.app_state.clone(),
                        app: self.app.clone(),
                        access_log: config.access_log,
                    };

                    let conn = Connection::new(reader, writer, raw_fd, cfg);
                    let should_stop = should_stop.clone();
                    let handle = tokio::task::spawn_local(async move {
                        if let Err(e) = conn.run(should_stop).await {
                            if !e.is_closed() {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        }
                    });
                    abort_handles.push(handle.abort_handle());
                    tasks.retain(|h| !h.is_finished());
                    tasks.push(handle);
                }
            }
        }

        tracing::info!("server shutting down");
        should_stop.store(true, Ordering::SeqCst);
        drop(listener);

        if config.lifespan {
            self.lifespan.shutdown().await?;
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, join_all(tasks)).await.is_err() {
            tracing::warn!("grace period elapsed; aborting remaining connections");
            for handle in abort_handles {
                handle.abort();
            }
        }

        Ok(())
    }
}
