//! Lifespan coordinator (C7): the minimal startup/shutdown handshake with
//! the application, grounded in `uasgi/lifespan.py`'s `Lifespan` class.
//! One background task runs `app(scope, receive, send)` for the lifetime
//! of the server; `startup()`/`shutdown()` post an event and await the
//! corresponding latch, exactly mirroring the donor's
//! `asyncio.Queue`/`asyncio.Event` pair translated onto `tokio::sync`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::gateway::{
    AppState, Application, BoxFuture, LifespanScope, Receiver, RequestEvent, ResponseEvent, Scope,
    Sender,
};

pub struct Lifespan {
    app: Arc<dyn Application>,
    app_state: AppState,
    tx: mpsc::UnboundedSender<RequestEvent>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<RequestEvent>>>,
    startup_done_tx: watch::Sender<bool>,
    startup_done_rx: watch::Receiver<bool>,
    shutdown_done_tx: watch::Sender<bool>,
    shutdown_done_rx: watch::Receiver<bool>,
    startup_complete: Arc<AtomicBool>,
    shutdown_complete: Arc<AtomicBool>,
    message: Arc<Mutex<Option<String>>>,
}

impl Lifespan {
    pub fn new(app: Arc<dyn Application>, app_state: AppState) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (startup_done_tx, startup_done_rx) = watch::channel(false);
        let (shutdown_done_tx, shutdown_done_rx) = watch::channel(false);
        Lifespan {
            app,
            app_state,
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            startup_done_tx,
            startup_done_rx,
            shutdown_done_tx,
            shutdown_done_rx,
            startup_complete: Arc::new(AtomicBool::new(true)),
            shutdown_complete: Arc::new(AtomicBool::new(true)),
            message: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawns the one lifespan task. Must be called once, before
    /// `startup()`, on the worker's `LocalSet`.
    pub fn spawn(&self) {
        let app = self.app.clone();
        let scope = LifespanScope {
            r#type: "lifespan",
            asgi_version: "2.5",
            spec_version: "2.0",
            state: self.app_state.clone(),
        };
        let rx = self.rx.clone();
        let startup_done_tx = self.startup_done_tx.clone();
        let shutdown_done_tx = self.shutdown_done_tx.clone();
        let startup_complete = self.startup_complete.clone();
        let shutdown_complete = self.shutdown_complete.clone();
        let message = self.message.clone();

        tokio::task::spawn_local(async move {
            let receive: Receiver<'_> = Box::new(move || -> BoxFuture<'_, RequestEvent> {
                let rx = rx.clone();
                Box::pin(async move {
                    let mut guard = rx.lock().await;
                    guard.recv().await.unwrap_or(RequestEvent::LifespanShutdown)
                })
            });

            let send: Sender<'_> = Box::new(move |event: ResponseEvent| -> BoxFuture<'_, ()> {
                let startup_done_tx = startup_done_tx.clone();
                let shutdown_done_tx = shutdown_done_tx.clone();
                let startup_complete = startup_complete.clone();
                let shutdown_complete = shutdown_complete.clone();
                let message = message.clone();
                Box::pin(async move {
                    match event {
                        ResponseEvent::LifespanStartupComplete { failed } => {
                            if let Some(msg) = failed {
                                startup_complete.store(false, Ordering::SeqCst);
                                *message.lock().unwrap() = Some(msg);
                            }
                            let _ = startup_done_tx.send(true);
                        }
                        ResponseEvent::LifespanShutdownComplete { failed } => {
                            if let Some(msg) = failed {
                                shutdown_complete.store(false, Ordering::SeqCst);
                                *message.lock().unwrap() = Some(msg);
                            }
                            let _ = shutdown_done_tx.send(true);
                        }
                        _ => {}
                    }
                })
            });

            // Exceptions raised by the application are swallowed by design
            // (§4.7: "lifespan is optional") — only `*.failed` events,
            // delivered through `send`, are treated as failures.
            let _ = app.call(Scope::Lifespan(scope), receive, send).await;
        });
    }

    pub async fn startup(&self) -> Result<()> {
        let _ = self.tx.send(RequestEvent::LifespanStartup);
        self.wait(self.startup_done_rx.clone()).await;
        if !self.startup_complete.load(Ordering::SeqCst) {
            return Err(Error::new_lifespan_startup(
                self.message.lock().unwrap().clone().unwrap_or_else(|| "lifespan startup failed".into()),
            ));
        }
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.tx.send(RequestEvent::LifespanShutdown);
        self.wait(self.shutdown_done_rx.clone()).await;
        if !self.shutdown_complete.load(Ordering::SeqCst) {
            return Err(Error::new_lifespan_shutdown(
                self.message.lock().unwrap().clone().unwrap_or_else(|| "lifespan shutdown failed".into()),
            ));
        }
        Ok(())
    }

    async fn wait(&self, mut rx: watch::Receiver<bool>) {
        if *rx.borrow() {
            return;
        }
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::new_app_state;

    fn app_that(
        f: impl for<'a> Fn(Scope, Receiver<'a>, Sender<'a>) -> BoxFuture<'a, Result<(), String>>
            + Send
            + Sync
            + 'static,
    ) -> Arc<dyn Application> {
        Arc::new(f)
    }

    #[tokio::test]
    async fn startup_and_shutdown_complete_round_trip() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let app = app_that(|_scope, mut receive, mut send| {
                    Box::pin(async move {
                        loop {
                            match receive().await {
                                RequestEvent::LifespanStartup => {
                                    send(ResponseEvent::LifespanStartupComplete { failed: None }).await;
                                }
                                RequestEvent::LifespanShutdown => {
                                    send(ResponseEvent::LifespanShutdownComplete { failed: None }).await;
                                    return Ok(());
                                }
                                _ => {}
                            }
                        }
                    })
                });

                let lifespan = Lifespan::new(app, new_app_state());
                lifespan.spawn();
                lifespan.startup().await.unwrap();
                lifespan.shutdown().await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn startup_failed_surfaces_as_error() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let app = app_that(|_scope, mut receive, mut send| {
                    Box::pin(async move {
                        if let RequestEvent::LifespanStartup = receive().await {
                            send(ResponseEvent::LifespanStartupComplete {
                                failed: Some("boom".into()),
                            })
                            .await;
                        }
                        Ok(())
                    })
                });

                let lifespan = Lifespan::new(app, new_app_state());
                lifespan.spawn();
                let err = lifespan.startup().await.unwrap_err();
                assert!(err.to_string().contains("boom"));
            })
            .await;
    }
}
