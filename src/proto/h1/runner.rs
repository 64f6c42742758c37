//! Request lifecycle runner (C5): the bridge between the parser and the
//! application. Grounded in `AppRunner` from the donor implementation,
//! generalized to the core's async/await + `tokio` idiom instead of
//! `asyncio.Event`/`asyncio.Queue`.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::flow::FlowGate;
use crate::gateway::{
    Application, BoxFuture, Environment, RequestEvent, ResponseEvent, Scope,
};
use crate::proto::h1::encode::encode_head;
use crate::proto::h1::sendfile;

/// Default chunk size for `http.response.zerocopysend` when the
/// application doesn't specify one (§4.5).
const DEFAULT_SENDFILE_COUNT: usize = 512;

struct RunnerBody {
    buf: BytesMut,
    message_complete: bool,
}

/// Shared, lock-free-in-spirit state between the connection engine (which
/// feeds body bytes in) and the runner's `receive()` (which drains them).
/// Single-threaded per worker (§5), so a `RefCell` would do, but the
/// runner executes as its own spawned task, so a `tokio::sync::Mutex`-free
/// `Notify` + unsafe-free `std::sync::Mutex` keeps it simple and `Send`.
pub(crate) struct RunnerBodyState {
    body: std::sync::Mutex<RunnerBody>,
    notify: Notify,
}

impl RunnerBodyState {
    fn new(message_complete: bool) -> Arc<Self> {
        Arc::new(RunnerBodyState {
            body: std::sync::Mutex::new(RunnerBody {
                buf: BytesMut::new(),
                message_complete,
            }),
            notify: Notify::new(),
        })
    }

    /// Connection engine callback: `on_body`.
    pub(crate) fn set_body(&self, chunk: Bytes) {
        let mut guard = self.body.lock().unwrap();
        guard.buf.extend_from_slice(&chunk);
        drop(guard);
        self.notify.notify_one();
    }

    /// Connection engine callback: `on_message_complete`.
    pub(crate) fn set_message_complete(&self) {
        let mut guard = self.body.lock().unwrap();
        guard.message_complete = true;
        drop(guard);
        self.notify.notify_one();
    }

    fn is_message_complete(&self) -> bool {
        self.body.lock().unwrap().message_complete
    }

    fn drain(&self) -> Bytes {
        let mut guard = self.body.lock().unwrap();
        guard.buf.split().freeze()
    }

    fn has_bytes_or_done(&self) -> bool {
        let guard = self.body.lock().unwrap();
        !guard.buf.is_empty() || guard.message_complete
    }
}

/// What the connection engine needs to drive one application invocation
/// and learn when it is done.
pub(crate) struct RequestRunner<W> {
    pub(crate) env: Environment,
    pub(crate) app: Arc<dyn Application>,
    pub(crate) writer: Arc<tokio::sync::Mutex<W>>,
    pub(crate) flow_gate: FlowGate,
    pub(crate) body_state: Arc<RunnerBodyState>,
    pub(crate) no_body: bool,
    /// Set once the response is fully emitted (terminal `more_body=false`
    /// or a zerocopysend): §3 `more_body` bookkeeping on the *response*.
    more_body: std::sync::Arc<std::sync::atomic::AtomicBool>,
    raw_fd: Option<std::os::unix::io::RawFd>,
    /// Access-log bookkeeping (SPEC_FULL §B.3): status code and bytes
    /// written, filled in by `dispatch_send` and reported once `run()`
    /// returns.
    status: std::sync::Arc<std::sync::atomic::AtomicU16>,
    bytes_sent: std::sync::Arc<std::sync::atomic::AtomicU64>,
    /// Gates the "request completed" log line (SPEC_FULL §B.3); set from
    /// `Config::access_log`.
    access_log: bool,
}

impl<W> RequestRunner<W>
where
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(
        env: Environment,
        app: Arc<dyn Application>,
        writer: Arc<tokio::sync::Mutex<W>>,
        flow_gate: FlowGate,
        message_complete: bool,
        no_body: bool,
        raw_fd: Option<std::os::unix::io::RawFd>,
        access_log: bool,
    ) -> (Self, Arc<RunnerBodyState>) {
        let body_state = RunnerBodyState::new(message_complete);
        (
            RequestRunner {
                env,
                app,
                writer,
                flow_gate,
                body_state: body_state.clone(),
                no_body,
                // Starts false: a response that never calls `send()` again
                // after `Start` (headers-only, or an app error before any
                // body) must be reaped, not wait forever for a `more_body`
                // that never arrives.
                more_body: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
                raw_fd,
                status: std::sync::Arc::new(std::sync::atomic::AtomicU16::new(0)),
                bytes_sent: std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0)),
                access_log,
            },
            body_state,
        )
    }

    /// Drives the application to completion. Fires `on_response_complete`
    /// (via the returned future's caller) once `more_body` has settled to
    /// `false` — i.e. once the response is fully sent or the connection is
    /// gone. Cancellation and OS errors are swallowed, matching the donor's
    /// `except asyncio.CancelledError / except OSError: ...` (§7).
    pub(crate) async fn run(self) {
        let env = self.env.clone();
        let no_body = self.no_body;
        let body_state = self.body_state.clone();
        let writer = self.writer.clone();
        let flow_gate = self.flow_gate.clone();
        let more_body = self.more_body.clone();
        let raw_fd = self.raw_fd;
        let status = self.status.clone();
        let bytes_sent = self.bytes_sent.clone();

        let receive: crate::gateway::Receiver<'_> = Box::new(move || -> BoxFuture<'_, RequestEvent> {
            let body_state = body_state.clone();
            Box::pin(async move {
                if no_body {
                    let complete = body_state.is_message_complete();
                    return RequestEvent::Http {
                        body: None,
                        more_body: !complete,
                    };
                }
                loop {
                    if body_state.has_bytes_or_done() {
                        break;
                    }
                    // Racing a fresh Notify subscription against a
                    // concurrently-arriving body chunk is fine here: if we
                    // miss a notification we just re-check the condition on
                    // the next loop iteration (bounded by message_complete
                    // eventually becoming true).
                    let notified = body_state.notify.notified();
                    if body_state.has_bytes_or_done() {
                        break;
                    }
                    notified.await;
                }
                let complete = body_state.is_message_complete();
                let drained = body_state.drain();
                RequestEvent::Http {
                    body: Some(drained),
                    more_body: !complete,
                }
            })
        });

        let send: crate::gateway::Sender<'_> = Box::new(move |event: ResponseEvent| -> BoxFuture<'_, ()> {
            let writer = writer.clone();
            let flow_gate = flow_gate.clone();
            let more_body = more_body.clone();
            let env = env.clone();
            let status = status.clone();
            let bytes_sent = bytes_sent.clone();
            Box::pin(async move {
                let _ = dispatch_send(event, writer, flow_gate, more_body, raw_fd, &env, &status, &bytes_sent).await;
            })
        });

        let app = self.app.clone();
        let run_env = self.env.clone();
        let access_env = self.env.clone();
        let result = app.call(Scope::Http(run_env), receive, send).await;
        if let Err(ref message) = result {
            tracing::debug!(error = %message, "application raised while handling request");
        }

        if self.access_log {
            tracing::info!(
                client = %access_env.client.0,
                method = %String::from_utf8_lossy(&access_env.method),
                path = %access_env.path,
                status = self.status.load(std::sync::atomic::Ordering::SeqCst),
                bytes = self.bytes_sent.load(std::sync::atomic::Ordering::SeqCst),
                "request completed",
            );
        }
    }

    pub(crate) fn more_body(&self) -> bool {
        self.more_body.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub(crate) fn more_body_handle(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
        self.more_body.clone()
    }
}

async fn dispatch_send<W>(
    event: ResponseEvent,
    writer: Arc<tokio::sync::Mutex<W>>,
    flow_gate: FlowGate,
    more_body: std::sync::Arc<std::sync::atomic::AtomicBool>,
    raw_fd: Option<std::os::unix::io::RawFd>,
    env: &Environment,
    status: &std::sync::Arc<std::sync::atomic::AtomicU16>,
    bytes_sent: &std::sync::Arc<std::sync::atomic::AtomicU64>,
) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    match event {
        ResponseEvent::Start { status: code, headers } => {
            let head = encode_head("1.1", code, &headers);
            flow_gate.await_writable().await;
            let mut w = writer.lock().await;
            w.write_all(&head).await.map_err(Error::new_io)?;
            status.store(code, std::sync::atomic::Ordering::SeqCst);
            tracing::trace!(status = code, path = %env.path, "response head written");
            Ok(())
        }
        ResponseEvent::Body { body, more_body: next } => {
            if !body.is_empty() {
                flow_gate.await_writable().await;
                let mut w = writer.lock().await;
                w.write_all(&body).await.map_err(Error::new_io)?;
                bytes_sent.fetch_add(body.len() as u64, std::sync::atomic::Ordering::SeqCst);
            }
            more_body.store(next, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        ResponseEvent::ZeroCopySend { file, count } => {
            more_body.store(false, std::sync::atomic::Ordering::SeqCst);
            match raw_fd {
                Some(socket_fd) => {
                    sendfile::run_sendfile_loop(
                        socket_fd,
                        file,
                        count.unwrap_or(DEFAULT_SENDFILE_COUNT),
                        &flow_gate,
                    )
                    .await
                }
                None => Err(Error::new_transport_closed()),
            }
        }
        ResponseEvent::LifespanStartupComplete { .. } | ResponseEvent::LifespanShutdownComplete { .. } => {
            // Not meaningful on an HTTP request runner; only the lifespan
            // coordinator (C7) interprets these.
            Ok(())
        }
    }
}
