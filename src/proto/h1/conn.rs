//! Connection protocol engine (C6): the per-connection state machine that
//! owns the parser, the current runner, the pipeline queue, and the flow
//! gate. Grounded in `H1Connection` from the donor implementation; the
//! `asyncio.Protocol` callback methods (`connection_made`, `data_received`,
//! `pause_writing`, …) become the phases of one `run()` loop plus a pair of
//! `pause`/`resume` hooks driven by the write-buffer watcher.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;

use crate::error::Result;
use crate::flow::FlowGate;
use crate::gateway::{AppState, Application, Environment};
use crate::proto::h1::env::{build_environment, ConnectionAddrs};
use crate::proto::h1::parse::{ParseEvent, RequestParser};
use crate::proto::h1::runner::{RequestRunner, RunnerBodyState};

/// Pipeline depth bound: past this many parsed-but-unscheduled requests,
/// the connection is dropped rather than let an abusive client queue
/// unbounded work (§9 Design Notes).
const MAX_PIPELINE_DEPTH: usize = 128;

const READ_BUF_SIZE: usize = 8 * 1024;

/// Awaits `notify`'s next permit if one is present, otherwise never
/// resolves — lets `run()`'s `select!` always have a runner-completion arm
/// even while `current` is `None`.
async fn notified_or_pending(notify: &Option<Arc<Notify>>) {
    match notify {
        Some(n) => n.notified().await,
        None => std::future::pending().await,
    }
}

pub struct ConnectionConfig {
    pub scheme: &'static str,
    pub client: (String, u16),
    pub server: (String, u16),
    pub root_path: Arc<str>,
    pub app_state: AppState,
    pub app: Arc<dyn Application>,
    pub access_log: bool,
}

struct PendingRequest<W> {
    runner: RequestRunner<W>,
    body_state: Arc<RunnerBodyState>,
}

/// Drives one TCP connection end to end. `R`/`W` are the split halves of
/// the transport (plain TCP or a TLS-wrapped stream); `raw_fd` is `Some`
/// only when the transport is a bare socket a `sendfile` syscall can
/// target directly (§4.5's sendfile loop is defined in terms of the raw
/// socket descriptor, which a TLS session does not expose meaningfully).
pub struct Connection<R, W> {
    reader: R,
    writer: Arc<AsyncMutex<W>>,
    raw_fd: Option<RawFd>,
    cfg: ConnectionConfig,
    parser: RequestParser,
    flow_gate: FlowGate,
    current: Option<CurrentRunner>,
    pipeline: VecDeque<PendingRequest<W>>,
    /// Body state of whichever request the parser is currently in the
    /// middle of (always the most recently scheduled one, since the parser
    /// only ever has one message's body in flight at a time). Distinct
    /// from `current`, which is whichever request is presently being
    /// *responded to* — under pipelining these can be two different
    /// requests (I1/I2).
    parsing: Option<Arc<RunnerBodyState>>,
    /// Set once a parsed request declared non-keep-alive framing
    /// (`Connection: close`, or an HTTP/1.0 request without `keep-alive`).
    /// Once the response to that request has been reaped and the pipeline
    /// is empty, `run()` closes the socket instead of reading further
    /// (§8 Scenario 3).
    closing: bool,
}

/// A handle to the runner currently executing, so that `on_body`/
/// `on_message_complete` events (which arrive on the connection's read
/// side) can reach it, and so that its completion can be observed without
/// the connection engine polling the runner's task directly (I1, I3).
struct CurrentRunner {
    body_state: Arc<RunnerBodyState>,
    more_body: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
    done: Arc<AtomicBool>,
    /// Signaled once `handle`'s task finishes, so `run()`'s read loop can
    /// wake up and reap the pipeline tail without waiting on more bytes
    /// from the peer (P1/P2, §8 Scenario 2).
    notify: Arc<Notify>,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W, raw_fd: Option<RawFd>, cfg: ConnectionConfig) -> Self {
        Connection {
            reader,
            writer: Arc::new(AsyncMutex::new(writer)),
            raw_fd,
            cfg,
            parser: RequestParser::new(),
            flow_gate: FlowGate::new(),
            current: None,
            pipeline: VecDeque::new(),
            parsing: None,
            closing: false,
        }
    }

    pub(crate) fn flow_gate(&self) -> FlowGate {
        self.flow_gate.clone()
    }

    /// Runs the connection until the peer closes it, a parse error occurs,
    /// `should_stop` flips to true (graceful shutdown — see `server`), or a
    /// non-keep-alive request's response has been fully sent (§8 Scenario 3).
    pub async fn run(mut self, should_stop: Arc<AtomicBool>) -> Result<()> {
        let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);

        loop {
            self.reap_current_if_done();

            let idle = self.current.is_none() && self.pipeline.is_empty();
            if (should_stop.load(Ordering::SeqCst) || self.closing) && idle {
                return Ok(());
            }

            // The spawned runner's completion must wake this loop even when
            // no new bytes arrive, or a pipelined tail request never gets
            // reaped and scheduled (P1/P2): select on the runner's `Notify`
            // alongside the socket read.
            let runner_done = self.current.as_ref().map(|c| c.notify.clone());

            buf.resize(READ_BUF_SIZE, 0);
            tokio::select! {
                biased;
                _ = notified_or_pending(&runner_done) => {
                    continue;
                }
                read = self.reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => {
                            tracing::debug!("connection closed by peer");
                            return Ok(());
                        }
                        Ok(n) => n,
                        Err(e) => {
                            tracing::debug!(error = %e, "read error, closing connection");
                            return Err(e.into());
                        }
                    };

                    let events = match self.parser.feed(&buf[..n]) {
                        Ok(events) => events,
                        Err(e) => {
                            tracing::debug!(error = %e, "parse error, closing connection");
                            return Err(e);
                        }
                    };

                    for event in events {
                        self.handle_parse_event(event);
                    }
                }
            }
        }
    }

    fn handle_parse_event(&mut self, event: ParseEvent) {
        match event {
            ParseEvent::MessageBegin => {}
            ParseEvent::HeadersComplete(head) => {
                if !head.keep_alive {
                    self.closing = true;
                }
                let env = build_environment(
                    &head,
                    self.cfg.scheme,
                    &self.cfg.root_path,
                    ConnectionAddrs {
                        client: &self.cfg.client,
                        server: &self.cfg.server,
                    },
                    self.cfg.app_state.clone(),
                );
                let no_body = crate::gateway::is_no_body_method(&head.method);
                self.schedule(env, no_body);
            }
            ParseEvent::Body(chunk) => {
                if let Some(parsing) = &self.parsing {
                    parsing.set_body(chunk);
                }
            }
            ParseEvent::MessageComplete => {
                if let Some(parsing) = self.parsing.take() {
                    parsing.set_message_complete();
                }
            }
        }
    }

    /// New parsed request: becomes `current` immediately if the
    /// connection is idle, otherwise joins the pipeline tail (I1, I2). The
    /// request also becomes the parser's body target regardless of which
    /// bucket it lands in, since it's by construction the newest message.
    fn schedule(&mut self, env: Environment, no_body: bool) {
        if self.pipeline.len() >= MAX_PIPELINE_DEPTH {
            tracing::warn!("pipeline depth exceeded, dropping connection");
            return;
        }

        let (runner, body_state) = RequestRunner::new(
            env,
            self.cfg.app.clone(),
            self.writer.clone(),
            self.flow_gate.clone(),
            /* message_complete */ false,
            no_body,
            self.raw_fd,
            self.cfg.access_log,
        );
        self.parsing = Some(body_state.clone());

        if self.current.is_none() {
            self.spawn_current(runner, body_state);
        } else {
            self.pipeline.push_back(PendingRequest { runner, body_state });
        }
    }

    fn spawn_current(&mut self, runner: RequestRunner<W>, body_state: Arc<RunnerBodyState>) {
        let more_body = runner.more_body_handle();
        let done = Arc::new(AtomicBool::new(false));
        let done_for_task = done.clone();
        let notify = Arc::new(Notify::new());
        let notify_for_task = notify.clone();
        let handle = tokio::task::spawn_local(async move {
            runner.run().await;
            done_for_task.store(true, Ordering::SeqCst);
            notify_for_task.notify_one();
        });
        self.current = Some(CurrentRunner {
            body_state,
            more_body,
            handle,
            done,
            notify,
        });
    }

    /// Mirrors `on_response_complete`: once the current runner's response
    /// has settled to `more_body == false` *and* its task has finished,
    /// pop the pipeline head and schedule it as the new current runner
    /// (I2's strict FIFO: push tail in `schedule`, pop head here).
    fn reap_current_if_done(&mut self) {
        let finished = match &self.current {
            Some(c) => c.done.load(Ordering::SeqCst) && !c.more_body.load(Ordering::SeqCst),
            None => false,
        };
        if finished {
            self.current = None;
        }
        if self.current.is_none() {
            if let Some(next) = self.pipeline.pop_front() {
                self.spawn_current(next.runner, next.body_state);
            }
        }
    }
}

impl<R, W> Drop for Connection<R, W> {
    fn drop(&mut self) {
        if let Some(current) = self.current.take() {
            current.handle.abort();
        }
        for pending in self.pipeline.drain(..) {
            drop(pending);
        }
    }
}
