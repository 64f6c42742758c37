//! The gateway contract: the three-argument async application protocol
//! (environment, receive, send) carrying typed events, per §6 of the
//! specification. Everything in this module is the *seam* the core exposes
//! to an application; the application itself is an external collaborator.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use bytes::Bytes;

/// A raw, case- and order-preserving header pair as received on the wire
/// (P3: the environment's `headers` must equal the received bytes verbatim).
pub type HeaderPair = (Bytes, Bytes);

/// The application state bag shared across every request on a server
/// (§3: "a mapping from string to arbitrary value"). The core never reads
/// or writes into it; it is opaque, shared-read state owned by the
/// application via the lifespan handshake.
pub type AppState = Arc<RwLock<serde_json::Map<String, serde_json::Value>>>;

/// The immutable per-request environment passed to the application
/// (component C4). Cheap to clone: every byte field is a `Bytes` slice of
/// the original read buffer.
#[derive(Debug, Clone)]
pub struct Environment {
    pub r#type: &'static str,
    pub asgi_version: &'static str,
    pub spec_version: &'static str,
    pub http_version: &'static str,
    pub method: Bytes,
    pub scheme: &'static str,
    pub path: String,
    pub raw_path: Bytes,
    pub query_string: Bytes,
    pub root_path: Arc<str>,
    pub headers: Vec<HeaderPair>,
    pub client: (String, u16),
    pub server: (String, u16),
    pub state: AppState,
}

/// The lifespan scope (§4.7, §3): carries only the application state bag,
/// mirroring `Lifespan.scope` in the donor implementation (`type`, `asgi`
/// version info, `state`).
#[derive(Debug, Clone)]
pub struct LifespanScope {
    pub r#type: &'static str,
    pub asgi_version: &'static str,
    pub spec_version: &'static str,
    pub state: AppState,
}

/// The scope an application invocation runs under: either one HTTP request
/// or the one-per-server lifespan handshake. Mirrors ASGI's polymorphic
/// `scope["type"]`, made an explicit Rust enum instead of a tagged dict.
#[derive(Debug, Clone)]
pub enum Scope {
    Http(Environment),
    Lifespan(LifespanScope),
}

/// Events the core hands to the application via `receive()`.
#[derive(Debug, Clone)]
pub enum RequestEvent {
    /// `http.request`: a chunk (possibly the whole) of the request body.
    Http {
        body: Option<Bytes>,
        more_body: bool,
    },
    /// `lifespan.startup`
    LifespanStartup,
    /// `lifespan.shutdown`
    LifespanShutdown,
}

/// Events the application hands back to the core via `send()`.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// `http.response.start`
    Start {
        status: u16,
        headers: Vec<HeaderPair>,
    },
    /// `http.response.body`
    Body { body: Bytes, more_body: bool },
    /// `http.response.zerocopysend`
    ZeroCopySend { file: i32, count: Option<usize> },
    /// `lifespan.startup.complete` / `lifespan.startup.failed`
    LifespanStartupComplete { failed: Option<String> },
    /// `lifespan.shutdown.complete` / `lifespan.shutdown.failed`
    LifespanShutdownComplete { failed: Option<String> },
}

/// A boxed future, used to type-erase the application callable and the
/// optional TLS acceptor without pulling in an async-trait dependency.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// `receive`: pulls the next event the application should observe.
pub type Receiver<'a> = Box<dyn FnMut() -> BoxFuture<'a, RequestEvent> + Send + 'a>;

/// `send`: hands an event produced by the application back to the core.
pub type Sender<'a> = Box<dyn FnMut(ResponseEvent) -> BoxFuture<'a, ()> + Send + 'a>;

/// An application honoring the gateway contract: an async callable of
/// `(environment, receive, send)`. Implemented for any `Fn` returning a
/// boxed future so that both free functions and `Arc<dyn Application>`
/// trait objects work as the application handle threaded through the
/// server, worker, and arbiter.
pub trait Application: Send + Sync + 'static {
    fn call<'a>(
        &'a self,
        scope: Scope,
        receive: Receiver<'a>,
        send: Sender<'a>,
    ) -> BoxFuture<'a, Result<(), String>>;
}

impl<F> Application for F
where
    F: for<'a> Fn(Scope, Receiver<'a>, Sender<'a>) -> BoxFuture<'a, Result<(), String>>
        + Send
        + Sync
        + 'static,
{
    fn call<'a>(
        &'a self,
        scope: Scope,
        receive: Receiver<'a>,
        send: Sender<'a>,
    ) -> BoxFuture<'a, Result<(), String>> {
        (self)(scope, receive, send)
    }
}

pub(crate) fn new_app_state() -> AppState {
    Arc::new(RwLock::new(serde_json::Map::new()))
}

/// HTTP methods that never carry a request body (§4.5, widened per
/// REDESIGN intent from the original's GET-only special case).
pub(crate) fn is_no_body_method(method: &[u8]) -> bool {
    matches!(method, b"GET" | b"HEAD" | b"OPTIONS")
}
