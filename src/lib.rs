//! `gasket`: a preforked HTTP/1.1 server core for asynchronous
//! gateway-contract applications.
//!
//! The crate is layered bottom-up: [`proto::h1`] parses and frames HTTP/1.1
//! on the wire and drives one connection end to end; [`gateway`] defines the
//! application contract those connections invoke; [`lifespan`] runs the
//! one-per-server startup/shutdown handshake against that same contract;
//! [`server::Server`] owns the listener and ties connections and lifespan
//! together; [`worker`] runs one `Server` per forked process; [`arbiter`]
//! forks and supervises the worker pool. [`config`] and [`logging`] are the
//! ambient configuration and tracing setup shared by all of the above.

pub mod arbiter;
pub mod config;
pub mod error;
mod flow;
pub mod gateway;
pub mod lifespan;
pub mod logging;
pub mod proto;
pub mod server;
pub mod worker;

pub use arbiter::Arbiter;
pub use config::{Config, LogLevel};
pub use error::{Error, Result};
pub use gateway::{
    AppState, Application, BoxFuture, Environment, HeaderPair, LifespanScope, Receiver,
    RequestEvent, ResponseEvent, Scope, Sender,
};
pub use server::Server;
pub use worker::AppFactory;
