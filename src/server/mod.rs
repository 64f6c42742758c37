//! Server module (C8): listener setup plus the `Server` type itself.

mod server;
mod tcp;

pub use server::Server;
