//! Listener setup (part of C8). Converts the `std::net::TcpListener` the
//! config produces (§4.10's shared-listener discipline) into a
//! `tokio::net::TcpListener`, grounded in the teacher's
//! `AddrIncoming::from_std` (`server/tcp.rs`): the standard listener must be
//! put in nonblocking mode before `TcpListener::from_std` will accept it,
//! since `from_std` doesn't do this itself.

use std::net::TcpListener as StdTcpListener;

use tokio::net::TcpListener;

use crate::error::Error;

pub(crate) fn from_std(std_listener: StdTcpListener) -> crate::error::Result<TcpListener> {
    std_listener.set_nonblocking(true).map_err(Error::new_listen)?;
    TcpListener::from_std(std_listener).map_err(Error::new_listen)
}
