//! Error and Result types for the connection core.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// An error that can occur while driving a connection, a worker, or the
/// arbiter.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// Malformed HTTP/1.1 bytes on the wire.
    Parse,
    /// The peer closed (or reset) the connection.
    TransportClosed,
    /// An `io::Error` while reading or writing the socket.
    Io,
    /// The lifespan application signalled `lifespan.startup.failed`.
    LifespanStartup,
    /// The lifespan application signalled `lifespan.shutdown.failed`.
    LifespanShutdown,
    /// A listener/socket could not be created or bound.
    Listen,
    /// The worker count or other config value is invalid.
    Config,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(kind: Kind, cause: C) -> Error {
        Error {
            inner: Box::new(ErrorImpl {
                kind,
                cause: Some(cause.into()),
            }),
        }
    }

    pub(crate) fn new_parse() -> Error {
        Error::new(Kind::Parse)
    }

    pub(crate) fn new_transport_closed() -> Error {
        Error::new(Kind::TransportClosed)
    }

    pub(crate) fn new_io(cause: io::Error) -> Error {
        Error::with(Kind::Io, cause)
    }

    pub(crate) fn new_listen(cause: io::Error) -> Error {
        Error::with(Kind::Listen, cause)
    }

    pub(crate) fn new_lifespan_startup(message: impl Into<String>) -> Error {
        Error::with(Kind::LifespanStartup, message.into())
    }

    pub(crate) fn new_lifespan_shutdown(message: impl Into<String>) -> Error {
        Error::with(Kind::LifespanShutdown, message.into())
    }

    pub(crate) fn new_config(message: impl Into<String>) -> Error {
        Error::with(Kind::Config, message.into())
    }

    /// True if this error means the connection or transport is no longer
    /// usable and should be torn down.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::TransportClosed | Kind::Io)
    }

    /// True if this error came from malformed request bytes.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("gasket::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Parse => f.write_str("invalid HTTP/1.1 request"),
            Kind::TransportClosed => f.write_str("connection closed by peer"),
            Kind::Io => f.write_str("I/O error"),
            Kind::LifespanStartup => f.write_str("lifespan startup failed"),
            Kind::LifespanShutdown => f.write_str("lifespan shutdown failed"),
            Kind::Listen => f.write_str("failed to bind listening socket"),
            Kind::Config => f.write_str("invalid configuration"),
        }?;
        if let Some(ref cause) = self.inner.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.cause.as_ref().map(|c| &**c as &(dyn StdError + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::new_io(err)
    }
}
