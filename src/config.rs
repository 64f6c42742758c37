//! Server configuration (ambient stack, SPEC_FULL §A). The Rust shape of
//! `uasgi/config.py`'s `Config` class: connection parameters, worker count,
//! TLS file paths, and the logging/lifespan/access-log flags the rest of
//! the crate treats as external collaborators (§1, §6).

use std::fmt;
use std::net::TcpListener as StdTcpListener;
use std::os::unix::io::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Error, Result};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5000;
const DEFAULT_BACKLOG: i32 = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        })
    }
}

/// Server configuration. `sock` mirrors `Config.sock`/`Config.socket` in the
/// donor: a config may already carry a bound listener (tests, externally
/// managed sockets via systemd-style activation) or lazily create one on
/// first use (SPEC_FULL §B.6).
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: Option<i32>,
    pub workers: usize,
    pub ssl_cert_file: Option<String>,
    pub ssl_key_file: Option<String>,
    pub log_level: LogLevel,
    pub log_fmt: Option<String>,
    pub access_log: bool,
    pub access_log_fmt: Option<String>,
    pub lifespan: bool,
    sock: Option<StdTcpListener>,
}

impl Config {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Config {
            host: host.into(),
            port,
            backlog: None,
            workers: 1,
            ssl_cert_file: None,
            ssl_key_file: None,
            log_level: LogLevel::Info,
            log_fmt: None,
            access_log: true,
            access_log_fmt: None,
            lifespan: false,
            sock: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn with_lifespan(mut self, enabled: bool) -> Self {
        self.lifespan = enabled;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Supplies an already-bound listener instead of letting the config
    /// create one (tests / externally managed sockets).
    pub fn with_socket(mut self, sock: StdTcpListener) -> Self {
        self.sock = Some(sock);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::new_config("workers must be >= 1"));
        }
        Ok(())
    }

    /// Produces an independent config for one forked worker: scalar fields
    /// are copied, and a pre-supplied listener (via `with_socket`) is
    /// `dup`'d so every worker gets its own fd over the same underlying
    /// socket. A config with no pre-supplied listener is left `sock: None`
    /// so each worker lazily creates (and `SO_REUSEPORT`-shares) its own,
    /// matching `Worker.serve`'s `self.config.create_socket()` in the donor.
    pub(crate) fn for_worker(&self) -> Result<Config> {
        let sock = match &self.sock {
            Some(listener) => Some(listener.try_clone().map_err(Error::new_listen)?),
            None => None,
        };
        Ok(Config {
            host: self.host.clone(),
            port: self.port,
            backlog: self.backlog,
            workers: self.workers,
            ssl_cert_file: self.ssl_cert_file.clone(),
            ssl_key_file: self.ssl_key_file.clone(),
            log_level: self.log_level,
            log_fmt: self.log_fmt.clone(),
            access_log: self.access_log,
            access_log_fmt: self.access_log_fmt.clone(),
            lifespan: self.lifespan,
            sock,
        })
    }

    /// Returns the bound listener, creating it on first access if the
    /// config wasn't given one (`Config.socket` property in the donor).
    pub fn socket(&mut self) -> Result<StdTcpListener> {
        if let Some(existing) = &self.sock {
            return existing.try_clone().map_err(Error::new_listen);
        }
        let created = self.create_socket()?;
        let clone = created.try_clone().map_err(Error::new_listen)?;
        self.sock = Some(created);
        Ok(clone)
    }

    /// Builds the listening socket per §6: IPv4, `SOCK_STREAM`,
    /// `SO_REUSEPORT=1`, `TCP_NODELAY=1`, nonblocking, the configured
    /// backlog (or 4096), inheritable only when running with workers.
    fn create_socket(&self) -> Result<StdTcpListener> {
        let addr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| Error::new_config("invalid host/port"))?;

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(Error::new_listen)?;
        socket.set_reuse_address(true).map_err(Error::new_listen)?;
        socket.set_reuse_port(true).map_err(Error::new_listen)?;
        socket.set_nodelay(true).map_err(Error::new_listen)?;
        socket.set_nonblocking(true).map_err(Error::new_listen)?;
        socket.bind(&addr).map_err(Error::new_listen)?;
        socket
            .listen(self.backlog.unwrap_or(DEFAULT_BACKLOG))
            .map_err(Error::new_listen)?;

        if self.workers > 0 {
            clear_cloexec(socket.as_raw_fd())?;
        }

        Ok(socket.into())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

#[cfg(target_os = "linux")]
fn clear_cloexec(fd: std::os::unix::io::RawFd) -> Result<()> {
    // SAFETY: `fd` is a valid, open descriptor owned by this process for
    // the duration of the call.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(Error::new_listen(std::io::Error::last_os_error()));
        }
        if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
            return Err(Error::new_listen(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn clear_cloexec(_fd: std::os::unix::io::RawFd) -> Result<()> {
    Ok(())
}

impl fmt::Display for Config {
    /// Startup diagnostics banner, matching `Config.__str__` in the donor.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let title = "Starting gateway-contract HTTP server with configuration";
        writeln!(f, "{title}")?;
        writeln!(f, "{}", "=".repeat(title.len()))?;
        writeln!(f, "Host             : {}", self.host)?;
        writeln!(f, "Port             : {}", self.port)?;
        writeln!(f, "Backlog          : {}", self.backlog.unwrap_or(DEFAULT_BACKLOG))?;
        writeln!(f, "Workers          : {}", self.workers)?;
        writeln!(f, "SSL Enabled      : {}", self.ssl_cert_file.is_some() && self.ssl_key_file.is_some())?;
        writeln!(f, "Log Level        : {}", self.log_level)?;
        writeln!(f, "Access Log       : {}", self.access_log)?;
        writeln!(f, "Lifespan         : {}", self.lifespan)?;
        write!(f, "{}", "=".repeat(title.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_workers_fails_validation() {
        let cfg = Config::new("127.0.0.1", 0).with_workers(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn display_includes_host_and_port() {
        let cfg = Config::new("127.0.0.1", 8080);
        let banner = cfg.to_string();
        assert!(banner.contains("127.0.0.1"));
        assert!(banner.contains("8080"));
    }
}
