//! Arbiter / supervisor (C10): forks N workers, multiplexes their stdio
//! back onto its own, and handles SIGINT/SIGHUP/SIGTERM uniformly as a
//! stop request. Grounded in `uasgi/arbiter.py`'s `Arbiter` class; the
//! stdio mux thread mirrors `Arbiter.sync_stdio`'s `add_reader` + `sendfile`
//! loop, translated onto a blocking `poll(2)` loop since there is no
//! asyncio event loop on the arbiter side in this design (§4.10, §5 — the
//! arbiter itself is not one of the per-worker event loops).

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::worker::{self, AppFactory};

/// Arbiter-to-worker join timeout (§5: "a worker that does not exit within
/// the window is abandoned").
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const STDIO_CHUNK: usize = 1024;

struct WorkerRecord {
    pid: libc::pid_t,
    stdout_fd: RawFd,
    stderr_fd: RawFd,
}

pub struct Arbiter {
    config: Config,
    app_factory: AppFactory,
}

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_stop_signal(_signum: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

impl Arbiter {
    pub fn new(app_factory: AppFactory, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Arbiter { config, app_factory })
    }

    /// Forks the configured number of workers and blocks until a stop
    /// signal arrives, then joins (or abandons) them. Returns once every
    /// worker has been accounted for.
    pub fn main(mut self) -> Result<()> {
        crate::logging::init(self.config.log_level);
        println!("{}", self.config);

        if self.config.workers == 0 {
            return Err(Error::new_config("workers must be >= 1"));
        }

        install_signal_handlers();

        let mut workers = Vec::with_capacity(self.config.workers);
        for _ in 0..self.config.workers {
            workers.push(self.spawn_worker()?);
        }

        let mux_stop = Arc::new(AtomicBool::new(false));
        let mux_handle = spawn_stdio_mux(&workers, mux_stop.clone());

        tracing::info!(workers = workers.len(), "arbiter running");
        while !STOP_REQUESTED.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(200));
        }

        tracing::info!("arbiter stopping workers");
        for w in &workers {
            // SAFETY: `w.pid` is a live child of this process.
            unsafe {
                libc::kill(w.pid, libc::SIGTERM);
            }
        }

        let deadline = Instant::now() + JOIN_TIMEOUT;
        for w in &workers {
            join_with_deadline(w.pid, deadline);
        }

        mux_stop.store(true, Ordering::SeqCst);
        let _ = mux_handle.join();

        tracing::info!("arbiter exiting");
        Ok(())
    }

    fn spawn_worker(&mut self) -> Result<WorkerRecord> {
        let (stdout_r, stdout_w) = make_pipe()?;
        let (stderr_r, stderr_w) = make_pipe()?;
        let worker_config = self.config.for_worker()?;
        let app_factory = self.app_factory;

        // SAFETY: the arbiter is single-threaded at this point (the stdio
        // mux thread is started only after every worker has been forked),
        // satisfying `fork`'s async-signal-safety requirement that no other
        // thread holds a lock the child might need.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(Error::new_config("fork failed")),
            0 => {
                unsafe {
                    libc::close(stdout_r);
                    libc::close(stderr_r);
                }
                worker::redirect_stdio(stdout_w, stderr_w);
                let code = worker::run_child(app_factory, worker_config);
                std::process::exit(code);
            }
            child_pid => {
                unsafe {
                    libc::close(stdout_w);
                    libc::close(stderr_w);
                }
                set_nonblocking(stdout_r)?;
                set_nonblocking(stderr_r)?;
                Ok(WorkerRecord {
                    pid: child_pid,
                    stdout_fd: stdout_r,
                    stderr_fd: stderr_r,
                })
            }
        }
    }
}

fn install_signal_handlers() {
    // SAFETY: `on_stop_signal` only performs an atomic store, which is
    // async-signal-safe; installed once, before any worker is forked.
    unsafe {
        libc::signal(libc::SIGINT, on_stop_signal as usize);
        libc::signal(libc::SIGTERM, on_stop_signal as usize);
        libc::signal(libc::SIGHUP, on_stop_signal as usize);
    }
}

fn join_with_deadline(pid: libc::pid_t, deadline: Instant) {
    while Instant::now() < deadline {
        let mut status: libc::c_int = 0;
        // SAFETY: `pid` was returned by a prior `fork()` in this process.
        let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if ret == pid || ret < 0 {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    tracing::warn!(pid, "worker did not exit within the join timeout, abandoning");
}

fn make_pipe() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: `fds` is a valid 2-element buffer for `pipe(2)`.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(Error::new_listen(io::Error::last_os_error()));
    }
    Ok((fds[0], fds[1]))
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: `fd` is a valid, open descriptor owned by this process.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::new_listen(io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Spawns the background thread that splices each worker's stdout/stderr
/// onto the arbiter's own, polling all read ends in one loop (the blocking
/// analogue of `Arbiter.sync_stdio`'s `asyncio` reader callbacks).
fn spawn_stdio_mux(workers: &[WorkerRecord], stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    let fds: Vec<(RawFd, RawFd)> = workers
        .iter()
        .flat_map(|w| [(libc::STDOUT_FILENO, w.stdout_fd), (libc::STDERR_FILENO, w.stderr_fd)])
        .collect();

    std::thread::spawn(move || {
        let mut pollfds: Vec<libc::pollfd> = fds
            .iter()
            .map(|(_, in_fd)| libc::pollfd {
                fd: *in_fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        while !stop.load(Ordering::SeqCst) {
            // SAFETY: `pollfds` is a valid array of the right length for
            // the duration of the call.
            let ready = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, 200) };
            if ready <= 0 {
                continue;
            }
            for (pfd, (out_fd, in_fd)) in pollfds.iter_mut().zip(fds.iter()) {
                if pfd.revents & libc::POLLIN != 0 {
                    let _ = splice_chunk(*out_fd, *in_fd);
                }
                pfd.revents = 0;
            }
        }
    })
}

/// Copies up to `STDIO_CHUNK` bytes from `in_fd` to `out_fd`, preferring
/// `sendfile(2)` (§4.10's literal technique) and falling back to a
/// `read`+`write` pair when the kernel rejects a pipe as `in_fd` (pipe
/// support for `sendfile`'s `in_fd` varies by platform and kernel version).
fn splice_chunk(out_fd: RawFd, in_fd: RawFd) -> io::Result<usize> {
    match raw_sendfile(out_fd, in_fd, STDIO_CHUNK) {
        Ok(n) => Ok(n),
        Err(ref e) if e.raw_os_error() == Some(libc::EINVAL) => read_write_chunk(out_fd, in_fd, STDIO_CHUNK),
        Err(e) => Err(e),
    }
}

#[cfg(target_os = "linux")]
fn raw_sendfile(out_fd: RawFd, in_fd: RawFd, count: usize) -> io::Result<usize> {
    // SAFETY: both descriptors are open for the duration of this call; a
    // null offset tells the kernel to use and advance `in_fd`'s own stream
    // position, which is the only valid mode for a pipe source.
    let ret = unsafe { libc::sendfile(out_fd, in_fd, std::ptr::null_mut(), count) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

#[cfg(not(target_os = "linux"))]
fn raw_sendfile(_out_fd: RawFd, _in_fd: RawFd, _count: usize) -> io::Result<usize> {
    Err(io::Error::from_raw_os_error(libc::EINVAL))
}

fn read_write_chunk(out_fd: RawFd, in_fd: RawFd, count: usize) -> io::Result<usize> {
    let mut buf = vec![0u8; count];
    // SAFETY: `buf` is valid for `count` bytes; both fds are open.
    let read = unsafe { libc::read(in_fd, buf.as_mut_ptr() as *mut libc::c_void, count) };
    if read <= 0 {
        return if read < 0 { Err(io::Error::last_os_error()) } else { Ok(0) };
    }
    let written = unsafe { libc::write(out_fd, buf.as_ptr() as *const libc::c_void, read as usize) };
    if written < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(written as usize)
}
