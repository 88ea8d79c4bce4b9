//! Server manager: owns the worker pool, the shutdown flag and the
//! listener's lifecycle.

use crate::protocol::Codec;
use crate::runtime::connection::Endpoint;
use crate::runtime::dispatch::{serve, Handler};
use crate::runtime::listener::accept_loop;
use crate::runtime::pool::{PoolError, WorkerPool};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// How long shutdown waits when poking a blocked accept loop.
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Runtime settings for a manager.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Address to bind.
    pub host: IpAddr,
    /// Port to listen on; 0 disables the listener.
    pub port: u16,
    /// Connection handler threads. The pool gets two extra workers.
    pub threads: usize,
    /// Jobs that may wait for a free worker before submission blocks.
    pub queue_depth: usize,
    /// Pending connection backlog of the listening socket.
    pub listen_backlog: i32,
    pub codec: Codec,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            threads: 10,
            queue_depth: 10,
            listen_backlog: 10,
            codec: Codec::default(),
        }
    }
}

impl Settings {
    pub fn new(threads: usize, port: u16) -> Self {
        Self {
            threads,
            port,
            ..Self::default()
        }
    }
}

struct State {
    shutdown: bool,
    local_addr: Option<SocketAddr>,
}

/// State shared between the manager and its accept loop.
pub(crate) struct Shared {
    pub(crate) settings: Settings,
    pub(crate) handler: Arc<dyn Handler>,
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.settings.host, self.settings.port)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Wait out `delay` unless shutdown is requested first. Returns `false`
    /// once shut down.
    pub(crate) fn pause(&self, delay: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, delay, |state| !state.shutdown)
            .unwrap_or_else(PoisonError::into_inner);
        !guard.shutdown
    }

    /// Record the bound address. Returns `false` if shutdown won the race.
    pub(crate) fn set_listening(&self, addr: SocketAddr) -> bool {
        let mut state = self.lock();
        if state.shutdown {
            return false;
        }
        state.local_addr = Some(addr);
        self.changed.notify_all();
        true
    }
}

/// A running Hermes server.
pub struct Manager {
    shared: Arc<Shared>,
    pool: WorkerPool,
}

impl Manager {
    /// Start the worker pool and, when `settings.port > 0`, the accept loop.
    ///
    /// Returns without waiting for the listener: setup failures are retried
    /// in the background. Use [`Manager::wait_listening`] to wait for it.
    pub fn start(settings: Settings, handler: Arc<dyn Handler>) -> io::Result<Self> {
        ignore_sigpipe();

        let pool = WorkerPool::new(settings.threads + 2, settings.queue_depth)?;
        let shared = Arc::new(Shared {
            settings,
            handler,
            state: Mutex::new(State {
                shutdown: false,
                local_addr: None,
            }),
            changed: Condvar::new(),
        });

        if shared.settings.port > 0 {
            let listener_shared = Arc::clone(&shared);
            let submitter = pool.submitter();
            pool.submit(move || accept_loop(listener_shared, submitter))
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }

        info!(
            host = %shared.settings.host,
            port = shared.settings.port,
            workers = pool.size(),
            integrity = ?shared.settings.codec.integrity,
            "Manager started"
        );

        Ok(Self { shared, pool })
    }

    /// Serve an already connected stream on the pool.
    pub fn serve(&self, stream: TcpStream) -> Result<(), PoolError> {
        let endpoint = Endpoint::new(stream, Arc::clone(&self.shared.handler), self.shared.settings.codec);
        self.pool.submit(move || serve(endpoint))
    }

    /// Address the listener is bound to, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.lock().local_addr
    }

    /// Block until the listener is bound, shutdown starts, or `timeout`
    /// passes.
    pub fn wait_listening(&self, timeout: Duration) -> Option<SocketAddr> {
        let guard = self.shared.lock();
        let (guard, _) = self
            .shared
            .changed
            .wait_timeout_while(guard, timeout, |state| {
                state.local_addr.is_none() && !state.shutdown
            })
            .unwrap_or_else(PoisonError::into_inner);
        guard.local_addr
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Stop accepting connections and shut the pool down.
    ///
    /// Graceful shutdown blocks until queued work is done and every
    /// connection loop has ended on its own. Forced shutdown drops queued
    /// connections and returns without waiting for active ones.
    pub fn shutdown(self, force: bool) {
        let listening = {
            let mut state = self.shared.lock();
            state.shutdown = true;
            self.shared.changed.notify_all();
            state.local_addr
        };

        if let Some(addr) = listening {
            wake_listener(addr);
        }

        self.pool.shutdown(force);
        info!(force, "Manager shut down");
    }
}

/// Unblock an accept loop waiting on `addr` so it observes shutdown.
fn wake_listener(addr: SocketAddr) {
    let target = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port()),
        _ => addr,
    };

    if let Err(e) = TcpStream::connect_timeout(&target, WAKE_TIMEOUT) {
        debug!(address = %target, error = %e, "Listener wake-up connect failed");
    }
}

/// Make failed writes surface as `EPIPE` errors instead of killing the
/// process.
#[cfg(unix)]
fn ignore_sigpipe() {
    // SAFETY: installs the predefined SIG_IGN disposition; no handler code runs.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
fn ignore_sigpipe() {}
