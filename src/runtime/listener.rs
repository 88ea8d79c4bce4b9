//! Listening socket setup and the accept loop.
//!
//! Setup (socket, options, bind, listen) is retried forever with an
//! exponential backoff of 0, 2, 4, 8, ... seconds. Once listening, every
//! accepted connection becomes an `Endpoint` served on the worker pool. An
//! `accept` failure stops the listener; connections already being served
//! are unaffected.

use crate::runtime::connection::Endpoint;
use crate::runtime::dispatch::serve;
use crate::runtime::manager::Shared;
use crate::runtime::pool::Submitter;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// First non-zero retry delay.
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);

/// Retry delays: zero, then 2s doubling without bound.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            next: Duration::ZERO,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = if current.is_zero() {
            INITIAL_BACKOFF
        } else {
            current.saturating_mul(2)
        };
        Some(current)
    }
}

/// Call `bind` until it succeeds, calling `pause` with the backoff delay
/// before every attempt. Gives up only when `pause` returns `false`.
pub fn listen_with_retry<T, B, P>(mut bind: B, mut pause: P) -> Option<T>
where
    B: FnMut() -> io::Result<T>,
    P: FnMut(Duration) -> bool,
{
    for delay in Backoff::new() {
        if !pause(delay) {
            return None;
        }
        match bind() {
            Ok(listener) => return Some(listener),
            Err(e) => warn!(error = %e, waited_secs = delay.as_secs(), "Listener setup failed, retrying"),
        }
    }
    None
}

/// Create a listening TCP socket with address reuse enabled.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Low-latency options for an accepted socket.
fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_reuse_address(true)
}

/// Accept connections until shutdown or an accept failure.
pub(crate) fn accept_loop(shared: Arc<Shared>, submitter: Submitter) {
    let addr = shared.bind_addr();
    let backlog = shared.settings.listen_backlog;

    let listener = match listen_with_retry(|| bind_listener(addr, backlog), |delay| shared.pause(delay)) {
        Some(listener) => listener,
        None => {
            info!("Shutdown requested before listener was ready");
            return;
        }
    };

    let local_addr = match listener.local_addr() {
        Ok(local_addr) => local_addr,
        Err(e) => {
            error!(error = %e, "Listener has no local address");
            return;
        }
    };
    if !shared.set_listening(local_addr) {
        return;
    }
    info!(address = %local_addr, "Listening");

    loop {
        let (stream, peer) = match listener.accept() {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Accept failed, listener stopping");
                return;
            }
        };

        if let Err(e) = configure_stream(&stream) {
            warn!(peer = %peer, error = %e, "Failed to set socket options");
        }

        if shared.is_shutdown() {
            debug!(peer = %peer, "Shutting down, connection dropped");
            break;
        }

        debug!(peer = %peer, "Accepted connection");
        let endpoint = Endpoint::new(stream, Arc::clone(&shared.handler), shared.settings.codec);
        if let Err(e) = submitter.submit(move || serve(endpoint)) {
            warn!(peer = %peer, error = %e, "Could not schedule connection");
            break;
        }
    }

    info!(address = %local_addr, "Listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let delays: Vec<u64> = Backoff::new().take(6).map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![0, 2, 4, 8, 16, 32]);
    }

    #[test]
    fn test_backoff_saturates() {
        let last = Backoff::new().nth(200).unwrap();
        assert_eq!(last, Duration::MAX);
    }

    #[test]
    fn test_retry_until_bind_succeeds() {
        let mut attempts = 0;
        let mut waited = Vec::new();

        let result = listen_with_retry(
            || {
                attempts += 1;
                if attempts < 5 {
                    Err(io::Error::new(io::ErrorKind::AddrInUse, "address in use"))
                } else {
                    Ok(attempts)
                }
            },
            |delay| {
                waited.push(delay.as_secs());
                true
            },
        );

        assert_eq!(result, Some(5));
        assert_eq!(waited, vec![0, 2, 4, 8, 16]);
    }

    #[test]
    fn test_retry_stops_when_pause_refuses() {
        let mut attempts = 0;
        let result: Option<()> = listen_with_retry(
            || {
                attempts += 1;
                Err(io::Error::new(io::ErrorKind::AddrInUse, "address in use"))
            },
            |delay| delay < Duration::from_secs(8),
        );

        assert_eq!(result, None);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_bind_listener_accepts() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 10).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();
        configure_stream(&stream).unwrap();
        assert!(stream.nodelay().unwrap());
        drop(client);
    }
}
