//! Connected sockets speaking the Hermes protocol.
//!
//! `Endpoint` wraps a socket accepted by the manager; `Connector` wraps an
//! outbound connection made by a client. Both receive and send one message
//! at a time through the codec and own their socket exclusively: dropping
//! (or closing) the object closes the socket exactly once.

use crate::protocol::{encode_header, encoded_len, Codec, Message, ProtocolError};
use crate::runtime::dispatch::Handler;
use bytes::BytesMut;
use std::io::{self, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Lifecycle of a connection object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Created but not yet serving, or closed.
    Free,
    /// Driving a receive/dispatch loop.
    Used,
}

/// Socket state shared by endpoints and connectors.
struct Link {
    reader: BufReader<TcpStream>,
    peer: Option<SocketAddr>,
    started: Instant,
    status: Status,
    codec: Codec,
}

impl Link {
    fn new(stream: TcpStream, codec: Codec) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            reader: BufReader::new(stream),
            peer,
            started: Instant::now(),
            status: Status::Free,
            codec,
        }
    }

    fn recv(&mut self) -> Result<Message, ProtocolError> {
        self.codec.decode(&mut self.reader)
    }

    fn send(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        send_message(self.reader.get_mut(), msg)
    }

    fn close(mut self, role: &'static str) {
        self.status = Status::Free;
        // The peer may already be gone; the socket is closed on drop either way.
        let _ = self.reader.get_ref().shutdown(Shutdown::Both);
        debug!(
            role,
            peer = ?self.peer,
            lifetime_ms = self.started.elapsed().as_millis() as u64,
            "Connection closed"
        );
    }
}

/// Write the header block in one reliable write, then the body (if any) in
/// a second.
pub(crate) fn send_message<W: Write>(writer: &mut W, msg: &Message) -> Result<(), ProtocolError> {
    let mut header = BytesMut::with_capacity(encoded_len(msg).unwrap_or(0));
    encode_header(msg, &mut header)?;
    writer.write_all(&header)?;

    if let Some(body) = msg.body() {
        writer.write_all(body)?;
    }
    writer.flush()?;

    trace!(verb = ?msg.verb(), header = header.len(), body = msg.body_size(), "Sent message");
    Ok(())
}

/// Server side of an accepted connection.
pub struct Endpoint {
    link: Link,
    handler: Arc<dyn Handler>,
}

impl Endpoint {
    /// Wrap an accepted socket, bound to the handler that will serve it.
    pub fn new(stream: TcpStream, handler: Arc<dyn Handler>, codec: Codec) -> Self {
        Self {
            link: Link::new(stream, codec),
            handler,
        }
    }

    /// Receive one message.
    pub fn recv(&mut self) -> Result<Message, ProtocolError> {
        self.link.recv()
    }

    /// Send one message.
    pub fn send(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        self.link.send(msg)
    }

    pub fn handler(&self) -> Arc<dyn Handler> {
        Arc::clone(&self.handler)
    }

    pub fn status(&self) -> Status {
        self.link.status
    }

    pub(crate) fn set_status(&mut self, status: Status) {
        self.link.status = status;
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.link.peer
    }

    /// Time since the endpoint was created.
    pub fn age(&self) -> Duration {
        self.link.started.elapsed()
    }

    pub fn codec(&self) -> &Codec {
        &self.link.codec
    }

    /// Close the socket and release the endpoint.
    pub fn close(self) {
        self.link.close("endpoint");
    }
}

/// Client side of an outbound connection.
pub struct Connector {
    link: Link,
}

impl Connector {
    /// Connect to `host:port` with the default codec.
    pub fn connect(host: &str, port: u16) -> io::Result<Self> {
        Self::connect_with(host, port, Codec::default())
    }

    /// Resolve `host`, connect to the first reachable address and disable
    /// Nagle's algorithm on the socket.
    pub fn connect_with(host: &str, port: u16, codec: Codec) -> io::Result<Self> {
        let mut last_err = None;

        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(peer = %addr, "Connected");
                    let mut link = Link::new(stream, codec);
                    link.status = Status::Used;
                    return Ok(Self { link });
                }
                Err(e) => {
                    trace!(peer = %addr, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("could not resolve {}", host),
            )
        }))
    }

    /// Receive one message.
    pub fn recv(&mut self) -> Result<Message, ProtocolError> {
        self.link.recv()
    }

    /// Send one message.
    pub fn send(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        self.link.send(msg)
    }

    /// Send `msg` and wait for one reply.
    pub fn request(&mut self, msg: &Message) -> Result<Message, ProtocolError> {
        self.send(msg)?;
        self.recv()
    }

    pub fn status(&self) -> Status {
        self.link.status
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.link.peer
    }

    /// Time since the connection was established.
    pub fn age(&self) -> Duration {
        self.link.started.elapsed()
    }

    pub fn codec(&self) -> &Codec {
        &self.link.codec
    }

    /// Close the socket and release the connector.
    pub fn close(self) {
        self.link.close("connector");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Integrity;
    use crate::runtime::dispatch::DefaultHandler;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    /// Writer that accepts at most `chunk` bytes per call.
    struct Trickle {
        out: Vec<u8>,
        chunk: usize,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.chunk);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_send_message_survives_partial_writes() {
        let mut msg = Message::with_verb("COPY");
        msg.set_body_with(b"hello", Integrity::Disabled).unwrap();

        let mut writer = Trickle {
            out: Vec::new(),
            chunk: 3,
        };
        send_message(&mut writer, &msg).unwrap();
        assert_eq!(writer.out, b"COPY\nContent-Length:5\n.\nhello");
    }

    #[test]
    fn test_send_without_verb_fails() {
        let mut out = Vec::new();
        assert!(matches!(
            send_message(&mut out, &Message::new()),
            Err(ProtocolError::MissingVerb)
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_endpoint_and_connector_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut endpoint = Endpoint::new(
                stream,
                Arc::new(DefaultHandler),
                Codec::default().with_integrity(Integrity::Disabled),
            );
            assert_eq!(endpoint.status(), Status::Free);

            let request = endpoint.recv().unwrap();
            assert!(request.is_verb("ECHO"));
            let mut reply = Message::with_verb("ECHOED");
            reply.set_body_with(request.body().unwrap(), Integrity::Disabled)
                .unwrap();
            endpoint.send(&reply).unwrap();
            endpoint.close();
        });

        let mut connector = Connector::connect_with(
            "127.0.0.1",
            port,
            Codec::default().with_integrity(Integrity::Disabled),
        )
        .unwrap();
        let mut request = Message::with_verb("ECHO");
        request.set_body_with(b"abc", Integrity::Disabled).unwrap();

        let reply = connector.request(&request).unwrap();
        assert_eq!(reply.verb(), Some("ECHOED"));
        assert_eq!(reply.body(), Some(&b"abc"[..]));

        server.join().unwrap();
        assert!(matches!(connector.recv(), Err(ProtocolError::Closed)));
        connector.close();
    }

    #[test]
    fn test_connector_close_ends_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = Connector::connect("localhost", port).unwrap();
        assert_eq!(connector.status(), Status::Used);
        let (mut stream, _) = listener.accept().unwrap();
        connector.close();

        let mut buf = Vec::new();
        assert_eq!(stream.read_to_end(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(Connector::connect("127.0.0.1", port).is_err());
    }
}
