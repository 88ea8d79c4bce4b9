//! File copy service.
//!
//! ```text
//! COPY
//! Filename:<path relative to the service root>
//! Offset:<byte offset>
//! Content-Length:<n>
//! .
//! <n bytes>
//! ```
//!
//! The body is written at `Offset` of the file, which is created when
//! missing and never truncated. No reply is sent; a failed write closes the
//! connection.

use crate::protocol::{Integrity, Message, MessageError, ProtocolError};
use crate::runtime::{Connector, Endpoint, Flow, Handler, Invalid};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

pub const COPY_VERB: &str = "COPY";
pub const FILENAME: &str = "Filename";
pub const OFFSET: &str = "Offset";

/// Handler writing `COPY` bodies below a root directory.
#[derive(Debug, Clone)]
pub struct CopyService {
    root: PathBuf,
}

impl CopyService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a requested file name below the root. Absolute names and names
    /// climbing out of the root are refused.
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        let contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if name.is_empty() || !contained {
            return None;
        }
        Some(self.root.join(relative))
    }
}

impl Handler for CopyService {
    fn validate(&self, _endpoint: &Endpoint, msg: &Message) -> Result<(), Invalid> {
        if !msg.is_verb(COPY_VERB) {
            return Ok(());
        }
        if msg.named_header(FILENAME).is_none() {
            return Err(Invalid::new("COPY without Filename"));
        }
        if parse_offset(msg).is_none() {
            return Err(Invalid::new("COPY without a numeric Offset"));
        }
        if msg.body_size() == 0 {
            return Err(Invalid::new("COPY without a body"));
        }
        Ok(())
    }

    fn accepts(&self, _endpoint: &Endpoint, msg: &Message) -> bool {
        msg.is_verb(COPY_VERB)
    }

    fn handle(&self, endpoint: &mut Endpoint, msg: &Message) -> Flow {
        let (name, offset, body) = match (msg.named_header(FILENAME), parse_offset(msg), msg.body()) {
            (Some(name), Some(offset), Some(body)) => (name, offset, body),
            _ => return Flow::Close,
        };

        let path = match self.resolve(name) {
            Some(path) => path,
            None => {
                warn!(peer = ?endpoint.peer_addr(), filename = name, "Refusing path outside copy root");
                return Flow::Close;
            }
        };

        match write_at(&path, offset, body) {
            Ok(()) => {
                debug!(path = %path.display(), offset, len = body.len(), "Copied chunk");
                Flow::Continue
            }
            Err(e) => {
                warn!(path = %path.display(), offset, error = %e, "Copy write failed");
                Flow::Close
            }
        }
    }
}

fn parse_offset(msg: &Message) -> Option<u64> {
    msg.named_header(OFFSET)?.parse().ok()
}

fn write_at(path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}

/// Errors from the copy client.
#[derive(Debug)]
pub enum CopyError {
    /// Reading the source file failed.
    Source(PathBuf, io::Error),
    /// Building a chunk message failed.
    Message(MessageError),
    /// Sending a chunk failed.
    Send(ProtocolError),
    /// Chunk size of zero.
    ZeroChunk,
}

impl std::fmt::Display for CopyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyError::Source(path, e) => {
                write!(f, "Cannot read source file '{}': {}", path.display(), e)
            }
            CopyError::Message(e) => write!(f, "Build chunk failed: {}", e),
            CopyError::Send(e) => write!(f, "Send chunk failed: {}", e),
            CopyError::ZeroChunk => write!(f, "Chunk size must be positive"),
        }
    }
}

impl std::error::Error for CopyError {}

impl From<MessageError> for CopyError {
    fn from(e: MessageError) -> Self {
        CopyError::Message(e)
    }
}

/// One `COPY` message carrying `chunk` for offset `offset` of `dst`.
fn chunk_request(
    dst: &str,
    offset: u64,
    chunk: &[u8],
    integrity: Integrity,
) -> Result<Message, CopyError> {
    let mut request = Message::with_verb(COPY_VERB);
    request.add_named_header(FILENAME, dst);
    request.add_named_header(OFFSET, offset.to_string());
    request.set_body_with(chunk, integrity)?;
    Ok(request)
}

/// Send `src` to the server as `dst`, `chunk_size` bytes per `COPY`
/// message. Returns the number of bytes sent.
pub fn copy_file(
    connector: &mut Connector,
    src: &Path,
    dst: &str,
    chunk_size: usize,
) -> Result<u64, CopyError> {
    if chunk_size == 0 {
        return Err(CopyError::ZeroChunk);
    }

    let source_err = |e| CopyError::Source(src.to_path_buf(), e);
    let mut file = File::open(src).map_err(source_err)?;
    let integrity = connector.codec().integrity;
    let mut chunk = Vec::with_capacity(chunk_size);
    let mut offset = 0u64;

    loop {
        chunk.clear();
        (&mut file)
            .take(chunk_size as u64)
            .read_to_end(&mut chunk)
            .map_err(source_err)?;
        if chunk.is_empty() {
            break;
        }

        let request = chunk_request(dst, offset, &chunk, integrity)?;
        connector.send(&request).map_err(CopyError::Send)?;
        debug!(dst, offset, len = chunk.len(), "Sent chunk");
        offset += chunk.len() as u64;
    }

    Ok(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Codec;
    use crate::runtime::{Manager, Settings};
    use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn start(root: &Path, integrity: Integrity) -> (Manager, u16) {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let settings = Settings {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            threads: 2,
            codec: Codec::default().with_integrity(integrity),
            ..Settings::default()
        };
        let manager = Manager::start(settings, Arc::new(CopyService::new(root))).unwrap();
        let addr = manager.wait_listening(Duration::from_secs(5)).unwrap();
        (manager, addr.port())
    }

    fn connect(port: u16, integrity: Integrity) -> Connector {
        Connector::connect_with("127.0.0.1", port, Codec::default().with_integrity(integrity))
            .unwrap()
    }

    /// Round-trip a PING so every earlier message has been handled.
    fn sync(client: &mut Connector) {
        let pong = client.request(&Message::with_verb("PING")).unwrap();
        assert!(pong.is_verb("PONG"));
    }

    #[test]
    fn test_resolve_stays_in_root() {
        let service = CopyService::new("/srv/copy");
        assert_eq!(
            service.resolve("dir/out.bin"),
            Some(PathBuf::from("/srv/copy/dir/out.bin"))
        );
        assert_eq!(service.resolve("../etc/passwd"), None);
        assert_eq!(service.resolve("/etc/passwd"), None);
        assert_eq!(service.resolve(""), None);
    }

    #[test]
    fn test_copy_raw_wire_message() {
        let dir = TempDir::new().unwrap();
        let (manager, port) = start(dir.path(), Integrity::Disabled);

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .write_all(b"COPY\nFilename:out.bin\nOffset:0\nContent-Length:5\n.\nhello")
            .unwrap();
        stream.write_all(b"PING\n.\n").unwrap();

        let mut reply = [0u8; 7];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"PONG\n.\n");
        assert_eq!(std::fs::read(dir.path().join("out.bin")).unwrap(), b"hello");

        stream.write_all(b"BYE\n.\n").unwrap();
        drop(stream);
        manager.shutdown(true);
    }

    #[test]
    fn test_copy_file_in_chunks() {
        let dir = TempDir::new().unwrap();
        let (manager, port) = start(dir.path(), Integrity::Md5);

        let src = dir.path().join("source.dat");
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &data).unwrap();

        let mut client = connect(port, Integrity::Md5);
        let sent = copy_file(&mut client, &src, "copy.dat", 128).unwrap();
        assert_eq!(sent, 1000);
        sync(&mut client);

        assert_eq!(std::fs::read(dir.path().join("copy.dat")).unwrap(), data);
        client.close();
        manager.shutdown(true);
    }

    #[test]
    fn test_write_at_offset_keeps_existing_bytes() {
        let dir = TempDir::new().unwrap();
        let (manager, port) = start(dir.path(), Integrity::Disabled);
        std::fs::write(dir.path().join("patch.txt"), b"aaaaaaaa").unwrap();

        let mut client = connect(port, Integrity::Disabled);
        let mut request = Message::with_verb("copy");
        request.add_named_header(FILENAME, "patch.txt");
        request.add_named_header(OFFSET, "2");
        request.set_body_with(b"BB", Integrity::Disabled).unwrap();
        client.send(&request).unwrap();
        sync(&mut client);

        assert_eq!(std::fs::read(dir.path().join("patch.txt")).unwrap(), b"aaBBaaaa");
        client.close();
        manager.shutdown(true);
    }

    #[test]
    fn test_invalid_copy_closes_connection() {
        let dir = TempDir::new().unwrap();
        let (manager, port) = start(dir.path(), Integrity::Disabled);

        let mut client = connect(port, Integrity::Disabled);
        let mut request = Message::with_verb("COPY");
        request.add_named_header(OFFSET, "0");
        request.set_body_with(b"data", Integrity::Disabled).unwrap();
        client.send(&request).unwrap();

        assert!(client.recv().is_err());
        client.close();
        manager.shutdown(true);
    }

    #[test]
    fn test_escaping_path_closes_connection() {
        let dir = TempDir::new().unwrap();
        let (manager, port) = start(dir.path(), Integrity::Disabled);

        let mut client = connect(port, Integrity::Disabled);
        let mut request = Message::with_verb("COPY");
        request.add_named_header(FILENAME, "../escape.bin");
        request.add_named_header(OFFSET, "0");
        request.set_body_with(b"data", Integrity::Disabled).unwrap();
        client.send(&request).unwrap();

        assert!(client.recv().is_err());
        assert!(!dir.path().parent().unwrap().join("escape.bin").exists());
        client.close();
        manager.shutdown(true);
    }

    #[test]
    fn test_chunk_request_headers() {
        let request = chunk_request("out.bin", 256, b"data", Integrity::Disabled).unwrap();
        assert!(request.is_verb(COPY_VERB));
        assert_eq!(request.named_header(FILENAME), Some("out.bin"));
        assert_eq!(request.named_header(OFFSET), Some("256"));
        assert_eq!(request.body(), Some(&b"data"[..]));
    }

    #[test]
    fn test_empty_chunk_is_an_error() {
        let result = chunk_request("out.bin", 0, b"", Integrity::Disabled);
        assert!(matches!(
            result,
            Err(CopyError::Message(MessageError::EmptyBody))
        ));
    }

    #[test]
    fn test_zero_chunk_size() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut client = connect(port, Integrity::Disabled);

        let result = copy_file(&mut client, &dir.path().join("missing"), "x", 0);
        assert!(matches!(result, Err(CopyError::ZeroChunk)));
    }
}
