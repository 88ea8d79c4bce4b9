//! Hermes wire codec.
//!
//! Decoding reads exactly one message from a byte stream: the header block
//! up to its `.` terminator line, then exactly `Content-Length` body bytes.
//! Encoding produces the header block only; the connection layer writes the
//! body separately.

use crate::protocol::checksum::{md5_hex, Integrity};
use crate::protocol::message::{Message, CONTENT_CHECKSUM, CONTENT_LENGTH};
use crate::protocol::ProtocolError;
use bytes::{BufMut, BytesMut};
use std::io::{self, Read};
use tracing::{debug, trace, warn};

/// Default limit for a header block, terminator included.
pub const DEFAULT_MAX_HEADER_SIZE: usize = 1024;

/// Default limit for an announced body.
pub const DEFAULT_MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Stateless message codec with its limits and integrity mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    pub max_header_size: usize,
    pub max_body_size: usize,
    pub integrity: Integrity,
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            integrity: Integrity::default(),
        }
    }
}

impl Codec {
    pub fn with_integrity(mut self, integrity: Integrity) -> Self {
        self.integrity = integrity;
        self
    }

    pub fn with_max_header_size(mut self, max_header_size: usize) -> Self {
        self.max_header_size = max_header_size;
        self
    }

    /// Read exactly one message from `reader`.
    ///
    /// Any failure discards the partially built message.
    pub fn decode<R: Read>(&self, reader: &mut R) -> Result<Message, ProtocolError> {
        let block = read_header_block(reader, self.max_header_size)?;
        let (mut msg, body_len) = parse_header_block(&block)?;

        if body_len > 0 {
            if body_len > self.max_body_size {
                return Err(ProtocolError::BodyTooLarge {
                    length: body_len,
                    limit: self.max_body_size,
                });
            }

            let mut body = vec![0u8; body_len];
            reader.read_exact(&mut body)?;
            self.verify_checksum(&msg, &body)?;

            msg.set_body_with(&body, self.integrity)
                .map_err(|e| ProtocolError::malformed(e.to_string()))?;
        }

        trace!(verb = ?msg.verb(), body = body_len, "Decoded message");
        Ok(msg)
    }

    /// Serialize the header block of `msg` into `dst`.
    pub fn encode_header(&self, msg: &Message, dst: &mut BytesMut) -> Result<usize, ProtocolError> {
        encode_header(msg, dst)
    }

    fn verify_checksum(&self, msg: &Message, body: &[u8]) -> Result<(), ProtocolError> {
        if !self.integrity.is_enabled() {
            return Ok(());
        }

        match msg.named_header(CONTENT_CHECKSUM) {
            Some(given) => {
                let computed = md5_hex(body);
                if !given.eq_ignore_ascii_case(&computed) {
                    warn!(given, computed = %computed, "Checksums don't match");
                    return Err(ProtocolError::ChecksumMismatch {
                        expected: given.to_string(),
                        computed,
                    });
                }
                Ok(())
            }
            None => {
                debug!("No checksum provided");
                Ok(())
            }
        }
    }
}

/// Read bytes up to the terminator line, one at a time so nothing past the
/// header block is consumed. Returns the block without the terminator.
fn read_header_block<R: Read>(reader: &mut R, limit: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut block = Vec::with_capacity(limit.min(256));
    let mut line_start = 0;
    let mut consumed = 0;
    let mut byte = [0u8; 1];

    while consumed < limit {
        match reader.read(&mut byte) {
            Ok(0) if consumed == 0 => return Err(ProtocolError::Closed),
            Ok(0) => {
                return Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed inside header block",
                )))
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
        consumed += 1;

        let c = if byte[0] == b'\r' { b' ' } else { byte[0] };
        if c == b'\n' {
            if is_terminator(&block[line_start..]) {
                block.truncate(line_start);
                return Ok(block);
            }
            block.push(c);
            line_start = block.len();
        } else {
            block.push(c);
        }
    }

    Err(ProtocolError::HeaderTooLarge(limit))
}

/// A terminator line is a `.` at the start of a line, optionally followed
/// by spaces.
fn is_terminator(line: &[u8]) -> bool {
    matches!(line.split_first(), Some((b'.', rest)) if rest.iter().all(|&b| b == b' '))
}

/// Build a message from a header block. Returns the message and the
/// announced body length (0 when absent).
fn parse_header_block(block: &[u8]) -> Result<(Message, usize), ProtocolError> {
    let text = std::str::from_utf8(block)
        .map_err(|_| ProtocolError::malformed("header block is not valid UTF-8"))?;

    let mut lines = text.split('\n').filter(|line| !line.is_empty());
    let mut msg = Message::new();

    let verb_line = lines
        .next()
        .ok_or_else(|| ProtocolError::malformed("missing verb line"))?;
    parse_verb_line(&mut msg, verb_line)?;

    let mut body_len = 0;
    for line in lines {
        if let Some(len) = parse_named_header(&mut msg, line)? {
            body_len = len;
        }
    }

    Ok((msg, body_len))
}

fn parse_verb_line(msg: &mut Message, line: &str) -> Result<(), ProtocolError> {
    let mut words = line.split([' ', '\t']).filter(|word| !word.is_empty());

    let verb = words
        .next()
        .ok_or_else(|| ProtocolError::malformed("verb line has no verb"))?;
    msg.set_verb(verb);

    for word in words {
        msg.add_header(word);
    }
    Ok(())
}

/// Record one `key:value` line. Returns the body length when the line is
/// `Content-Length`.
fn parse_named_header(msg: &mut Message, line: &str) -> Result<Option<usize>, ProtocolError> {
    let (key, value) = line
        .split_once(':')
        .ok_or_else(|| ProtocolError::malformed(format!("header line without ':': {:?}", line)))?;
    let key = key.trim();
    let value = value.trim();

    let mut body_len = None;
    if key.eq_ignore_ascii_case(CONTENT_LENGTH) {
        match value.parse::<usize>() {
            Ok(0) | Err(_) => {
                return Err(ProtocolError::malformed(format!(
                    "invalid Content-Length: {:?}",
                    value
                )))
            }
            Ok(len) => body_len = Some(len),
        }
    }

    msg.add_named_header(key, value);
    Ok(body_len)
}

/// Exact size of the encoded header block, or `None` without a verb.
pub fn encoded_len(msg: &Message) -> Option<usize> {
    let verb = msg.verb()?;

    let mut size = verb.len();
    size += msg.headers().map(|h| 1 + h.len()).sum::<usize>();
    size += 1;
    size += msg
        .named_headers()
        .map(|(k, v)| k.len() + 1 + v.len() + 1)
        .sum::<usize>();
    size += 2;
    Some(size)
}

/// Serialize the header block of `msg` into `dst`, returning its length.
pub fn encode_header(msg: &Message, dst: &mut BytesMut) -> Result<usize, ProtocolError> {
    let (verb, expected) = match (msg.verb(), encoded_len(msg)) {
        (Some(verb), Some(len)) => (verb, len),
        _ => return Err(ProtocolError::MissingVerb),
    };

    let start = dst.len();
    dst.reserve(expected);

    dst.put_slice(verb.as_bytes());
    for header in msg.headers() {
        dst.put_u8(b' ');
        dst.put_slice(header.as_bytes());
    }
    dst.put_u8(b'\n');

    for (key, value) in msg.named_headers() {
        dst.put_slice(key.as_bytes());
        dst.put_u8(b':');
        dst.put_slice(value.as_bytes());
        dst.put_u8(b'\n');
    }
    dst.put_slice(b".\n");

    let written = dst.len() - start;
    assert_eq!(written, expected, "encoded header size mismatch");
    Ok(written)
}
