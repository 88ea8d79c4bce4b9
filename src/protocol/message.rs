//! Hermes message model.
//!
//! A message holds a verb, ordered unnamed headers, case-insensitive named
//! headers and an optional body. The body is always mirrored by a
//! `Content-Length` named header (and a `Content-Checksum` header when
//! integrity checking is enabled).

use crate::protocol::checksum::Integrity;
use bytes::Bytes;

/// Named header announcing the body length in bytes.
pub const CONTENT_LENGTH: &str = "Content-Length";

/// Named header carrying the body digest.
pub const CONTENT_CHECKSUM: &str = "Content-Checksum";

/// Errors from message accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Bodies must be at least one byte long.
    EmptyBody,
    /// Unnamed header index outside `[0, len)`.
    IndexOutOfRange { index: usize, len: usize },
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageError::EmptyBody => write!(f, "Body must not be empty"),
            MessageError::IndexOutOfRange { index, len } => {
                write!(f, "Header index {} out of range (count {})", index, len)
            }
        }
    }
}

impl std::error::Error for MessageError {}

/// A single protocol message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    id: Option<String>,
    verb: Option<String>,
    headers: Vec<String>,
    named_headers: Vec<(String, String)>,
    body: Option<Bytes>,
}

impl Message {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a message with the given verb and nothing else.
    pub fn with_verb(verb: impl Into<String>) -> Self {
        let mut msg = Self::new();
        msg.set_verb(verb);
        msg
    }

    /// Optional request id. Not carried on the wire.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    // Verb

    pub fn verb(&self) -> Option<&str> {
        self.verb.as_deref()
    }

    /// Replace the verb.
    pub fn set_verb(&mut self, verb: impl Into<String>) {
        self.verb = Some(verb.into());
    }

    /// Case-insensitive verb comparison.
    pub fn is_verb(&self, verb: &str) -> bool {
        self.verb
            .as_deref()
            .is_some_and(|v| v.eq_ignore_ascii_case(verb))
    }

    // Unnamed headers

    /// Append an unnamed header.
    pub fn add_header(&mut self, value: impl Into<String>) {
        self.headers.push(value.into());
    }

    /// Unnamed header at `index`, if in range.
    pub fn header(&self, index: usize) -> Option<&str> {
        self.headers.get(index).map(String::as_str)
    }

    /// Remove the unnamed header at `index`, shifting later headers down.
    pub fn del_header(&mut self, index: usize) -> Result<String, MessageError> {
        if index >= self.headers.len() {
            return Err(MessageError::IndexOutOfRange {
                index,
                len: self.headers.len(),
            });
        }
        Ok(self.headers.remove(index))
    }

    pub fn num_headers(&self) -> usize {
        self.headers.len()
    }

    pub fn headers(&self) -> impl Iterator<Item = &str> {
        self.headers.iter().map(String::as_str)
    }

    // Named headers

    /// Insert a named header. An existing key (compared case-insensitively)
    /// keeps its position and takes the new key spelling and value.
    pub fn add_named_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.position(&key) {
            Some(pos) => self.named_headers[pos] = (key, value),
            None => self.named_headers.push((key, value)),
        }
    }

    /// Case-insensitive lookup of a named header.
    pub fn named_header(&self, key: &str) -> Option<&str> {
        self.position(key).map(|pos| self.named_headers[pos].1.as_str())
    }

    /// Remove a named header. Removing an absent key is a no-op.
    pub fn del_named_header(&mut self, key: &str) -> Option<String> {
        self.position(key)
            .map(|pos| self.named_headers.remove(pos).1)
    }

    pub fn num_named_headers(&self) -> usize {
        self.named_headers.len()
    }

    /// Named headers in insertion order.
    pub fn named_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.named_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.named_headers
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    // Body

    /// Body length in bytes, 0 when there is no body.
    ///
    /// # Panics
    /// Panics if the `Content-Length` header disagrees with the stored body.
    pub fn body_size(&self) -> usize {
        self.checked_body_len()
    }

    /// Borrow the body, if any.
    ///
    /// # Panics
    /// Panics if the `Content-Length` header disagrees with the stored body.
    pub fn body(&self) -> Option<&[u8]> {
        self.checked_body_len();
        self.body.as_deref()
    }

    /// Shared handle to the body bytes.
    pub fn body_bytes(&self) -> Option<Bytes> {
        self.checked_body_len();
        self.body.clone()
    }

    /// Replace the body, using the default integrity mode.
    pub fn set_body(&mut self, data: &[u8]) -> Result<(), MessageError> {
        self.set_body_with(data, Integrity::default())
    }

    /// Replace the body and refresh `Content-Length` (and `Content-Checksum`
    /// when `integrity` is enabled).
    pub fn set_body_with(&mut self, data: &[u8], integrity: Integrity) -> Result<(), MessageError> {
        if data.is_empty() {
            return Err(MessageError::EmptyBody);
        }
        self.del_body();

        self.body = Some(Bytes::copy_from_slice(data));
        self.add_named_header(CONTENT_LENGTH, data.len().to_string());
        if let Some(digest) = integrity.digest(data) {
            self.add_named_header(CONTENT_CHECKSUM, digest);
        }
        Ok(())
    }

    /// Drop the body along with its `Content-Length` and `Content-Checksum`
    /// headers. No-op without a body.
    pub fn del_body(&mut self) {
        if self.body.is_none() {
            return;
        }
        self.checked_body_len();
        self.body = None;
        self.del_named_header(CONTENT_LENGTH);
        self.del_named_header(CONTENT_CHECKSUM);
    }

    fn checked_body_len(&self) -> usize {
        let announced = self.named_header(CONTENT_LENGTH);
        match (&self.body, announced) {
            (None, None) => 0,
            (Some(body), Some(value)) => {
                let announced: usize = value.parse().unwrap_or_else(|_| {
                    panic!("Content-Length header {:?} is not a length", value)
                });
                assert_eq!(
                    body.len(),
                    announced,
                    "body length disagrees with Content-Length header"
                );
                announced
            }
            (Some(body), None) => panic!("body of {} bytes without Content-Length", body.len()),
            (None, Some(value)) => panic!("Content-Length {:?} set without a body", value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_is_empty() {
        let msg = Message::new();
        assert_eq!(msg.verb(), None);
        assert_eq!(msg.id(), None);
        assert_eq!(msg.num_headers(), 0);
        assert_eq!(msg.num_named_headers(), 0);
        assert_eq!(msg.body_size(), 0);
        assert!(msg.body().is_none());
    }

    #[test]
    fn test_verb_replace_and_compare() {
        let mut msg = Message::with_verb("ping");
        assert!(msg.is_verb("PING"));
        msg.set_verb("INFO");
        assert_eq!(msg.verb(), Some("INFO"));
        assert!(!msg.is_verb("ping"));
    }

    #[test]
    fn test_unnamed_headers_shift_on_delete() {
        let mut msg = Message::with_verb("GET");
        msg.add_header("a");
        msg.add_header("b");
        msg.add_header("c");
        msg.add_header("b");

        assert_eq!(msg.del_header(1), Ok("b".to_string()));
        assert_eq!(msg.num_headers(), 3);
        assert_eq!(msg.header(0), Some("a"));
        assert_eq!(msg.header(1), Some("c"));
        assert_eq!(msg.header(2), Some("b"));
    }

    #[test]
    fn test_unnamed_header_out_of_range() {
        let mut msg = Message::with_verb("GET");
        msg.add_header("only");

        assert_eq!(msg.header(1), None);
        assert_eq!(
            msg.del_header(1),
            Err(MessageError::IndexOutOfRange { index: 1, len: 1 })
        );
        assert_eq!(msg.num_headers(), 1);
        assert_eq!(msg.header(0), Some("only"));
    }

    #[test]
    fn test_named_header_replaced_in_place() {
        let mut msg = Message::new();
        msg.add_named_header("First", "1");
        msg.add_named_header("Key", "v1");
        msg.add_named_header("Last", "3");
        msg.add_named_header("key", "v2");

        assert_eq!(msg.num_named_headers(), 3);
        assert_eq!(msg.named_header("KEY"), Some("v2"));
        let order: Vec<_> = msg.named_headers().map(|(_, v)| v).collect();
        assert_eq!(order, vec!["1", "v2", "3"]);
    }

    #[test]
    fn test_del_named_header_is_idempotent() {
        let mut msg = Message::new();
        msg.add_named_header("Filename", "out.bin");

        assert_eq!(msg.del_named_header("FILENAME"), Some("out.bin".to_string()));
        assert_eq!(msg.del_named_header("Filename"), None);
        assert_eq!(msg.named_header("Filename"), None);
    }

    #[test]
    fn test_set_body_mirrors_content_length() {
        let mut msg = Message::with_verb("COPY");
        msg.set_body_with(b"hello", Integrity::Disabled).unwrap();

        assert_eq!(msg.body_size(), 5);
        assert_eq!(msg.body(), Some(&b"hello"[..]));
        assert_eq!(msg.named_header(CONTENT_LENGTH), Some("5"));
        assert_eq!(msg.named_header(CONTENT_CHECKSUM), None);

        msg.set_body_with(b"hello world", Integrity::Disabled).unwrap();
        assert_eq!(msg.body_size(), 11);
        assert_eq!(msg.named_header(CONTENT_LENGTH), Some("11"));
        assert_eq!(msg.num_named_headers(), 1);
    }

    #[test]
    fn test_set_body_rejects_empty() {
        let mut msg = Message::with_verb("COPY");
        assert_eq!(msg.set_body(b""), Err(MessageError::EmptyBody));
        assert_eq!(msg.body_size(), 0);
    }

    #[test]
    fn test_set_body_with_checksum() {
        let mut msg = Message::with_verb("COPY");
        msg.set_body_with(b"hello", Integrity::Md5).unwrap();
        assert_eq!(
            msg.named_header(CONTENT_CHECKSUM),
            Some("5d41402abc4b2a76b9719d911017c592")
        );

        msg.del_body();
        assert_eq!(msg.body_size(), 0);
        assert_eq!(msg.named_header(CONTENT_LENGTH), None);
        assert_eq!(msg.named_header(CONTENT_CHECKSUM), None);
    }

    #[test]
    #[should_panic(expected = "Content-Length")]
    fn test_tampered_content_length_is_fatal() {
        let mut msg = Message::with_verb("COPY");
        msg.set_body_with(b"hello", Integrity::Disabled).unwrap();
        msg.add_named_header(CONTENT_LENGTH, "7");
        msg.body_size();
    }
}
