//! Body integrity digests.

use md5::{Digest, Md5};

/// Whether message bodies carry and verify a `Content-Checksum` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    /// No checksum is attached or checked.
    Disabled,
    /// Lowercase hex MD5 of the body.
    Md5,
}

impl Default for Integrity {
    fn default() -> Self {
        if cfg!(feature = "checksums") {
            Integrity::Md5
        } else {
            Integrity::Disabled
        }
    }
}

impl Integrity {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            Integrity::Md5
        } else {
            Integrity::Disabled
        }
    }

    pub fn is_enabled(self) -> bool {
        self != Integrity::Disabled
    }

    /// Digest of `data`, or `None` when integrity checking is off.
    pub fn digest(self, data: &[u8]) -> Option<String> {
        match self {
            Integrity::Disabled => None,
            Integrity::Md5 => Some(md5_hex(data)),
        }
    }
}

/// Hex-encoded MD5 digest (32 lowercase characters).
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}
