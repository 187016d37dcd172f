//! Binary wire protocol spoken between cache peers.
//!
//! A message is a 4-byte magic (`"shc"` plus a version byte), an optional
//! signature header, a command header and a list of records. Each record is a
//! sequence of length-prefixed chunks closed by a zero-length chunk; records
//! are separated by [`RECORD_SEPARATOR`] and the message ends with
//! [`MESSAGE_TERMINATOR`].
//!
//! ```text
//!   "shc" ver | [sig] | hdr [d] | len data [d] .. 0000 | 80 [d] | .. | 0000 00 [d]
//!                                                    (d = 8-byte digest)
//! ```
//!
//! Unsigned messages carry no digests. Per-message signing appends a single
//! digest after the terminator. Per-chunk signing keeps one running keyed hash
//! across the frame and appends its current digest after the header, after
//! every chunk, and after every separator or terminator.

pub mod auth;
pub mod builder;
pub mod decoder;
pub mod index;
pub mod reader;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use auth::{MessageDigest, SigningKey, DIGEST_LEN};
pub use builder::{build_message, write_message, FrameBuilder};
pub use decoder::{read_message_streaming, AsyncReadContext, ReadEvent, ReadState};
pub use index::{decode_index, encode_index, IndexItem};
pub use reader::{read_message, read_socket_message};

use crate::config::ProtocolConfig;

/// First three bytes of every message.
pub const MAGIC: [u8; 3] = *b"shc";

/// Highest protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Byte between two records.
pub const RECORD_SEPARATOR: u8 = 0x80;

/// Byte closing the last record.
pub const MESSAGE_TERMINATOR: u8 = 0x00;

/// Largest chunk a single length prefix can describe.
pub const MAX_CHUNK_LEN: usize = u16::MAX as usize;

/// Default limit for a reassembled record (256 MiB).
pub const DEFAULT_MAX_RECORD_LEN: usize = 1 << 28;

/// Signature header announcing a single trailing digest.
pub const SIG_HDR_MESSAGE: u8 = 0xF0;

/// Signature header announcing a digest after every chunk.
pub const SIG_HDR_CHUNK: u8 = 0xF1;

/// Keep-alive filler accepted in front of a message.
pub const NOOP: u8 = 0x90;

/// Single-byte response statuses.
pub mod status {
    pub const OK: u8 = 0x00;
    pub const YES: u8 = 0x01;
    pub const EXISTS: u8 = 0x02;
    pub const NO: u8 = 0xFE;
    pub const ERR: u8 = 0xFF;
}

pub(crate) fn is_signature_header(byte: u8) -> bool {
    byte & 0xFE == SIG_HDR_MESSAGE
}

/// Command header of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Header {
    Get = 0x01,
    Set = 0x02,
    Delete = 0x03,
    Evict = 0x04,
    GetAsync = 0x05,
    GetOffset = 0x06,
    Add = 0x07,
    Exists = 0x08,
    Touch = 0x09,
    MigrationAbort = 0x21,
    MigrationBegin = 0x22,
    MigrationEnd = 0x23,
    Check = 0x31,
    Stats = 0x32,
    GetIndex = 0x41,
    IndexResponse = 0x42,
    ReplicaCommand = 0x51,
    ReplicaResponse = 0x52,
    ReplicaPing = 0x53,
    ReplicaAck = 0x54,
    Response = 0x99,
}

impl Header {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Header {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0x01 => Header::Get,
            0x02 => Header::Set,
            0x03 => Header::Delete,
            0x04 => Header::Evict,
            0x05 => Header::GetAsync,
            0x06 => Header::GetOffset,
            0x07 => Header::Add,
            0x08 => Header::Exists,
            0x09 => Header::Touch,
            0x21 => Header::MigrationAbort,
            0x22 => Header::MigrationBegin,
            0x23 => Header::MigrationEnd,
            0x31 => Header::Check,
            0x32 => Header::Stats,
            0x41 => Header::GetIndex,
            0x42 => Header::IndexResponse,
            0x51 => Header::ReplicaCommand,
            0x52 => Header::ReplicaResponse,
            0x53 => Header::ReplicaPing,
            0x54 => Header::ReplicaAck,
            0x99 => Header::Response,
            other => return Err(ProtocolError::UnknownHeader(other)),
        })
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02x})", self, self.as_byte())
    }
}

/// Where digests are placed in signed messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningMode {
    /// One digest over the whole frame.
    #[default]
    PerMessage,
    /// A digest after every chunk, separator and terminator.
    PerChunk,
}

impl SigningMode {
    fn header_byte(self) -> u8 {
        match self {
            SigningMode::PerMessage => SIG_HDR_MESSAGE,
            SigningMode::PerChunk => SIG_HDR_CHUNK,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("bad magic")]
    BadMagic,

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message header 0x{0:02x}")]
    UnknownHeader(u8),

    #[error("truncated message")]
    Truncated,

    #[error("bad record separator 0x{0:02x}")]
    BadSeparator(u8),

    #[error("expected {expected} message, got {got}")]
    UnexpectedHeader { expected: Header, got: Header },

    #[error("index entry with an empty key")]
    EmptyIndexKey,

    #[error("record of {len} bytes exceeds limit of {max}")]
    RecordTooLarge { len: usize, max: usize },

    #[error("unexpected signature header")]
    UnexpectedSignature,

    #[error("missing signature header")]
    MissingSignature,

    #[error("digest mismatch")]
    DigestMismatch,

    #[error("message consumer aborted")]
    CallbackAborted,

    #[error("decoder already failed")]
    Terminated,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Authentication failures are security events, not framing bugs.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnexpectedSignature
                | ProtocolError::MissingSignature
                | ProtocolError::DigestMismatch
        )
    }
}

/// Signing and size settings shared by the builder and both readers.
#[derive(Debug, Clone)]
pub struct Codec {
    key: Option<SigningKey>,
    signing: SigningMode,
    max_record_len: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            key: None,
            signing: SigningMode::PerMessage,
            max_record_len: DEFAULT_MAX_RECORD_LEN,
        }
    }
}

impl Codec {
    /// Codec for `secret`; `None` speaks unsigned messages.
    pub fn new(secret: Option<&[u8]>) -> Self {
        Self {
            key: secret.map(SigningKey::derive),
            ..Self::default()
        }
    }

    pub fn from_config(config: &ProtocolConfig) -> Self {
        Self::new(config.secret.as_deref().map(str::as_bytes))
            .with_signing(config.signing)
            .with_max_record_len(config.max_record_len)
    }

    pub fn with_signing(mut self, signing: SigningMode) -> Self {
        self.signing = signing;
        self
    }

    pub fn with_max_record_len(mut self, max_record_len: usize) -> Self {
        self.max_record_len = max_record_len;
        self
    }

    pub fn key(&self) -> Option<&SigningKey> {
        self.key.as_ref()
    }

    pub fn signing(&self) -> SigningMode {
        self.signing
    }

    pub fn max_record_len(&self) -> usize {
        self.max_record_len
    }
}

/// Hex rendering of a byte slice for trace logs, capped at 128 bytes.
pub struct HexDump<'a>(pub &'a [u8]);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const LIMIT: usize = 128;
        for byte in self.0.iter().take(LIMIT) {
            write!(f, "{:02x}", byte)?;
        }
        if self.0.len() > LIMIT {
            write!(f, "...(+{} bytes)", self.0.len() - LIMIT)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip_and_unknown() {
        for byte in [0x01u8, 0x09, 0x23, 0x42, 0x54, 0x99] {
            assert_eq!(Header::try_from(byte).unwrap().as_byte(), byte);
        }
        assert!(matches!(
            Header::try_from(0x77),
            Err(ProtocolError::UnknownHeader(0x77))
        ));
        assert!(Header::try_from(NOOP).is_err());
    }

    #[test]
    fn test_signature_header_detection() {
        assert!(is_signature_header(SIG_HDR_MESSAGE));
        assert!(is_signature_header(SIG_HDR_CHUNK));
        assert!(!is_signature_header(0xF2));
        assert!(!is_signature_header(Header::Get.as_byte()));
    }

    #[test]
    fn test_auth_failure_class() {
        assert!(ProtocolError::DigestMismatch.is_auth_failure());
        assert!(ProtocolError::MissingSignature.is_auth_failure());
        assert!(!ProtocolError::Truncated.is_auth_failure());
    }

    #[test]
    fn test_hex_dump_truncates() {
        assert_eq!(HexDump(&[0xde, 0xad]).to_string(), "dead");
        let long = vec![0u8; 130];
        assert!(HexDump(&long).to_string().ends_with("...(+2 bytes)"));
    }
}
