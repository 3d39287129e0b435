//! Errors raised while inspecting TLS bytes.

use thiserror::Error;

/// Reasons a record or handshake message could not be inspected.
///
/// The ClientHello walk fails at the first length field that points past the
/// available bytes, and each checkpoint has its own variant so logs say where.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("need {needed} bytes, only {available} available")]
    TooShort { needed: usize, available: usize },

    #[error("record type {0} is not Handshake")]
    NotHandshake(u8),

    #[error("handshake message type {actual} is not {expected}")]
    UnexpectedHandshakeType { expected: u8, actual: u8 },

    #[error("truncated handshake message header")]
    TruncatedHandshakeHeader,

    #[error("truncated version/random block")]
    TruncatedRandom,

    #[error("truncated session id")]
    TruncatedSessionId,

    #[error("truncated cipher suite list")]
    TruncatedCipherSuites,

    #[error("truncated compression method list")]
    TruncatedCompressionMethods,

    #[error("hello carries no extensions")]
    NoExtensions,

    #[error("truncated extension at offset {offset}")]
    TruncatedExtension { offset: usize },

    #[error("no server_name extension")]
    NoServerName,

    #[error("malformed server_name extension")]
    MalformedServerName,

    #[error("host name is not valid UTF-8")]
    InvalidHostName,
}
