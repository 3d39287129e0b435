//! # veil-tls
//!
//! Stateless inspection of the plaintext parts of a TLS byte stream.
//!
//! Nothing here decrypts or validates TLS. The relay only ever looks at:
//! - the 5-byte record header (content type, version, length)
//! - the unencrypted ClientHello, for the `server_name` extension
//! - the unencrypted ServerHello, for the negotiated version
//! - the first byte of a Handshake record body, for the message type
//!
//! Every parser returns a [`RecordError`] instead of panicking on short or
//! malformed input. Callers treat any error as "not available" and carry on.
//!
//! ## Record layout
//!
//! ```text
//! +------+---------+--------+------------------+
//! | type | version | length | fragment ...     |
//! |  u8  |   u16   |  u16   | `length` bytes   |
//! +------+---------+--------+------------------+
//! ```

mod cursor;
mod error;
mod record;
mod sni;
mod version;

pub use error::RecordError;
pub use record::{
    any_record, classify, is_handshake_complete, is_session_ticket_message, parse_record_header,
    scan_records, ContentType, HandshakeType, RecordHeader, RecordKind, RecordScan,
    MAX_RECORD_BODY_LEN, RECORD_HEADER_LEN,
};
pub use sni::extract_sni;
pub use version::{detect_tls_version, TlsVersion};
