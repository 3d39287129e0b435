//! SNI (Server Name Indication) extraction from a TLS ClientHello.
//!
//! ClientHello body layout after the 4-byte handshake header:
//! - 2 bytes: client version
//! - 32 bytes: random
//! - u8-prefixed session id
//! - u16-prefixed cipher suites
//! - u8-prefixed compression methods
//! - u16-prefixed extensions
//!
//! The `server_name` extension (type 0) holds a u16-prefixed list of
//! `(u8 name_type, u16-prefixed name)` entries; `name_type` 0 is a host name.

use crate::cursor::Cursor;
use crate::record::{parse_record_header, ContentType, HandshakeType, RECORD_HEADER_LEN};
use crate::RecordError;

const EXT_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0;

/// Version (2) + random (32).
const FIXED_PREFIX_LEN: usize = 34;

/// Returns the body of the first handshake message of type `expected` in a
/// Handshake record, clipped to what is actually present.
pub(crate) fn handshake_body(record: &[u8], expected: u8) -> Result<&[u8], RecordError> {
    let header = parse_record_header(record)?;
    if header.kind() != Some(ContentType::Handshake) {
        return Err(RecordError::NotHandshake(header.content_type));
    }

    let end = header.record_len().min(record.len());
    let mut cursor = Cursor::new(&record[RECORD_HEADER_LEN..end]);

    let msg_type = cursor.u8().ok_or(RecordError::TruncatedHandshakeHeader)?;
    if msg_type != expected {
        return Err(RecordError::UnexpectedHandshakeType {
            expected,
            actual: msg_type,
        });
    }

    let declared = cursor.u24().ok_or(RecordError::TruncatedHandshakeHeader)?;
    // A hello may continue in a following record; parse what we have.
    let available = declared.min(cursor.remaining());
    cursor
        .take(available)
        .ok_or(RecordError::TruncatedHandshakeHeader)
}

/// Extracts the first `host_name` entry from a ClientHello record.
///
/// The name is lowercased and a trailing dot is trimmed.
pub fn extract_sni(client_hello: &[u8]) -> Result<String, RecordError> {
    let body = handshake_body(client_hello, HandshakeType::CLIENT_HELLO)?;
    let mut cursor = Cursor::new(body);

    cursor
        .skip(FIXED_PREFIX_LEN)
        .ok_or(RecordError::TruncatedRandom)?;
    cursor.vec_u8().ok_or(RecordError::TruncatedSessionId)?;
    cursor
        .vec_u16()
        .ok_or(RecordError::TruncatedCipherSuites)?;
    cursor
        .vec_u8()
        .ok_or(RecordError::TruncatedCompressionMethods)?;

    if cursor.remaining() == 0 {
        return Err(RecordError::NoExtensions);
    }
    let offset = cursor.position();
    let extensions = cursor
        .vec_u16()
        .ok_or(RecordError::TruncatedExtension { offset })?;

    let mut exts = Cursor::new(extensions);
    while exts.remaining() > 0 {
        let offset = exts.position();
        let truncated = RecordError::TruncatedExtension { offset };
        let ext_type = exts.u16().ok_or(truncated.clone())?;
        let data = exts.vec_u16().ok_or(truncated)?;

        if ext_type == EXT_SERVER_NAME {
            return parse_server_name(data);
        }
    }

    Err(RecordError::NoServerName)
}

fn parse_server_name(data: &[u8]) -> Result<String, RecordError> {
    let mut cursor = Cursor::new(data);
    let list = cursor.vec_u16().ok_or(RecordError::MalformedServerName)?;

    let mut entries = Cursor::new(list);
    while entries.remaining() > 0 {
        let name_type = entries.u8().ok_or(RecordError::MalformedServerName)?;
        let name = entries.vec_u16().ok_or(RecordError::MalformedServerName)?;

        if name_type == NAME_TYPE_HOST {
            let host = std::str::from_utf8(name).map_err(|_| RecordError::InvalidHostName)?;
            if host.is_empty() {
                return Err(RecordError::MalformedServerName);
            }
            return Ok(host.to_ascii_lowercase().trim_end_matches('.').to_string());
        }
    }

    Err(RecordError::NoServerName)
}
