//! Negotiated protocol version, read from the plaintext ServerHello.

use std::fmt;
use std::str::FromStr;

use crate::cursor::Cursor;
use crate::record::HandshakeType;
use crate::sni::handshake_body;
use crate::RecordError;

const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;

/// A TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
    Unknown(u16),
}

impl TlsVersion {
    pub fn from_wire(value: u16) -> Self {
        match value {
            0x0301 => Self::Tls10,
            0x0302 => Self::Tls11,
            0x0303 => Self::Tls12,
            0x0304 => Self::Tls13,
            other => Self::Unknown(other),
        }
    }

    pub fn wire(&self) -> u16 {
        match self {
            Self::Tls10 => 0x0301,
            Self::Tls11 => 0x0302,
            Self::Tls12 => 0x0303,
            Self::Tls13 => 0x0304,
            Self::Unknown(v) => *v,
        }
    }

    pub fn is_tls13(&self) -> bool {
        matches!(self, Self::Tls13)
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls10 => f.write_str("1.0"),
            Self::Tls11 => f.write_str("1.1"),
            Self::Tls12 => f.write_str("1.2"),
            Self::Tls13 => f.write_str("1.3"),
            Self::Unknown(v) => write!(f, "0x{v:04x}"),
        }
    }
}

impl FromStr for TlsVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.0" => Ok(Self::Tls10),
            "1.1" => Ok(Self::Tls11),
            "1.2" => Ok(Self::Tls12),
            "1.3" => Ok(Self::Tls13),
            other => other
                .strip_prefix("0x")
                .and_then(|hex| u16::from_str_radix(hex, 16).ok())
                .map(Self::from_wire)
                .ok_or_else(|| format!("unrecognised TLS version '{other}'")),
        }
    }
}

/// Reads the negotiated version from a ServerHello record.
///
/// TLS 1.3 servers keep `0x0303` in the legacy field and announce the real
/// version in `supported_versions`, which wins when present.
pub fn detect_tls_version(server_hello: &[u8]) -> Result<TlsVersion, RecordError> {
    let body = handshake_body(server_hello, HandshakeType::SERVER_HELLO)?;
    let mut cursor = Cursor::new(body);

    let legacy = cursor.u16().ok_or(RecordError::TruncatedRandom)?;
    cursor.skip(32).ok_or(RecordError::TruncatedRandom)?;
    cursor.vec_u8().ok_or(RecordError::TruncatedSessionId)?;
    cursor.skip(2).ok_or(RecordError::TruncatedCipherSuites)?;
    cursor
        .skip(1)
        .ok_or(RecordError::TruncatedCompressionMethods)?;

    if cursor.remaining() == 0 {
        return Ok(TlsVersion::from_wire(legacy));
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

        if ext_type == EXT_SUPPORTED_VERSIONS && data.len() == 2 {
            return Ok(TlsVersion::from_wire(u16::from_be_bytes([data[0], data[1]])));
        }
    }

    Ok(TlsVersion::from_wire(legacy))
}
