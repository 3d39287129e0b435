//! TLS record headers, record-boundary scanning, and completion heuristics.

use std::fmt;

use crate::RecordError;

/// Length of a TLS record header.
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest record body a peer may legally send (2^14 plaintext + 2048 expansion).
///
/// Anything declaring a longer body is not treated as TLS.
pub const MAX_RECORD_BODY_LEN: usize = (1 << 14) + 2048;

/// Record content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContentType {
    ChangeCipherSpec = 20,
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
    Heartbeat = 24,
}

impl ContentType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            20 => Some(Self::ChangeCipherSpec),
            21 => Some(Self::Alert),
            22 => Some(Self::Handshake),
            23 => Some(Self::ApplicationData),
            24 => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// Handshake message types the relay cares about.
pub struct HandshakeType;

impl HandshakeType {
    pub const CLIENT_HELLO: u8 = 1;
    pub const SERVER_HELLO: u8 = 2;
    pub const NEW_SESSION_TICKET: u8 = 4;
    pub const FINISHED: u8 = 20;
}

/// A parsed record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Raw content type byte (see [`ContentType`]).
    pub content_type: u8,
    /// Record-layer protocol version, e.g. `0x0303`.
    pub version: u16,
    /// Declared body length.
    pub length: u16,
}

impl RecordHeader {
    /// Known content type, if any.
    pub fn kind(&self) -> Option<ContentType> {
        ContentType::from_u8(self.content_type)
    }

    /// Total wire size of the record including its header.
    pub fn record_len(&self) -> usize {
        RECORD_HEADER_LEN + self.length as usize
    }

    /// True when the header is plausibly the start of a TLS record.
    pub fn looks_like_tls(&self) -> bool {
        self.kind().is_some()
            && (self.version >> 8) == 0x03
            && (self.version & 0xff) <= 0x04
            && (self.length as usize) <= MAX_RECORD_BODY_LEN
    }

    /// Re-encodes the header to its 5 wire bytes.
    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let v = self.version.to_be_bytes();
        let l = self.length.to_be_bytes();
        [self.content_type, v[0], v[1], l[0], l[1]]
    }
}

/// Parses the 5-byte record header at the start of `bytes`.
pub fn parse_record_header(bytes: &[u8]) -> Result<RecordHeader, RecordError> {
    if bytes.len() < RECORD_HEADER_LEN {
        return Err(RecordError::TooShort {
            needed: RECORD_HEADER_LEN,
            available: bytes.len(),
        });
    }

    Ok(RecordHeader {
        content_type: bytes[0],
        version: u16::from_be_bytes([bytes[1], bytes[2]]),
        length: u16::from_be_bytes([bytes[3], bytes[4]]),
    })
}

/// Inner handshake message type of a Handshake record, if present.
fn handshake_message_type(bytes: &[u8]) -> Option<u8> {
    let header = parse_record_header(bytes).ok()?;
    if header.kind() != Some(ContentType::Handshake) {
        return None;
    }
    bytes.get(RECORD_HEADER_LEN).copied()
}

/// Heuristic: does this record indicate the handshake has finished?
///
/// True for Application Data, or for a Handshake record whose first body
/// byte is Finished. Encrypted handshake records make the second test
/// unreliable; this is best effort, not proof.
pub fn is_handshake_complete(bytes: &[u8]) -> bool {
    let Ok(header) = parse_record_header(bytes) else {
        return false;
    };

    match header.kind() {
        Some(ContentType::ApplicationData) => true,
        Some(ContentType::Handshake) => {
            handshake_message_type(bytes) == Some(HandshakeType::FINISHED)
        }
        _ => false,
    }
}

/// True for a Handshake record carrying NewSessionTicket.
pub fn is_session_ticket_message(bytes: &[u8]) -> bool {
    handshake_message_type(bytes) == Some(HandshakeType::NEW_SESSION_TICKET)
}

/// Outcome of walking a buffer record by record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordScan {
    /// The buffer ends exactly on a record boundary.
    Complete { records: usize },
    /// The last record is cut short; `needed` more bytes finish it (or at
    /// least its header, when the header itself is cut).
    Partial { records: usize, needed: usize },
    /// The bytes do not look like a TLS record stream.
    NotTls,
}

impl RecordScan {
    pub fn is_partial(&self) -> bool {
        matches!(self, RecordScan::Partial { .. })
    }
}

fn partial_header_looks_like_tls(rest: &[u8]) -> bool {
    match rest {
        [] => true,
        [t] => ContentType::from_u8(*t).is_some(),
        [t, major, ..] => ContentType::from_u8(*t).is_some() && *major == 0x03,
    }
}

/// Walks consecutive records in `bytes` and reports where the buffer ends.
pub fn scan_records(bytes: &[u8]) -> RecordScan {
    let mut pos = 0;
    let mut records = 0;

    loop {
        let rest = &bytes[pos..];
        if rest.is_empty() {
            return RecordScan::Complete { records };
        }

        let header = match parse_record_header(rest) {
            Ok(header) => header,
            Err(_) => {
                if !partial_header_looks_like_tls(rest) {
                    return RecordScan::NotTls;
                }
                return RecordScan::Partial {
                    records,
                    needed: RECORD_HEADER_LEN - rest.len(),
                };
            }
        };

        if !header.looks_like_tls() {
            return RecordScan::NotTls;
        }

        let total = header.record_len();
        if rest.len() < total {
            return RecordScan::Partial {
                records,
                needed: total - rest.len(),
            };
        }

        pos += total;
        records += 1;
    }
}

/// Applies a single-record predicate to each record in `bytes`.
///
/// Peers often coalesce several records into one write (a TLS 1.3 server
/// flight, or a client's ChangeCipherSpec followed by Finished). Stops at the
/// first non-TLS header; a buffer that does not start with a record is passed
/// to the predicate whole.
pub fn any_record(bytes: &[u8], predicate: impl Fn(&[u8]) -> bool) -> bool {
    let mut pos = 0;

    while pos < bytes.len() {
        let rest = &bytes[pos..];
        let header = match parse_record_header(rest) {
            Ok(h) if h.looks_like_tls() => h,
            _ if pos == 0 => return predicate(bytes),
            _ => return false,
        };

        let end = header.record_len().min(rest.len());
        if predicate(&rest[..end]) {
            return true;
        }
        pos += end;
    }

    false
}

/// Coarse label for a chunk of relayed bytes, for logs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    ClientHello,
    ServerHello,
    SessionTicket,
    Handshake,
    ChangeCipherSpec,
    Alert,
    ApplicationData,
    Heartbeat,
    Opaque,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RecordKind::ClientHello => "client_hello",
            RecordKind::ServerHello => "server_hello",
            RecordKind::SessionTicket => "session_ticket",
            RecordKind::Handshake => "handshake",
            RecordKind::ChangeCipherSpec => "change_cipher_spec",
            RecordKind::Alert => "alert",
            RecordKind::ApplicationData => "application_data",
            RecordKind::Heartbeat => "heartbeat",
            RecordKind::Opaque => "opaque",
        };
        f.write_str(label)
    }
}

/// Labels the first record in `bytes`.
pub fn classify(bytes: &[u8]) -> RecordKind {
    let header = match parse_record_header(bytes) {
        Ok(h) if h.looks_like_tls() => h,
        _ => return RecordKind::Opaque,
    };

    match header.kind() {
        Some(ContentType::Handshake) => match handshake_message_type(bytes) {
            Some(HandshakeType::CLIENT_HELLO) => RecordKind::ClientHello,
            Some(HandshakeType::SERVER_HELLO) => RecordKind::ServerHello,
            Some(HandshakeType::NEW_SESSION_TICKET) => RecordKind::SessionTicket,
            _ => RecordKind::Handshake,
        },
        Some(ContentType::ChangeCipherSpec) => RecordKind::ChangeCipherSpec,
        Some(ContentType::Alert) => RecordKind::Alert,
        Some(ContentType::ApplicationData) => RecordKind::ApplicationData,
        Some(ContentType::Heartbeat) => RecordKind::Heartbeat,
        None => RecordKind::Opaque,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use veil_testing::tls;

    #[test]
    fn test_parse_header_fields() {
        let header = parse_record_header(&[0x16, 0x03, 0x01, 0x00, 0xc8]).unwrap();
        assert_eq!(header.kind(), Some(ContentType::Handshake));
        assert_eq!(header.version, 0x0301);
        assert_eq!(header.length, 200);
        assert_eq!(header.record_len(), 205);
    }

    #[rstest]
    #[case::application_data(tls::application_data(32), true)]
    #[case::one_byte_application_data(tls::application_data(1), true)]
    #[case::finished(tls::handshake_record(HandshakeType::FINISHED, &[0u8; 32]), true)]
    #[case::client_hello(tls::ClientHelloBuilder::new().sni("example.com").build(), false)]
    #[case::server_hello(tls::ServerHelloBuilder::tls13().build(), false)]
    #[case::change_cipher_spec(tls::change_cipher_spec(), false)]
    #[case::header_only(vec![0x17, 0x03, 0x03, 0x00, 0x10], true)]
    #[case::short(vec![0x17, 0x03], false)]
    fn test_handshake_complete_heuristic(#[case] bytes: Vec<u8>, #[case] expected: bool) {
        assert_eq!(is_handshake_complete(&bytes), expected);
    }

    #[test]
    fn test_session_ticket_detection() {
        assert!(is_session_ticket_message(&tls::new_session_ticket()));
        assert!(!is_session_ticket_message(&tls::application_data(16)));
        assert!(!is_session_ticket_message(&[0x16, 0x03, 0x03, 0x00, 0x00]));
    }

    #[test]
    fn test_scan_complete_flight() {
        let mut flight = tls::ServerHelloBuilder::tls13().build();
        flight.extend(tls::change_cipher_spec());
        flight.extend(tls::application_data(100));
        assert_eq!(scan_records(&flight), RecordScan::Complete { records: 3 });
    }

    #[test]
    fn test_scan_partial_body() {
        let record = tls::application_data(100);
        let cut = &record[..60];
        assert_eq!(
            scan_records(cut),
            RecordScan::Partial {
                records: 0,
                needed: record.len() - 60
            }
        );
    }

    #[test]
    fn test_scan_partial_header_after_whole_record() {
        let mut bytes = tls::application_data(10);
        bytes.extend_from_slice(&[0x17, 0x03]);
        assert_eq!(
            scan_records(&bytes),
            RecordScan::Partial {
                records: 1,
                needed: 3
            }
        );
    }

    #[test]
    fn test_scan_plain_http_is_not_tls() {
        assert_eq!(scan_records(b"GET / HTTP/1.1\r\n\r\n"), RecordScan::NotTls);
    }

    #[test]
    fn test_scan_rejects_oversized_record() {
        assert_eq!(scan_records(&[0x17, 0x03, 0x03, 0xff, 0xff]), RecordScan::NotTls);
    }

    #[test]
    fn test_any_record_finds_finished_behind_ccs() {
        let mut bytes = tls::change_cipher_spec();
        bytes.extend(tls::handshake_record(HandshakeType::FINISHED, &[0u8; 12]));
        assert!(!is_handshake_complete(&bytes));
        assert!(any_record(&bytes, is_handshake_complete));
    }

    #[test]
    fn test_classify_labels() {
        let hello = tls::ClientHelloBuilder::new().sni("a.test").build();
        assert_eq!(classify(&hello), RecordKind::ClientHello);
        assert_eq!(classify(&tls::new_session_ticket()), RecordKind::SessionTicket);
        assert_eq!(classify(b"hello"), RecordKind::Opaque);
        assert_eq!(RecordKind::ApplicationData.to_string(), "application_data");
    }

    proptest! {
        #[test]
        fn prop_short_input_fails(bytes in proptest::collection::vec(any::<u8>(), 0..5)) {
            let result = parse_record_header(&bytes);
            let is_too_short = matches!(result, Err(RecordError::TooShort { .. }));
            prop_assert!(is_too_short);
            let _ = is_handshake_complete(&bytes);
            let _ = is_session_ticket_message(&bytes);
            let _ = classify(&bytes);
        }

        #[test]
        fn prop_header_roundtrip(content_type in 20u8..=24, minor in 0u8..=4, length in 0u16..=16384) {
            let wire = [content_type, 0x03, minor, (length >> 8) as u8, length as u8];
            let header = parse_record_header(&wire).unwrap();
            prop_assert_eq!(header.encode(), wire);
        }

        #[test]
        fn prop_application_data_completes(len in 1usize..4096) {
            prop_assert!(is_handshake_complete(&tls::application_data(len)));
        }

        #[test]
        fn prop_scan_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = scan_records(&bytes);
            let _ = any_record(&bytes, is_handshake_complete);
        }
    }
}
