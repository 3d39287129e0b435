//! Builders for TLS records as they appear on the wire.
//!
//! Contents are structurally valid but cryptographically meaningless.

const RECORD_CHANGE_CIPHER_SPEC: u8 = 20;
const RECORD_ALERT: u8 = 21;
const RECORD_HANDSHAKE: u8 = 22;
const RECORD_APPLICATION_DATA: u8 = 23;

const HS_CLIENT_HELLO: u8 = 1;
const HS_SERVER_HELLO: u8 = 2;
const HS_NEW_SESSION_TICKET: u8 = 4;
const HS_FINISHED: u8 = 20;

fn push_u16(out: &mut Vec<u8>, v: usize) {
    out.extend_from_slice(&(v as u16).to_be_bytes());
}

fn push_u24(out: &mut Vec<u8>, v: usize) {
    out.extend_from_slice(&[(v >> 16) as u8, (v >> 8) as u8, v as u8]);
}

/// Wraps `payload` in a record header of the given content type.
pub fn record(content_type: u8, payload: &[u8]) -> Vec<u8> {
    record_with_version(content_type, 0x0303, payload)
}

pub fn record_with_version(content_type: u8, version: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(content_type);
    out.extend_from_slice(&version.to_be_bytes());
    push_u16(&mut out, payload.len());
    out.extend_from_slice(payload);
    out
}

/// A Handshake record carrying one message.
pub fn handshake_record(msg_type: u8, body: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(4 + body.len());
    msg.push(msg_type);
    push_u24(&mut msg, body.len());
    msg.extend_from_slice(body);
    record(RECORD_HANDSHAKE, &msg)
}

pub fn change_cipher_spec() -> Vec<u8> {
    record(RECORD_CHANGE_CIPHER_SPEC, &[0x01])
}

/// Application Data record with a `len`-byte body. Bytes count up from 0 so
/// reordering or truncation is visible in assertions.
pub fn application_data(len: usize) -> Vec<u8> {
    let body: Vec<u8> = (0..len).map(|i| i as u8).collect();
    record(RECORD_APPLICATION_DATA, &body)
}

pub fn finished() -> Vec<u8> {
    handshake_record(HS_FINISHED, &[0x5a; 32])
}

pub fn new_session_ticket() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&7200u32.to_be_bytes());
    body.extend_from_slice(&[0x01, 0x02, 0x03, 0x04]);
    body.push(0);
    push_u16(&mut body, 16);
    body.extend_from_slice(&[0x77; 16]);
    push_u16(&mut body, 0);
    handshake_record(HS_NEW_SESSION_TICKET, &body)
}

pub fn close_notify() -> Vec<u8> {
    record(RECORD_ALERT, &[0x01, 0x00])
}

/// Builds a ClientHello record.
#[derive(Debug, Clone)]
pub struct ClientHelloBuilder {
    extensions: Vec<(u16, Vec<u8>)>,
    with_extensions: bool,
    total_len: Option<usize>,
}

impl Default for ClientHelloBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientHelloBuilder {
    pub fn new() -> Self {
        Self {
            extensions: Vec::new(),
            with_extensions: true,
            total_len: None,
        }
    }

    /// Adds a `server_name` extension with one `host_name` entry.
    pub fn sni(mut self, host: &str) -> Self {
        let name = host.as_bytes();
        let mut list = Vec::new();
        list.push(0);
        push_u16(&mut list, name.len());
        list.extend_from_slice(name);

        let mut data = Vec::new();
        push_u16(&mut data, list.len());
        data.extend_from_slice(&list);
        self.extensions.push((0x0000, data));
        self
    }

    pub fn extension(mut self, ext_type: u16, data: Vec<u8>) -> Self {
        self.extensions.push((ext_type, data));
        self
    }

    /// Adds a `padding` extension with `len` zero bytes.
    pub fn padding(self, len: usize) -> Self {
        self.extension(0x0015, vec![0; len])
    }

    /// Omits the extensions block entirely (pre-TLS 1.0 style hello).
    pub fn without_extensions(mut self) -> Self {
        self.with_extensions = false;
        self
    }

    /// Pads with a trailing `padding` extension so the whole record is
    /// exactly `len` bytes. Ignored when the hello is already longer.
    pub fn total_len(mut self, len: usize) -> Self {
        self.total_len = Some(len);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let base = self.encode(&self.extensions);
        match self.total_len {
            Some(target) if self.with_extensions && target >= base.len() + 4 => {
                let mut extensions = self.extensions.clone();
                extensions.push((0x0015, vec![0; target - base.len() - 4]));
                self.encode(&extensions)
            }
            _ => base,
        }
    }

    fn encode(&self, extensions: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0x42; 32]);
        body.push(32);
        body.extend_from_slice(&[0x11; 32]);
        let suites: [u16; 3] = [0x1301, 0x1302, 0xc02f];
        push_u16(&mut body, suites.len() * 2);
        for suite in suites {
            body.extend_from_slice(&suite.to_be_bytes());
        }
        body.extend_from_slice(&[0x01, 0x00]);

        if self.with_extensions {
            let mut exts = Vec::new();
            for (ext_type, data) in extensions {
                exts.extend_from_slice(&ext_type.to_be_bytes());
                push_u16(&mut exts, data.len());
                exts.extend_from_slice(data);
            }
            push_u16(&mut body, exts.len());
            body.extend_from_slice(&exts);
        }

        let mut msg = Vec::new();
        msg.push(HS_CLIENT_HELLO);
        push_u24(&mut msg, body.len());
        msg.extend_from_slice(&body);
        record_with_version(RECORD_HANDSHAKE, 0x0301, &msg)
    }
}

/// Builds a ServerHello record.
#[derive(Debug, Clone)]
pub struct ServerHelloBuilder {
    selected_version: Option<u16>,
}

impl ServerHelloBuilder {
    /// Legacy version 1.2 with `supported_versions` selecting 1.3.
    pub fn tls13() -> Self {
        Self {
            selected_version: Some(0x0304),
        }
    }

    /// Plain TLS 1.2 hello with no `supported_versions`.
    pub fn tls12() -> Self {
        Self {
            selected_version: None,
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0x24; 32]);
        body.push(32);
        body.extend_from_slice(&[0x11; 32]);
        body.extend_from_slice(&0x1301u16.to_be_bytes());
        body.push(0);

        let mut exts = Vec::new();
        // renegotiation_info, empty
        exts.extend_from_slice(&[0xff, 0x01, 0x00, 0x01, 0x00]);
        if let Some(version) = self.selected_version {
            exts.extend_from_slice(&0x002bu16.to_be_bytes());
            push_u16(&mut exts, 2);
            exts.extend_from_slice(&version.to_be_bytes());
        }
        push_u16(&mut body, exts.len());
        body.extend_from_slice(&exts);

        handshake_record(HS_SERVER_HELLO, &body)
    }
}

/// A TLS 1.3-shaped server flight: ServerHello, ChangeCipherSpec, and one
/// encrypted record standing in for EncryptedExtensions..Finished.
pub fn tls13_server_flight() -> Vec<u8> {
    let mut flight = ServerHelloBuilder::tls13().build();
    flight.extend(change_cipher_spec());
    flight.extend(application_data(280));
    flight
}
