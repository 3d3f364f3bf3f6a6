//! ClientHello extraction from raw TLS records.
//!
//! The ClientHello may be split across several handshake records. Parsing
//! distinguishes "need more bytes" (`Ok(None)`) from "this is not a TLS
//! handshake" (`Err`).

use bytes::{Bytes, BytesMut};
use thiserror::Error;

const HANDSHAKE_RECORD: u8 = 0x16;
const CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;

/// Malformed ClientHello input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientHelloError {
    #[error("expected TLS handshake record, got {0:02x?}")]
    NotHandshakeRecord(Vec<u8>),

    #[error("record must not be empty")]
    EmptyRecord,

    #[error("handshake message is not a ClientHello (type {0})")]
    NotClientHello(u8),

    #[error("invalid ClientHello: {0}")]
    Invalid(&'static str),
}

/// The parts of a ClientHello that routing decisions look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    pub sni: Option<String>,
    pub alpn_protocols: Vec<Vec<u8>>,
    pub cipher_suites: Vec<u16>,
    /// The handshake message without record framing.
    pub raw: Bytes,
}

/// True if `data` begins like a TLS 1.0-1.3 handshake record.
pub fn starts_like_tls_record(data: &[u8]) -> bool {
    data.len() > 2 && data[0] == HANDSHAKE_RECORD && data[1] == 0x03 && data[2] <= 0x03
}

/// Concatenates handshake record bodies until a full ClientHello message is
/// available. Returns it including its 4-byte handshake header.
pub fn get_client_hello(data: &[u8]) -> Result<Option<Bytes>, ClientHelloError> {
    let mut hello = BytesMut::new();
    let mut offset = 0;
    loop {
        if data.len() < offset + 5 {
            return Ok(None);
        }
        let header = &data[offset..offset + 5];
        if !starts_like_tls_record(header) {
            return Err(ClientHelloError::NotHandshakeRecord(header.to_vec()));
        }
        let size = u16::from_be_bytes([header[3], header[4]]) as usize;
        if size == 0 {
            return Err(ClientHelloError::EmptyRecord);
        }
        offset += 5;
        if data.len() < offset + size {
            return Ok(None);
        }
        hello.extend_from_slice(&data[offset..offset + size]);
        offset += size;

        if hello.len() >= 4 {
            let len = u32::from_be_bytes([0, hello[1], hello[2], hello[3]]) as usize + 4;
            if hello.len() >= len {
                hello.truncate(len);
                return Ok(Some(hello.freeze()));
            }
        }
    }
}

/// Parses a ClientHello out of buffered client bytes.
pub fn parse_client_hello(data: &[u8]) -> Result<Option<ClientHello>, ClientHelloError> {
    match get_client_hello(data)? {
        Some(raw) => ClientHello::parse(raw).map(Some),
        None => Ok(None),
    }
}

impl ClientHello {
    fn parse(raw: Bytes) -> Result<Self, ClientHelloError> {
        if raw[0] != CLIENT_HELLO {
            return Err(ClientHelloError::NotClientHello(raw[0]));
        }
        let mut r = Reader::new(&raw[4..]);
        r.skip(2 + 32)?; // legacy_version, random
        let session_id = r.u8()? as usize;
        r.skip(session_id)?;

        let mut suites = Reader::new(r.vec16()?);
        let mut cipher_suites = Vec::new();
        while !suites.is_empty() {
            cipher_suites.push(suites.u16()?);
        }
        let compression = r.u8()? as usize;
        r.skip(compression)?;

        let mut hello = ClientHello {
            cipher_suites,
            ..Default::default()
        };
        if r.is_empty() {
            hello.raw = raw;
            return Ok(hello);
        }

        let mut extensions = Reader::new(r.vec16()?);
        while !extensions.is_empty() {
            let kind = extensions.u16()?;
            let body = extensions.vec16()?;
            match kind {
                EXT_SERVER_NAME => hello.sni = parse_sni(body)?,
                EXT_ALPN => hello.alpn_protocols = parse_alpn(body)?,
                _ => {}
            }
        }
        hello.raw = raw;
        Ok(hello)
    }
}

fn parse_sni(body: &[u8]) -> Result<Option<String>, ClientHelloError> {
    let mut list = Reader::new(Reader::new(body).vec16()?);
    while !list.is_empty() {
        let name_type = list.u8()?;
        let name = list.vec16()?;
        if name_type == 0 {
            let host = std::str::from_utf8(name).map_err(|_| ClientHelloError::Invalid("sni"))?;
            return Ok(Some(host.to_string()));
        }
    }
    Ok(None)
}

fn parse_alpn(body: &[u8]) -> Result<Vec<Vec<u8>>, ClientHelloError> {
    let mut list = Reader::new(Reader::new(body).vec16()?);
    let mut protocols = Vec::new();
    while !list.is_empty() {
        protocols.push(list.vec8()?.to_vec());
    }
    Ok(protocols)
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ClientHelloError> {
        if self.buf.len() < n {
            return Err(ClientHelloError::Invalid("truncated"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn skip(&mut self, n: usize) -> Result<(), ClientHelloError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, ClientHelloError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ClientHelloError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn vec8(&mut self) -> Result<&'a [u8], ClientHelloError> {
        let n = self.u8()? as usize;
        self.take(n)
    }

    fn vec16(&mut self) -> Result<&'a [u8], ClientHelloError> {
        let n = self.u16()? as usize;
        self.take(n)
    }
}

/// Builds a ClientHello record for tests and fixtures.
#[cfg(any(test, feature = "test-util"))]
pub fn build_client_hello(sni: Option<&str>, alpn: &[&[u8]]) -> Vec<u8> {
    fn vec16(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    let mut extensions = Vec::new();
    if let Some(host) = sni {
        let mut entry = vec![0u8];
        entry.extend(vec16(host.as_bytes()));
        extensions.extend(EXT_SERVER_NAME.to_be_bytes());
        extensions.extend(vec16(&vec16(&entry)));
    }
    if !alpn.is_empty() {
        let mut list = Vec::new();
        for proto in alpn {
            list.push(proto.len() as u8);
            list.extend_from_slice(proto);
        }
        extensions.extend(EXT_ALPN.to_be_bytes());
        extensions.extend(vec16(&vec16(&list)));
    }

    let mut body = vec![0x03, 0x03];
    body.extend([0x42; 32]);
    body.push(0); // session id
    body.extend(vec16(&[0x13, 0x01, 0xc0, 0x2f]));
    body.extend([1, 0]); // null compression
    body.extend(vec16(&extensions));

    let mut handshake = vec![CLIENT_HELLO];
    handshake.extend(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend(body);

    let mut record = vec![HANDSHAKE_RECORD, 0x03, 0x01];
    record.extend(vec16(&handshake));
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sni_alpn_and_suites() {
        let record = build_client_hello(Some("example.com"), &[b"h2", b"http/1.1"]);
        let hello = parse_client_hello(&record).unwrap().unwrap();
        assert_eq!(hello.sni.as_deref(), Some("example.com"));
        assert_eq!(hello.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
        assert_eq!(hello.cipher_suites, vec![0x1301, 0xc02f]);
    }

    #[test]
    fn incomplete_input_is_not_an_error() {
        let record = build_client_hello(Some("example.com"), &[]);
        for cut in [0, 3, 5, 20, record.len() - 1] {
            assert_eq!(parse_client_hello(&record[..cut]), Ok(None), "cut at {}", cut);
        }
    }

    #[test]
    fn reassembles_across_records() {
        let record = build_client_hello(Some("split.example"), &[b"h2"]);
        let handshake = &record[5..];
        let (a, b) = handshake.split_at(handshake.len() / 2);
        let mut split = Vec::new();
        for part in [a, b] {
            split.extend([0x16, 0x03, 0x01]);
            split.extend((part.len() as u16).to_be_bytes());
            split.extend_from_slice(part);
        }
        let hello = parse_client_hello(&split).unwrap().unwrap();
        assert_eq!(hello.sni.as_deref(), Some("split.example"));
    }

    #[test]
    fn plain_http_is_rejected() {
        let err = parse_client_hello(b"GET / HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(matches!(err, ClientHelloError::NotHandshakeRecord(_)));
        assert!(!starts_like_tls_record(b"GET"));
    }

    #[test]
    fn missing_extensions_are_allowed() {
        let mut record = build_client_hello(None, &[]);
        // Drop the (empty) extensions block and fix up the lengths.
        record.truncate(record.len() - 2);
        let handshake_len = record.len() - 5;
        record[3..5].copy_from_slice(&(handshake_len as u16).to_be_bytes());
        let body_len = (handshake_len - 4) as u32;
        record[6..9].copy_from_slice(&body_len.to_be_bytes()[1..]);
        let hello = parse_client_hello(&record).unwrap().unwrap();
        assert_eq!(hello.sni, None);
        assert!(hello.alpn_protocols.is_empty());
    }
}
