//! The TLS engine seam and its rustls implementation.
//!
//! Layers only shuffle bytes through a [`TlsEngine`]; certificates, keys and
//! verification policy are decided by whoever answers the `tls_start` hook.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, ServerConfig, ServerConnection};

use crate::error::TlsError;

/// Facts known once a handshake completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub alpn: Option<Vec<u8>>,
    pub sni: Option<String>,
    pub cipher: Option<String>,
    pub tls_version: Option<String>,
    pub peer_certificates: Vec<Vec<u8>>,
}

/// Decrypted bytes and whether the peer sent close_notify.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plaintext {
    pub data: Vec<u8>,
    pub closed: bool,
}

/// A TLS state machine fed from and drained to byte buffers.
pub trait TlsEngine: Send {
    /// Feeds ciphertext received from the peer and advances the state machine.
    fn feed(&mut self, ciphertext: &[u8]) -> Result<(), TlsError>;

    fn is_handshaking(&self) -> bool;

    /// Ciphertext waiting to be sent to the peer.
    fn take_outgoing(&mut self) -> Vec<u8>;

    fn read_plaintext(&mut self) -> Result<Plaintext, TlsError>;

    fn write_plaintext(&mut self, data: &[u8]) -> Result<(), TlsError>;

    fn send_close_notify(&mut self);

    fn session_info(&self) -> SessionInfo;
}

/// The crypto provider every config in this crate is built with.
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Client config for upstream connections. Without `roots` the server
/// certificate is not verified.
pub fn client_config(
    roots: Option<RootCertStore>,
    alpn_protocols: Vec<Vec<u8>>,
) -> Result<Arc<ClientConfig>, TlsError> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Other(e.to_string()))?;
    let mut config = match roots {
        Some(roots) => builder.with_root_certificates(roots).with_no_client_auth(),
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier(provider())))
            .with_no_client_auth(),
    };
    config.alpn_protocols = alpn_protocols;
    Ok(Arc::new(config))
}

/// Server config presenting `cert_chain` to clients.
pub fn server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    alpn_protocols: Vec<Vec<u8>>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Other(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| TlsError::Other(e.to_string()))?;
    config.alpn_protocols = alpn_protocols;
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// [`TlsEngine`] backed by a rustls connection.
pub struct RustlsEngine {
    conn: rustls::Connection,
}

impl RustlsEngine {
    /// Client side of a connection to `server_name`.
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, TlsError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TlsError::Other(format!("invalid server name {}: {}", server_name, e)))?;
        let conn = ClientConnection::new(config, name).map_err(|e| TlsError::classify(&e.to_string()))?;
        Ok(Self { conn: conn.into() })
    }

    /// Server side, for terminating a client's TLS.
    pub fn server(config: Arc<ServerConfig>) -> Result<Self, TlsError> {
        let conn = ServerConnection::new(config).map_err(|e| TlsError::classify(&e.to_string()))?;
        Ok(Self { conn: conn.into() })
    }
}

impl TlsEngine for RustlsEngine {
    fn feed(&mut self, mut ciphertext: &[u8]) -> Result<(), TlsError> {
        loop {
            if !ciphertext.is_empty() {
                self.conn
                    .read_tls(&mut ciphertext)
                    .map_err(|e| TlsError::Other(e.to_string()))?;
            }
            self.conn
                .process_new_packets()
                .map_err(|e| TlsError::classify(&e.to_string()))?;
            if ciphertext.is_empty() {
                return Ok(());
            }
        }
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn take_outgoing(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            if self.conn.write_tls(&mut out).is_err() {
                break;
            }
        }
        out
    }

    fn read_plaintext(&mut self) -> Result<Plaintext, TlsError> {
        let mut plaintext = Plaintext::default();
        let mut buf = [0u8; 16 * 1024];
        loop {
            match self.conn.reader().read(&mut buf) {
                Ok(0) => {
                    plaintext.closed = true;
                    return Ok(plaintext);
                }
                Ok(n) => plaintext.data.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(plaintext),
                Err(e) => return Err(TlsError::Other(e.to_string())),
            }
        }
    }

    fn write_plaintext(&mut self, data: &[u8]) -> Result<(), TlsError> {
        self.conn
            .writer()
            .write_all(data)
            .map_err(|e| TlsError::Other(e.to_string()))
    }

    fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
    }

    fn session_info(&self) -> SessionInfo {
        let sni = match &self.conn {
            rustls::Connection::Server(server) => server.server_name().map(str::to_string),
            rustls::Connection::Client(_) => None,
        };
        SessionInfo {
            alpn: self.conn.alpn_protocol().map(<[u8]>::to_vec),
            sni,
            cipher: self
                .conn
                .negotiated_cipher_suite()
                .map(|suite| format!("{:?}", suite.suite())),
            tls_version: self.conn.protocol_version().map(|v| format!("{:?}", v)),
            peer_certificates: self
                .conn
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.to_vec()).collect())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rustls::pki_types::PrivatePkcs8KeyDer;

    /// A self-signed server config for `host` and a client config that skips
    /// verification.
    pub(crate) fn configs(host: &str, alpn: &[&[u8]]) -> (Arc<ServerConfig>, Arc<ClientConfig>) {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec![host.to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let alpn: Vec<Vec<u8>> = alpn.iter().map(|p| p.to_vec()).collect();
        let server = server_config(
            vec![cert.der().clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
            alpn.clone(),
        )
        .unwrap();
        (server, client_config(None, alpn).unwrap())
    }

    /// Pumps ciphertext between two engines until neither has output.
    pub(crate) fn pump(a: &mut dyn TlsEngine, b: &mut dyn TlsEngine) {
        loop {
            let ab = a.take_outgoing();
            let ba = b.take_outgoing();
            if ab.is_empty() && ba.is_empty() {
                return;
            }
            b.feed(&ab).unwrap();
            a.feed(&ba).unwrap();
        }
    }

    #[test]
    fn handshake_and_exchange() {
        let (server_cfg, client_cfg) = configs("example.com", &[b"h2", b"http/1.1"]);
        let mut client = RustlsEngine::client(client_cfg, "example.com").unwrap();
        let mut server = RustlsEngine::server(server_cfg).unwrap();
        pump(&mut client, &mut server);
        assert!(!client.is_handshaking());
        assert!(!server.is_handshaking());

        let info = server.session_info();
        assert_eq!(info.sni.as_deref(), Some("example.com"));
        assert_eq!(info.alpn.as_deref(), Some(&b"h2"[..]));
        assert!(info.tls_version.is_some());
        assert_eq!(client.session_info().peer_certificates.len(), 1);

        client.write_plaintext(b"ping").unwrap();
        pump(&mut client, &mut server);
        assert_eq!(server.read_plaintext().unwrap().data, b"ping");

        server.send_close_notify();
        pump(&mut client, &mut server);
        assert!(client.read_plaintext().unwrap().closed);
    }

    #[test]
    fn garbage_is_not_tls() {
        let (server_cfg, _) = configs("example.com", &[]);
        let mut server = RustlsEngine::server(server_cfg).unwrap();
        let err = server.feed(b"GET / HTTP/1.1\r\n\r\n").unwrap_err();
        assert_ne!(err, TlsError::Alert("unknown ca".to_string()));
    }
}
