//! TLS integration.
//!
//! Certificate loading and the non-blocking session driver used by both
//! the server side (client connections) and the client side (relay
//! connections). Sessions are driven by the same readable/writable poll
//! events as plaintext sockets: rustls buffers protocol-internal data, so
//! a session that `wants_write()` simply keeps the WRITABLE interest
//! until it drains, including writes raised in the middle of a read
//! (rekeys) and reads raised in the middle of a write.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::BytesMut;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use tracing::debug;

use crate::config::TlsSection;
use crate::error::{ServerError, ServerResult};

/// Builds the rustls server config for TLS listeners.
pub fn build_server_config(section: &TlsSection) -> ServerResult<Arc<ServerConfig>> {
    let certs = load_certs(&section.cert)?;
    let key = load_private_key(&section.key)?;

    let config = if section.verify_client {
        let ca = section.ca.as_ref().ok_or_else(|| {
            ServerError::Config("tls.verify_client requires tls.ca".to_string())
        })?;
        let roots = load_root_store(ca)?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| ServerError::Tls(e.to_string()))?;
        ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(e.to_string()))?
    } else {
        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(e.to_string()))?
    };

    Ok(Arc::new(config))
}

/// Builds the rustls client config used for outbound relay connections.
pub fn build_relay_client_config(section: Option<&TlsSection>) -> ServerResult<Arc<ClientConfig>> {
    let ca = section.and_then(|s| s.ca.as_ref()).ok_or_else(|| {
        ServerError::Config("relay.tls requires a [tls] section with tls.ca".to_string())
    })?;
    let roots = load_root_store(ca)?;
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn load_root_store(path: &Path) -> ServerResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| ServerError::Tls(format!("bad CA certificate in {}: {e}", path.display())))?;
    }
    Ok(roots)
}

fn open_pem(path: &Path) -> ServerResult<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ServerError::Tls(format!("unable to read {}: {e}", path.display())))
}

/// Loads a certificate chain from a PEM file.
///
/// A malformed section is an error rather than being skipped; a silently
/// shortened chain fails much later, at the first handshake.
pub fn load_certs(path: &Path) -> ServerResult<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut open_pem(path)?)
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError::Tls(format!("bad certificate in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ServerError::Tls(format!(
            "{} contains no certificates",
            path.display()
        )));
    }
    Ok(certs)
}

/// Loads the private key from a PEM file, in any of the key encodings
/// (PKCS#8, PKCS#1, SEC1). Non-key sections in the file are ignored.
pub fn load_private_key(path: &Path) -> ServerResult<PrivateKeyDer<'static>> {
    match rustls_pemfile::private_key(&mut open_pem(path)?) {
        Ok(Some(key)) => Ok(key),
        Ok(None) => Err(ServerError::Tls(format!(
            "{} contains no private key",
            path.display()
        ))),
        Err(e) => Err(ServerError::Tls(format!(
            "bad private key in {}: {e}",
            path.display()
        ))),
    }
}

/// Outcome of a TLS read pass.
pub(crate) enum TlsIo {
    /// Plaintext bytes appended to the read buffer (possibly zero while
    /// the session is mid-record or mid-rekey).
    Data(usize),
    /// Clean close from the peer.
    Eof,
}

/// A non-blocking TLS session, server or client side.
pub(crate) struct TlsSession {
    conn: rustls::Connection,
}

impl TlsSession {
    /// Creates the server half for an accepted socket.
    pub fn server(config: Arc<ServerConfig>) -> ServerResult<Self> {
        let conn = ServerConnection::new(config)
            .map_err(|e| ServerError::Tls(format!("failed to create TLS session: {e}")))?;
        Ok(Self {
            conn: rustls::Connection::Server(conn),
        })
    }

    /// Creates the client half for an outbound relay socket.
    pub fn client(config: Arc<ClientConfig>, host: &str) -> ServerResult<Self> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|_| ServerError::Tls(format!("invalid relay server name {host}")))?;
        let conn = ClientConnection::new(config, name)
            .map_err(|e| ServerError::Tls(format!("failed to create TLS session: {e}")))?;
        Ok(Self {
            conn: rustls::Connection::Client(conn),
        })
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// True while the session has buffered TLS data to send, which keeps
    /// a WRITABLE interest registered even when the protocol write queue
    /// is empty.
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Advances the handshake by one I/O round.
    ///
    /// Returns `Ok(true)` once the handshake is complete, `Ok(false)` if
    /// it needs more I/O.
    pub fn drive_handshake<S: Read + Write>(&mut self, sock: &mut S) -> ServerResult<bool> {
        if self.conn.is_handshaking() {
            while self.conn.wants_write() {
                match self.conn.write_tls(sock) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(ServerError::Io(e)),
                }
            }

            if self.conn.wants_read() {
                match self.conn.read_tls(sock) {
                    Ok(0) => {
                        // EOF during handshake.
                        return Err(ServerError::ConnectionClosed);
                    }
                    Ok(_) => {
                        if let Err(e) = self.conn.process_new_packets() {
                            return Err(ServerError::Tls(format!("TLS handshake error: {e}")));
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(ServerError::Io(e)),
                }
            }

            // The reply to what we just processed may be buffered now.
            while self.conn.wants_write() {
                match self.conn.write_tls(sock) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(ServerError::Io(e)),
                }
            }
        }

        let done = !self.conn.is_handshaking();
        if done {
            let version = self
                .conn
                .protocol_version()
                .map_or_else(|| "unknown".to_string(), |v| format!("{v:?}"));
            let cipher = self
                .conn
                .negotiated_cipher_suite()
                .map_or_else(|| "unknown".to_string(), |c| format!("{:?}", c.suite()));
            debug!(version, cipher, "TLS handshake complete");
        }
        Ok(done)
    }

    /// Reads and decrypts from the socket, appending plaintext to `out`.
    pub fn read<S: Read + Write>(
        &mut self,
        sock: &mut S,
        out: &mut BytesMut,
    ) -> io::Result<TlsIo> {
        let mut sock_eof = false;
        while self.conn.wants_read() {
            match self.conn.read_tls(sock) {
                Ok(0) => {
                    sock_eof = true;
                    break;
                }
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        let mut total = 0;
        let mut tmp = [0u8; 4096];
        loop {
            match self.conn.reader().read(&mut tmp) {
                Ok(0) => return Ok(TlsIo::Eof),
                Ok(n) => {
                    out.extend_from_slice(&tmp[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        if total == 0 && sock_eof {
            return Ok(TlsIo::Eof);
        }
        Ok(TlsIo::Data(total))
    }

    /// Encrypts `data` into the session and flushes what the socket will
    /// take. Returns how many plaintext bytes were consumed.
    pub fn write<S: Read + Write>(&mut self, sock: &mut S, data: &[u8]) -> io::Result<usize> {
        let written = self.conn.writer().write(data)?;
        self.flush(sock)?;
        Ok(written)
    }

    /// Writes buffered TLS data to the socket.
    pub fn flush<S: Read + Write>(&mut self, sock: &mut S) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn load_certs_missing_file() {
        let err = load_certs(Path::new("/nonexistent/server.crt")).unwrap_err();
        assert!(matches!(err, ServerError::Tls(_)));
    }

    #[test]
    fn load_certs_empty_pem() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a certificate\n").unwrap();
        let err = load_certs(file.path()).unwrap_err();
        assert!(matches!(err, ServerError::Tls(_)));
    }

    #[test]
    fn load_private_key_missing_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"-----BEGIN CERTIFICATE-----\nAA==\n-----END CERTIFICATE-----\n")
            .unwrap();
        let err = load_private_key(file.path()).unwrap_err();
        assert!(matches!(err, ServerError::Tls(_)));
    }

    #[test]
    fn relay_client_config_requires_ca() {
        let err = build_relay_client_config(None).unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }
}
