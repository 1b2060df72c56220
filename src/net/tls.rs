use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use tracing::{debug, error, info};

use crate::net::connection::{IoResult, TransferStatus, Transport};
use crate::net::details::ConnectionDetails;
use crate::net::tcp::TcpTransport;

enum TlsRole {
    Client,
    Server,
}

/// TLS over the non-blocking TCP transport.
///
/// The rustls session is a sans-IO state machine, so its handshake and
///  want-read/want-write conditions translate directly into the
///  [TransferStatus] model: `poll` reports `Success` only once the handshake
///  has completed, which keeps every application packet behind handshake
///  completion.
///
/// Client sessions are created lazily when `poll` first sees the underlying
///  TCP connect complete, because the connect completion and the handshake
///  start cannot be observed in the same tick. Server sessions are created
///  per accepted socket from the listener's prepared [ServerConfig].
pub struct TlsTransport {
    tcp: TcpTransport,
    session: Option<rustls::Connection>,
    handshake_done: bool,
    role: TlsRole,
    details: ConnectionDetails,
}

impl TlsTransport {
    pub fn from_details(details: &ConnectionDetails) -> TlsTransport {
        TlsTransport {
            tcp: TcpTransport::from_details(details),
            session: None,
            handshake_done: false,
            role: TlsRole::Client,
            details: details.clone(),
        }
    }

    pub fn from_accepted(stream: TcpStream, config: Arc<ServerConfig>) -> anyhow::Result<TlsTransport> {
        let session = ServerConnection::new(config)?;
        Ok(TlsTransport {
            tcp: TcpTransport::from_accepted(stream)?,
            session: Some(rustls::Connection::Server(session)),
            handshake_done: false,
            role: TlsRole::Server,
            details: ConnectionDetails::default(),
        })
    }

    fn build_client_session(details: &ConnectionDetails) -> anyhow::Result<rustls::Connection> {
        let mut roots = RootCertStore::empty();
        let ca_file = details.get("ca", String::new());
        if !ca_file.is_empty() {
            let mut reader = BufReader::new(File::open(&ca_file)?);
            for cert in rustls_pemfile::certs(&mut reader) {
                roots.add(cert?)?;
            }
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let common_name = details.get(
            "commonName",
            details.address().unwrap_or_default().to_string(),
        );
        let server_name = ServerName::try_from(common_name)?;
        let session = ClientConnection::new(Arc::new(config), server_name)?;
        Ok(rustls::Connection::Client(session))
    }

    fn drive_handshake(&mut self) -> TransferStatus {
        let Some(session) = self.session.as_mut() else {
            return TransferStatus::Disconnect;
        };
        let Some(stream) = self.tcp.stream_mut() else {
            return TransferStatus::Disconnect;
        };
        while session.is_handshaking() {
            if session.wants_write() {
                match session.write_tls(stream) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return TransferStatus::Wait,
                    Err(e) => {
                        debug!("TLS handshake write failed: {}", e);
                        return TransferStatus::Disconnect;
                    }
                }
            }
            if session.wants_read() {
                match session.read_tls(stream) {
                    Ok(0) => {
                        debug!("peer closed during TLS handshake");
                        return TransferStatus::Disconnect;
                    }
                    Ok(_) => {
                        if let Err(e) = session.process_new_packets() {
                            error!("TLS handshake failed: {}", e);
                            return TransferStatus::Disconnect;
                        }
                        continue;
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return TransferStatus::Wait,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("TLS handshake read failed: {}", e);
                        return TransferStatus::Disconnect;
                    }
                }
            }
        }
        self.handshake_done = true;
        info!("TLS handshake completed: {}", self.details);
        TransferStatus::Success
    }
}

impl Transport for TlsTransport {
    fn connect(&mut self) -> anyhow::Result<()> {
        self.tcp.connect()
    }

    fn poll(&mut self) -> TransferStatus {
        match self.tcp.poll() {
            TransferStatus::Success => {}
            other => return other,
        }
        if self.session.is_none() {
            if matches!(self.role, TlsRole::Server) {
                return TransferStatus::Disconnect;
            }
            match Self::build_client_session(&self.details) {
                Ok(session) => self.session = Some(session),
                Err(e) => {
                    error!("failed to set up TLS client session: {}", e);
                    return TransferStatus::Disconnect;
                }
            }
        }
        if self.handshake_done {
            return TransferStatus::Success;
        }
        self.drive_handshake()
    }

    fn send(&mut self, buf: &[u8]) -> IoResult {
        if !self.handshake_done {
            return IoResult::wait();
        }
        let Some(session) = self.session.as_mut() else {
            return IoResult::disconnect();
        };
        let Some(stream) = self.tcp.stream_mut() else {
            return IoResult::disconnect();
        };
        let n = match session.writer().write(buf) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return IoResult::wait(),
            Err(e) => {
                debug!("TLS write failed: {}", e);
                return IoResult::disconnect();
            }
        };
        // flush as much of the encrypted data as the socket accepts; anything
        //  left stays buffered in the session until the next pump
        while session.wants_write() {
            match session.write_tls(stream) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("TLS write failed: {}", e);
                    return IoResult::disconnect();
                }
            }
        }
        IoResult::success(n)
    }

    fn receive(&mut self, buf: &mut [u8]) -> IoResult {
        if !self.handshake_done {
            return IoResult::wait();
        }
        let Some(session) = self.session.as_mut() else {
            return IoResult::disconnect();
        };
        let Some(stream) = self.tcp.stream_mut() else {
            return IoResult::disconnect();
        };

        // opportunistically flush encrypted data a previous send left behind
        while session.wants_write() {
            match session.write_tls(stream) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("TLS write failed: {}", e);
                    return IoResult::disconnect();
                }
            }
        }

        match session.reader().read(buf) {
            Ok(0) => return IoResult::disconnect(),
            Ok(n) => return IoResult::success(n),
            // no plaintext buffered, pull more off the socket below
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                debug!("TLS read failed: {}", e);
                return IoResult::disconnect();
            }
        }

        match session.read_tls(stream) {
            Ok(0) => return IoResult::disconnect(),
            Ok(_) => {
                if let Err(e) = session.process_new_packets() {
                    error!("TLS processing failed: {}", e);
                    return IoResult::disconnect();
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return IoResult::wait(),
            Err(e) if e.kind() == ErrorKind::Interrupted => return IoResult::wait(),
            Err(e) => {
                debug!("TLS read failed: {}", e);
                return IoResult::disconnect();
            }
        }

        match session.reader().read(buf) {
            Ok(0) => IoResult::disconnect(),
            Ok(n) => IoResult::success(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => IoResult::wait(),
            Err(e) => {
                debug!("TLS read failed: {}", e);
                IoResult::disconnect()
            }
        }
    }

    fn shutdown(&mut self) {
        if let (Some(session), Some(stream)) = (self.session.as_mut(), self.tcp.stream_mut()) {
            session.send_close_notify();
            let _ = session.write_tls(stream);
        }
        self.tcp.shutdown();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.local_addr()
    }
}

/// Load the certificate chain and private key for a TLS listening endpoint
///  from the `publicCert=` and `privateKey=` connection details.
pub(crate) fn load_server_config(details: &ConnectionDetails) -> anyhow::Result<Arc<ServerConfig>> {
    let cert_file = details.get("publicCert", String::new());
    let key_file = details.get("privateKey", String::new());
    if cert_file.is_empty() || key_file.is_empty() {
        anyhow::bail!("TLS listening requires publicCert and privateKey: {}", details);
    }

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(&cert_file)?))
            .collect::<Result<_, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&key_file)?))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_file))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}
