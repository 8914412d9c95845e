//! TLS connector for the transport worker
//!
//! The control-plane API commonly runs with self-signed certificates, so peer
//! verification is delegated to a [`CertificatePolicy`] instead of a root
//! store. Handshake signatures are still verified with the crypto provider.

use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme, StreamOwned};
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::errors::{ConfigError, TransportError};

/// Decides whether a peer certificate is trusted for a hostname
pub trait CertificateValidator: Send + Sync {
    fn validate(&self, hostname: &str, certificate: &CertificateDer<'_>) -> bool;
}

#[derive(Clone)]
pub enum CertificatePolicy {
    /// Accept whatever the peer presents, self-signed included
    AcceptAll,
    /// Ask the validator for every connection
    Validate(Arc<dyn CertificateValidator>),
}

impl fmt::Debug for CertificatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificatePolicy::AcceptAll => write!(f, "AcceptAll"),
            CertificatePolicy::Validate(_) => write!(f, "Validate(..)"),
        }
    }
}

/// Trusts exactly the certificates it was given, whatever their issuer
#[derive(Debug, Clone, Default)]
pub struct PinnedCertificates {
    certificates: Vec<CertificateDer<'static>>,
}

impl PinnedCertificates {
    pub fn new(certificates: Vec<CertificateDer<'static>>) -> Self {
        Self { certificates }
    }

    pub fn from_pem_file(path: &Path) -> Result<Self, ConfigError> {
        let load_failed = |reason: String| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason,
        };

        let certificates = CertificateDer::pem_file_iter(path)
            .map_err(|e| load_failed(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| load_failed(e.to_string()))?;

        if certificates.is_empty() {
            return Err(load_failed("no certificates found".to_string()));
        }
        Ok(Self::new(certificates))
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

impl CertificateValidator for PinnedCertificates {
    fn validate(&self, _hostname: &str, certificate: &CertificateDer<'_>) -> bool {
        self.certificates
            .iter()
            .any(|pinned| pinned.as_ref() == certificate.as_ref())
    }
}

/// Phases reported while a worker connects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    Resolving,
    Connecting,
    Handshaking,
    Connected,
}

/// A connected byte stream owned by a transport worker
pub trait Stream: Read + Write + Send {
    /// Handle another thread can use to abort a blocking socket call
    fn abort_handle(&self) -> Option<TcpStream>;

    /// Orderly shutdown before the stream is dropped
    fn close(&mut self) {}
}

impl Stream for TcpStream {
    fn abort_handle(&self) -> Option<TcpStream> {
        self.try_clone().ok()
    }
}

impl Stream for StreamOwned<ClientConnection, TcpStream> {
    fn abort_handle(&self) -> Option<TcpStream> {
        self.sock.try_clone().ok()
    }

    fn close(&mut self) {
        self.conn.send_close_notify();
        if let Err(e) = self.flush() {
            debug!("close_notify not delivered: {}", e);
        }
    }
}

/// Establishes the worker's connection on the worker's own thread
pub trait Connector: Send + Sync {
    /// Host name used for the `Host` header and in log lines
    fn host(&self) -> &str;

    fn connect(
        &self,
        config: &TransportConfig,
        progress: &dyn Fn(ConnectPhase),
    ) -> Result<Box<dyn Stream>, TransportError>;
}

pub struct TlsConnector {
    host: String,
    port: u16,
    policy: CertificatePolicy,
}

impl TlsConnector {
    pub fn new(host: impl Into<String>, port: u16, policy: CertificatePolicy) -> Self {
        Self {
            host: host.into(),
            port,
            policy,
        }
    }

    fn client_config(&self) -> Result<Arc<ClientConfig>, TransportError> {
        let provider = Arc::new(ring::default_provider());
        let verifier = PolicyVerifier {
            host: self.host.clone(),
            policy: self.policy.clone(),
            algorithms: provider.signature_verification_algorithms,
        };

        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::HandshakeFailed {
                host: self.host.clone(),
                reason: format!("TLS config error: {}", e),
            })?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        Ok(Arc::new(config))
    }

    fn connect_tcp(&self, config: &TransportConfig) -> Result<TcpStream, TransportError> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::ResolveFailed {
                host: self.host.clone(),
                reason: e.to_string(),
            })?
            .collect();

        let mut last_error = TransportError::ResolveFailed {
            host: self.host.clone(),
            reason: "no addresses".to_string(),
        };

        for addr in addrs {
            match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    last_error = TransportError::ConnectTimeout {
                        host: self.host.clone(),
                    };
                }
                Err(e) => {
                    last_error = TransportError::ConnectFailed {
                        host: self.host.clone(),
                        reason: e.to_string(),
                    };
                }
            }
        }

        Err(last_error)
    }

    fn handshake_error(&self, e: io::Error) -> TransportError {
        let rejected = e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
            .is_some_and(|tls| matches!(tls, rustls::Error::InvalidCertificate(_)));

        if rejected {
            TransportError::CertificateRejected {
                host: self.host.clone(),
            }
        } else {
            TransportError::HandshakeFailed {
                host: self.host.clone(),
                reason: e.to_string(),
            }
        }
    }
}

impl Connector for TlsConnector {
    fn host(&self) -> &str {
        &self.host
    }

    fn connect(
        &self,
        config: &TransportConfig,
        progress: &dyn Fn(ConnectPhase),
    ) -> Result<Box<dyn Stream>, TransportError> {
        progress(ConnectPhase::Resolving);
        let client_config = self.client_config()?;
        let server_name = ServerName::try_from(self.host.clone()).map_err(|e| {
            TransportError::HandshakeFailed {
                host: self.host.clone(),
                reason: e.to_string(),
            }
        })?;

        progress(ConnectPhase::Connecting);
        let sock = self.connect_tcp(config)?;
        sock.set_nodelay(true)?;
        sock.set_read_timeout(Some(config.handshake_timeout))?;
        sock.set_write_timeout(Some(config.handshake_timeout))?;

        progress(ConnectPhase::Handshaking);
        let conn = ClientConnection::new(client_config, server_name).map_err(|e| {
            TransportError::HandshakeFailed {
                host: self.host.clone(),
                reason: e.to_string(),
            }
        })?;
        let mut stream = StreamOwned::new(conn, sock);

        let deadline = Instant::now() + config.handshake_timeout;
        while stream.conn.is_handshaking() {
            if Instant::now() >= deadline {
                return Err(TransportError::HandshakeFailed {
                    host: self.host.clone(),
                    reason: "timed out".to_string(),
                });
            }
            stream
                .conn
                .complete_io(&mut stream.sock)
                .map_err(|e| self.handshake_error(e))?;
        }

        stream.sock.set_read_timeout(Some(config.read_timeout))?;
        stream.sock.set_write_timeout(Some(config.write_timeout))?;

        progress(ConnectPhase::Connected);
        Ok(Box::new(stream))
    }
}

#[derive(Debug)]
struct PolicyVerifier {
    host: String,
    policy: CertificatePolicy,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let accepted = match &self.policy {
            CertificatePolicy::AcceptAll => true,
            CertificatePolicy::Validate(validator) => validator.validate(&self.host, end_entity),
        };

        if accepted {
            Ok(ServerCertVerified::assertion())
        } else {
            warn!("Certificate presented by {} rejected by policy", self.host);
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
