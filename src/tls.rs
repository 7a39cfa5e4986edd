//! TLS for the rendezvous transport.
//!
//! - **Server side**: a certificate chain and key loaded from PEM files, or a
//!   self-signed certificate generated in memory. Client certificates are
//!   never requested.
//! - **Client side**: trust a given CA file, the bundled webpki roots, or,
//!   when explicitly asked for, any certificate the server presents.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::warn;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{ClientTls, ServerTls};

/// TLS-specific errors
#[derive(Error, Debug)]
pub enum TlsError {
    /// Failed to load certificate from file
    #[error("Failed to load certificate from {path}: {reason}")]
    CertificateLoad { path: PathBuf, reason: String },

    /// Failed to load private key from file
    #[error("Failed to load private key from {path}: {reason}")]
    PrivateKeyLoad { path: PathBuf, reason: String },

    /// Self-signed certificate generation failed
    #[error("Failed to generate certificate: {0}")]
    Generate(String),

    /// TLS handshake failed
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    Config(String),
}

impl TlsError {
    pub fn cert_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        TlsError::CertificateLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn key_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        TlsError::PrivateKeyLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn handshake(reason: impl Into<String>) -> Self {
        TlsError::Handshake(reason.into())
    }

    pub fn config(reason: impl Into<String>) -> Self {
        TlsError::Config(reason.into())
    }
}

/// Certificate chain and key the server presents
pub struct ServerIdentity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl ServerIdentity {
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let certs = load_certificates(cert_path)?;
        if certs.is_empty() {
            return Err(TlsError::cert_load(cert_path, "no certificates found in file"));
        }
        let key = load_private_key(key_path)?;
        Ok(ServerIdentity { certs, key })
    }

    /// Generate a throwaway certificate valid for `names`. Also returns the
    /// certificate so a client can be told to trust it.
    pub fn self_signed(names: Vec<String>) -> Result<(Self, CertificateDer<'static>), TlsError> {
        let certified = rcgen::generate_simple_self_signed(names)
            .map_err(|e| TlsError::Generate(e.to_string()))?;
        let cert = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));
        let identity = ServerIdentity {
            certs: vec![cert.clone()],
            key,
        };
        Ok((identity, cert))
    }
}

/// Upgrades accepted TCP connections to TLS
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    pub fn new(identity: ServerIdentity) -> Result<Self, TlsError> {
        let provider = rustls::crypto::ring::default_provider();

        let server_config = ServerConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::config(format!("Failed to set protocol versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(identity.certs, identity.key)
            .map_err(|e| TlsError::config(format!("Failed to build TLS config: {}", e)))?;

        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(server_config)),
        })
    }

    /// Build from server configuration, generating a certificate when
    /// `self_signed` is set.
    pub fn from_config(config: &ServerTls) -> Result<Self, TlsError> {
        let identity = match (&config.cert_path, &config.key_path) {
            (Some(cert), Some(key)) => ServerIdentity::from_pem_files(cert, key)?,
            _ if config.self_signed => {
                warn!("Serving a self-signed certificate; clients need --insecure or --ca");
                ServerIdentity::self_signed(vec!["localhost".to_string()])?.0
            }
            _ => return Err(TlsError::config("cert_path and key_path are required")),
        };
        Self::new(identity)
    }

    pub async fn accept<S>(&self, stream: S) -> Result<tokio_rustls::server::TlsStream<S>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.inner
            .accept(stream)
            .await
            .map_err(|e| TlsError::handshake(e.to_string()))
    }
}

/// Establishes TLS sessions to the rendezvous server
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    pub fn new(config: &ClientTls) -> Result<Self, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::config(format!("Failed to set protocol versions: {}", e)))?;

        let client_config = if config.insecure {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertificateVerification(provider)))
                .with_no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            match &config.ca_path {
                Some(ca_path) => {
                    for cert in load_certificates(ca_path)? {
                        roots
                            .add(cert)
                            .map_err(|e| TlsError::cert_load(ca_path, e.to_string()))?;
                    }
                }
                None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        };

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Connector trusting exactly `cert`.
    pub fn trusting(cert: CertificateDer<'static>) -> Result<Self, TlsError> {
        let mut roots = RootCertStore::empty();
        roots
            .add(cert)
            .map_err(|e| TlsError::config(e.to_string()))?;
        let provider = rustls::crypto::ring::default_provider();
        let client_config = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::config(format!("Failed to set protocol versions: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
        })
    }

    pub async fn connect<S>(
        &self,
        stream: S,
        server_name: &str,
    ) -> Result<tokio_rustls::client::TlsStream<S>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::config(format!("Invalid server name: {}", server_name)))?;

        self.inner
            .connect(server_name, stream)
            .await
            .map_err(|e| TlsError::handshake(e.to_string()))
    }
}

/// Load every certificate from a PEM file
pub(crate) fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::cert_load(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::cert_load(path, e.to_string()))
}

/// Load the first private key (PKCS#8, RSA or EC) from a PEM file
pub(crate) fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::key_load(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::key_load(path, e.to_string()))?
        .ok_or_else(|| TlsError::key_load(path, "no private key found in file"))
}

/// Accepts whatever certificate the server presents. Signatures are still
/// checked so the handshake itself stays well-formed.
#[derive(Debug)]
struct NoCertificateVerification(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for NoCertificateVerification {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_self_signed_identity_builds_acceptor() {
        let (identity, cert) = ServerIdentity::self_signed(vec!["localhost".to_string()]).unwrap();
        assert_eq!(identity.certs.len(), 1);
        assert_eq!(identity.certs[0], cert);
        assert!(TlsAcceptor::new(identity).is_ok());
    }

    #[test]
    fn test_pem_files_round_trip_through_loader() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        File::create(&cert_path)
            .unwrap()
            .write_all(certified.cert.pem().as_bytes())
            .unwrap();
        File::create(&key_path)
            .unwrap()
            .write_all(certified.key_pair.serialize_pem().as_bytes())
            .unwrap();

        let identity = ServerIdentity::from_pem_files(&cert_path, &key_path).unwrap();
        assert_eq!(identity.certs.len(), 1);

        let config = ServerTls {
            cert_path: Some(cert_path),
            key_path: Some(key_path),
            self_signed: false,
        };
        assert!(TlsAcceptor::from_config(&config).is_ok());
    }

    #[test]
    fn test_missing_certificate_file() {
        let err = load_certificates(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(matches!(err, TlsError::CertificateLoad { .. }));
    }

    #[test]
    fn test_server_tls_requires_material() {
        let config = ServerTls::default();
        assert!(matches!(
            TlsAcceptor::from_config(&config),
            Err(TlsError::Config(_))
        ));
    }

    #[test]
    fn test_insecure_connector_builds() {
        let config = ClientTls {
            ca_path: None,
            insecure: true,
        };
        assert!(TlsConnector::new(&config).is_ok());
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (identity, cert) = ServerIdentity::self_signed(vec!["localhost".to_string()]).unwrap();
        let acceptor = TlsAcceptor::new(identity).unwrap();
        let connector = TlsConnector::trusting(cert).unwrap();

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move { acceptor.accept(server_io).await.map(|_| ()) });
        let client = connector.connect(client_io, "localhost").await;

        assert!(client.is_ok());
        assert!(server.await.unwrap().is_ok());
    }
}
