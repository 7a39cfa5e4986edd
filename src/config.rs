//! Runtime configuration for the relay server and the send/receive clients.
//!
//! Values come from the command line (with environment fallbacks handled by
//! clap); these types only hold and validate them.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::error::{Result, RiftError};
use crate::{DEFAULT_CODE_LENGTH, DEFAULT_HOST, DEFAULT_PORT};

/// Longest code the server will hand out
pub const MAX_CODE_LENGTH: usize = 32;

/// Server-side certificate source
#[derive(Debug, Clone, Default)]
pub struct ServerTls {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// Generate an in-memory certificate instead of loading one
    pub self_signed: bool,
}

/// How a client decides to trust the server certificate
#[derive(Debug, Clone, Default)]
pub struct ClientTls {
    pub ca_path: Option<PathBuf>,
    /// Accept any certificate. Only for servers with self-signed certificates.
    pub insecure: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub code_length: usize,
    pub tls: ServerTls,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            code_length: DEFAULT_CODE_LENGTH,
            tls: ServerTls::default(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.code_length == 0 || self.code_length > MAX_CODE_LENGTH {
            return Err(RiftError::Config(format!(
                "code length must be between 1 and {}, got {}",
                MAX_CODE_LENGTH, self.code_length
            )));
        }
        match (&self.tls.cert_path, &self.tls.key_path) {
            (Some(_), None) | (None, Some(_)) => Err(RiftError::Config(
                "certificate and key must be given together".to_string(),
            )),
            (None, None) if !self.tls.self_signed => Err(RiftError::Config(
                "a certificate and key, or --self-signed, is required".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub tls: ClientTls,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            tls: ClientTls::default(),
        }
    }
}

impl ClientConfig {
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(RiftError::Config("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(RiftError::Config("port must not be 0".to_string()));
        }
        if self.tls.insecure && self.tls.ca_path.is_some() {
            return Err(RiftError::Config(
                "--insecure and --ca are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed_server() -> ServerConfig {
        ServerConfig {
            tls: ServerTls {
                self_signed: true,
                ..ServerTls::default()
            },
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 9966);
        assert_eq!(config.code_length, 5);
        assert_eq!(config.listen_addr().to_string(), "0.0.0.0:9966");
    }

    #[test]
    fn test_server_code_length_bounds() {
        let mut config = self_signed_server();
        assert!(config.validate().is_ok());
        config.code_length = 0;
        assert!(config.validate().is_err());
        config.code_length = MAX_CODE_LENGTH + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_needs_tls_material() {
        let mut config = ServerConfig::default();
        assert!(config.validate().is_err());

        config.tls.cert_path = Some(PathBuf::from("cert.pem"));
        assert!(config.validate().is_err());

        config.tls.key_path = Some(PathBuf::from("key.pem"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_validation() {
        let mut config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server_addr(), "localhost:9966");

        config.tls.insecure = true;
        config.tls.ca_path = Some(PathBuf::from("ca.pem"));
        assert!(config.validate().is_err());

        config.tls.ca_path = None;
        config.port = 0;
        assert!(config.validate().is_err());
    }
}
