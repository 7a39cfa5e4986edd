use log::debug;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::tls::TlsConnector;

/// Open a TLS connection to the rendezvous server described by `config`.
pub async fn establish_connection(config: &ClientConfig) -> Result<TlsStream<TcpStream>> {
    config.validate()?;
    let connector = TlsConnector::new(&config.tls)?;
    connect_with(&connector, &config.host, config.port).await
}

/// Connect to `host:port` and run the TLS handshake with `connector`.
pub async fn connect_with(
    connector: &TlsConnector,
    host: &str,
    port: u16,
) -> Result<TlsStream<TcpStream>> {
    let addr = format!("{}:{}", host, port);
    debug!("Connecting to rendezvous server at {}", addr);
    let tcp = TcpStream::connect(&addr).await?;
    tcp.set_nodelay(true)?;

    let stream = connector.connect(tcp, host).await?;
    debug!("TLS session established with {}", addr);
    Ok(stream)
}
