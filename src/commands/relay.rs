use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::handshake::{handle_connection, HandshakeOutcome, Registry};
use crate::registry::SessionRegistry;
use crate::tls::TlsAcceptor;

/// Registry used by the production server
pub type ServerRegistry = Registry<TlsStream<TcpStream>>;

/// Run the rendezvous server until the process is stopped.
///
/// # Overview
/// The server is the meeting point for transfers. It:
/// 1. Accepts TCP connections and upgrades each to TLS
/// 2. Reads one intent per connection
/// 3. Registers uploaders under a fresh code
/// 4. Pairs downloaders with the uploader behind their code and relays bytes
///
/// # Architecture
/// - Main task: accepts connections in a loop
/// - Connection tasks: one per client, run the handshake; an uploader's task
///   also runs the relay once a downloader is handed to it
/// - Relay tasks: two per paired session, one per direction
pub async fn run(config: ServerConfig) -> Result<()> {
    config.validate()?;
    let acceptor = TlsAcceptor::from_config(&config.tls)?;

    let bind_addr = config.listen_addr();
    debug!("Attempting to bind to {}", bind_addr);
    let listener = TcpListener::bind(bind_addr).await?;
    println!("Server listening on {}", bind_addr);
    info!("Rendezvous server started on {}", bind_addr);

    let registry = Arc::new(SessionRegistry::new(config.code_length));
    serve(listener, acceptor, registry).await
}

/// Accept connections on `listener` forever, one task per client.
pub async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    registry: Arc<ServerRegistry>,
) -> Result<()> {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };
        info!("New client connection from: {}", addr);

        let acceptor = acceptor.clone();
        let registry = Arc::clone(&registry);
        debug!("Spawning connection handler for {}", addr);
        tokio::spawn(async move {
            let _ = stream.set_nodelay(true);
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    warn!("TLS handshake with {} failed: {}", addr, e);
                    return;
                }
            };

            match handle_connection(tls, registry).await {
                Ok(HandshakeOutcome::Relayed { code, stats }) => info!(
                    "[{}] Session {} relayed {} bytes up, {} bytes back",
                    addr, code, stats.uploaded, stats.downloaded
                ),
                Ok(HandshakeOutcome::Rejected(reason)) => {
                    info!("[{}] Rejected: {}", addr, reason)
                }
                Ok(outcome) => debug!("[{}] Connection finished: {:?}", addr, outcome),
                Err(e) => warn!("[{}] Connection error: {}", addr, e),
            }
        });
    }
}
