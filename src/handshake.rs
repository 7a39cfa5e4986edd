//! Server side of the rendezvous handshake.
//!
//! One `handle_connection` call runs per accepted connection:
//!
//! ```text
//! AwaitIntent -> Validating -> Registered   (upload: code issued, waits for a peer)
//!                           -> Paired       (download: handed to the uploader's task)
//!                           -> Rejected     (error record sent, connection closed)
//! ```
//!
//! An uploader's task owns its connection for the whole session. When a
//! downloader is paired, its connection is sent over the session's one-shot
//! channel to that task, which announces the payload to the downloader and
//! runs the relay. The session's code is released when the uploader's task
//! ends, however it ends.

use std::sync::Arc;

use log::{debug, info, warn};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{Rejection, Result, RiftError};
use crate::protocol::{parse_intent, read_line, write_message, FileMetadata, Intent, ServerMessage};
use crate::registry::{
    random_code, MarkBusyError, Session, SessionGuard, SessionRegistry, TransferRole,
};
use crate::relay::{relay, RelayStats};

/// A connection as held by the server after the intent has been read
pub type Connection<S> = BufReader<S>;

/// Registry type used by the server for connections of type `S`
pub type Registry<S> = SessionRegistry<Connection<S>>;

/// How a connection's handshake ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Peer closed before sending an intent
    Disconnected,
    /// Uploader left before any downloader was paired
    Abandoned { code: String },
    /// Uploader was paired and the relay ran to completion
    Relayed { code: String, stats: RelayStats },
    /// Downloader was handed to the uploader owning `upload_code`
    Paired { code: String, upload_code: String },
    Rejected(Rejection),
}

/// Run the handshake for one freshly accepted connection.
///
/// Validation and protocol failures are answered on the connection and
/// returned as `HandshakeOutcome::Rejected`; only transport failures come
/// back as `Err`.
pub async fn handle_connection<S>(stream: S, registry: Arc<Registry<S>>) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut conn = BufReader::new(stream);

    debug!("Awaiting intent");
    let line = match read_line(&mut conn).await {
        Ok(Some(line)) => line,
        Ok(None) => {
            debug!("Client disconnected before sending an intent");
            return Ok(HandshakeOutcome::Disconnected);
        }
        Err(RiftError::Protocol(reason)) => {
            debug!("Unreadable intent: {}", reason);
            return reject(conn, Rejection::Malformed).await;
        }
        Err(e) => return Err(e),
    };

    debug!("Validating intent");
    let intent = match parse_intent(&line) {
        Ok(intent) => intent,
        Err(rejection) => return reject(conn, rejection).await,
    };

    match intent {
        Intent::Upload { metadata, password } => {
            handle_upload(conn, registry, metadata, password).await
        }
        Intent::Download { code, password } => {
            handle_download(conn, registry, code, password).await
        }
    }
}

async fn handle_upload<S>(
    mut conn: Connection<S>,
    registry: Arc<Registry<S>>,
    metadata: FileMetadata,
    password: Option<String>,
) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (session, pairing) = Session::upload(metadata.clone(), password);
    let Some(code) = register_session(&registry, session) else {
        warn!("No free code for upload {}", metadata.file_name);
        return reject(conn, Rejection::NoCodeAvailable).await;
    };
    let _guard = SessionGuard::new(registry.clone(), code.clone());

    info!(
        "Registered upload {} ({:?}, {} bytes) under code {}",
        metadata.file_name, metadata.file_type, metadata.file_size, code
    );
    write_message(&mut conn, &ServerMessage::finalize(code.as_str())).await?;

    let mut downloader = tokio::select! {
        paired = pairing => match paired {
            Ok(downloader) => downloader,
            Err(_) => return Ok(HandshakeOutcome::Abandoned { code }),
        },
        closed = wait_for_data_or_close(&mut conn) => match closed {
            Ok(0) => {
                info!("Uploader for {} left before pairing", code);
                return Ok(HandshakeOutcome::Abandoned { code });
            }
            Ok(_) => return reject(conn, Rejection::UnexpectedData).await,
            Err(e) => {
                warn!("Uploader connection for {} failed while waiting: {}", code, e);
                return Ok(HandshakeOutcome::Abandoned { code });
            }
        },
    };

    debug!("Session {} paired, announcing payload", code);
    write_message(&mut downloader, &ServerMessage::piping_complete(&metadata)).await?;

    let stats = relay(conn, downloader).await;
    info!(
        "Session {} finished: {} bytes to downloader, {} bytes back",
        code, stats.uploaded, stats.downloaded
    );
    Ok(HandshakeOutcome::Relayed { code, stats })
}

async fn handle_download<S>(
    mut conn: Connection<S>,
    registry: Arc<Registry<S>>,
    upload_code: String,
    password: Option<String>,
) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Some(session) = registry.lookup(&upload_code) else {
        return reject(conn, Rejection::NotFound).await;
    };
    if session.role != TransferRole::Upload {
        return reject(conn, Rejection::NotFound).await;
    }
    if session.busy {
        return reject(conn, Rejection::Busy).await;
    }
    if let Some(expected) = &session.password {
        let matches = password
            .as_deref()
            .is_some_and(|given| passwords_match(expected, given));
        if !matches {
            return reject(conn, Rejection::PasswordMismatch).await;
        }
    }

    // Every accepted client is answered with a code of its own; the
    // downloader's is never registered or looked up. A full registry still
    // yields an unchecked code.
    let own_code = registry
        .allocate()
        .unwrap_or_else(|| random_code(registry.code_length()));

    let pairing = match registry.mark_busy(&upload_code) {
        Ok(pairing) => pairing,
        Err(MarkBusyError::NotFound) => return reject(conn, Rejection::NotFound).await,
        Err(MarkBusyError::AlreadyBusy) => return reject(conn, Rejection::Busy).await,
    };

    write_message(&mut conn, &ServerMessage::finalize(own_code.as_str())).await?;

    if let Err(conn) = pairing.send(conn) {
        debug!("Uploader for {} went away during pairing", upload_code);
        return reject(conn, Rejection::NotFound).await;
    }

    info!("Downloader paired with session {}", upload_code);
    Ok(HandshakeOutcome::Paired {
        code: own_code,
        upload_code,
    })
}

/// Register under a freshly allocated code, drawing again if another
/// handler claimed the same code in between. `None` once no code is free.
fn register_session<C>(registry: &SessionRegistry<C>, mut session: Session<C>) -> Option<String> {
    loop {
        let code = registry.allocate()?;
        match registry.register(&code, session) {
            Ok(()) => return Some(code),
            Err(returned) => {
                debug!("Code {} taken before registration, retrying", code);
                session = returned;
            }
        }
    }
}

/// Resolve once the peer closes (`Ok(0)`) or sends anything (`Ok(n)`).
/// Received bytes stay buffered.
async fn wait_for_data_or_close<R>(reader: &mut R) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    Ok(reader.fill_buf().await?.len())
}

/// Compare in time that depends only on the lengths of the inputs.
pub fn passwords_match(expected: &str, given: &str) -> bool {
    expected.as_bytes().ct_eq(given.as_bytes()).into()
}

async fn reject<S>(mut conn: Connection<S>, rejection: Rejection) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    info!("Rejecting handshake: {}", rejection);
    if let Err(e) = write_message(&mut conn, &ServerMessage::error(&rejection)).await {
        debug!("Could not deliver rejection: {}", e);
    }
    let _ = conn.shutdown().await;
    Ok(HandshakeOutcome::Rejected(rejection))
}
