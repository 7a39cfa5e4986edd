//! Client side of the rendezvous handshake.
//!
//! Upload:   `Init -> SentIntent -> HaveCode -> AwaitReady -> Transferring -> Done`
//! Download: `Init -> SentIntent -> HaveCode -> AwaitPairingComplete -> ReadySent -> Receiving -> Done`
//!
//! Anything arriving out of order, or an `{"error": ...}` record, ends the
//! exchange with an error; there is no reconnect.

use log::debug;
use tokio::io::{
    AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

use crate::error::{Result, RiftError};
use crate::protocol::{read_message, write_message, FileMetadata, Intent, RawIntent, Sequence, ServerMessage};
use crate::{CHUNK_SIZE, READY_TOKEN};

/// Sink for human-readable status lines and transfer progress
pub trait Notifier: Send + Sync {
    fn status(&self, line: &str);

    /// Called once the payload size is known and transfer begins
    fn transfer_started(&self, _total_bytes: u64) {}

    /// Called after each chunk with the running byte count
    fn progress(&self, _bytes: u64) {}

    fn transfer_finished(&self) {}
}

/// Notifier that only logs
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn status(&self, line: &str) {
        log::info!("{}", line);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Init,
    SentIntent,
    HaveCode,
    AwaitReady,
    Transferring,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Init,
    SentIntent,
    HaveCode,
    AwaitPairingComplete,
    ReadySent,
    Receiving,
    Done,
}

/// Result of a finished upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub code: String,
    pub bytes_sent: u64,
}

/// Result of a finished download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub metadata: FileMetadata,
    pub bytes_received: u64,
}

/// Drives the uploader's side of one transfer over `stream`
pub struct Uploader<S> {
    conn: BufReader<S>,
    state: UploadState,
}

impl<S> Uploader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Uploader {
            conn: BufReader::new(stream),
            state: UploadState::Init,
        }
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    fn advance(&mut self, next: UploadState) {
        debug!("upload: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Send the intent and wait for the server to issue a code.
    pub async fn register(
        &mut self,
        metadata: &FileMetadata,
        password: Option<String>,
    ) -> Result<String> {
        expect_state(self.state, UploadState::Init)?;
        let intent = Intent::Upload {
            metadata: metadata.clone(),
            password,
        };
        write_message(&mut self.conn, &RawIntent::from(&intent)).await?;
        self.advance(UploadState::SentIntent);

        let code = expect_finalize(&mut self.conn).await?;
        self.advance(UploadState::HaveCode);
        Ok(code)
    }

    /// Block until the paired downloader announces it is ready.
    pub async fn wait_for_ready(&mut self) -> Result<()> {
        expect_state(self.state, UploadState::HaveCode)?;
        self.advance(UploadState::AwaitReady);

        let mut token = [0u8; READY_TOKEN.len()];
        match self.conn.read_exact(&mut token).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(RiftError::Protocol(
                    "server closed the connection before a downloader was ready".to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        }

        if &token[..] != READY_TOKEN {
            // The server may have rejected us after all; surface its reason.
            let mut rest = Vec::new();
            let _ = (&mut self.conn).take(4096).read_to_end(&mut rest).await;
            let mut record = token.to_vec();
            record.extend_from_slice(&rest);
            if let Ok(ServerMessage::Error { error }) =
                serde_json::from_slice::<ServerMessage>(trim_newline(&record))
            {
                return Err(RiftError::Server(error));
            }
            return Err(RiftError::Protocol(format!(
                "expected READY, got {:?}",
                String::from_utf8_lossy(&token)
            )));
        }
        self.advance(UploadState::Transferring);
        Ok(())
    }

    /// Stream `payload` to the downloader, close our side, and wait for the
    /// server to close the connection once the downloader is done.
    pub async fn send_payload<R>(&mut self, mut payload: R, notifier: &dyn Notifier) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        expect_state(self.state, UploadState::Transferring)?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut sent = 0u64;
        loop {
            let n = payload.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.conn.write_all(&buf[..n]).await?;
            sent += n as u64;
            notifier.progress(sent);
        }
        self.conn.flush().await?;
        self.conn.shutdown().await?;

        // Anything the downloader sends back after READY is not part of the
        // protocol; drain until the relay closes our connection. A reset here
        // means the relay was torn down before the downloader finished.
        let mut sink = tokio::io::sink();
        match tokio::io::copy(&mut self.conn, &mut sink).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {}
            Err(e) => {
                debug!("upload: connection failed after {} bytes: {}", sent, e);
                return Err(e.into());
            }
        }

        self.advance(UploadState::Done);
        Ok(sent)
    }
}

/// Run a complete upload: register, report the code, wait, send.
///
/// # Arguments
/// * `stream` - Established connection to the rendezvous server
/// * `metadata` - Announced name, type and size of the payload
/// * `password` - Optional password the downloader must present
/// * `payload` - Source of the bytes to send
/// * `notifier` - Receives the code, status lines and progress
///
/// # Returns
/// The issued code and the number of bytes sent, once the server has closed
/// the connection after the downloader finished
pub async fn upload<S, R>(
    stream: S,
    metadata: &FileMetadata,
    password: Option<String>,
    payload: R,
    notifier: &dyn Notifier,
) -> Result<UploadReport>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut uploader = Uploader::new(stream);

    let code = uploader.register(metadata, password).await?;
    notifier.status(&format!("Code: {}", code));
    notifier.status("Waiting for the receiver to connect...");

    uploader.wait_for_ready().await?;
    notifier.status(&format!("Receiver ready, sending {}", metadata.file_name));
    notifier.transfer_started(metadata.file_size);

    let bytes_sent = uploader.send_payload(payload, notifier).await?;
    notifier.transfer_finished();
    notifier.status("Transfer complete!");

    Ok(UploadReport { code, bytes_sent })
}

/// Drives the downloader's side of one transfer over `stream`
pub struct Downloader<S> {
    conn: BufReader<S>,
    state: DownloadState,
}

impl<S> Downloader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Downloader {
            conn: BufReader::new(stream),
            state: DownloadState::Init,
        }
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    fn advance(&mut self, next: DownloadState) {
        debug!("download: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Ask to join the session behind `code`. Returns the code the server
    /// assigned to this client.
    pub async fn join(&mut self, code: &str, password: Option<String>) -> Result<String> {
        expect_state(self.state, DownloadState::Init)?;
        let intent = Intent::Download {
            code: code.to_string(),
            password,
        };
        write_message(&mut self.conn, &RawIntent::from(&intent)).await?;
        self.advance(DownloadState::SentIntent);

        let own_code = expect_finalize(&mut self.conn).await?;
        self.advance(DownloadState::HaveCode);
        Ok(own_code)
    }

    /// Wait for the server to confirm pairing and describe the payload.
    pub async fn await_pairing(&mut self) -> Result<FileMetadata> {
        expect_state(self.state, DownloadState::HaveCode)?;
        self.advance(DownloadState::AwaitPairingComplete);

        match next_message(&mut self.conn).await? {
            Sequence::PipingComplete {
                file_type,
                file_name,
                file_size,
            } => Ok(FileMetadata {
                file_name,
                file_type,
                file_size,
            }),
            other => Err(RiftError::Protocol(format!(
                "expected PIPING_COMPLETE, got {:?}",
                other
            ))),
        }
    }

    /// Tell the uploader we can receive.
    pub async fn send_ready(&mut self) -> Result<()> {
        expect_state(self.state, DownloadState::AwaitPairingComplete)?;
        self.conn.write_all(READY_TOKEN).await?;
        self.conn.flush().await?;
        self.advance(DownloadState::ReadySent);
        Ok(())
    }

    /// Copy payload bytes into `sink` until the uploader closes.
    pub async fn receive_payload<W>(
        &mut self,
        mut sink: W,
        expected: u64,
        notifier: &dyn Notifier,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        expect_state(self.state, DownloadState::ReadySent)?;
        self.advance(DownloadState::Receiving);

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut received = 0u64;
        loop {
            let n = match self.conn.read(&mut buf).await {
                Ok(n) => n,
                // Peers that drop the TCP connection without a TLS
                // close_notify still delivered everything they sent.
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => 0,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n]).await?;
            received += n as u64;
            notifier.progress(received);
        }
        sink.flush().await?;
        let _ = self.conn.shutdown().await;

        if received < expected {
            return Err(RiftError::Incomplete { received, expected });
        }
        self.advance(DownloadState::Done);
        Ok(received)
    }
}

/// Run a complete download of the session behind `code` into `sink`.
///
/// # Arguments
/// * `stream` - Established connection to the rendezvous server
/// * `code` - Code shown by the sender
/// * `password` - Password set by the sender, if any
/// * `sink` - Destination for the payload bytes
/// * `notifier` - Receives status lines and progress
///
/// # Returns
/// The announced metadata and the byte count, or `RiftError::Incomplete` if
/// the sender closed before the announced size arrived
pub async fn download<S, W>(
    stream: S,
    code: &str,
    password: Option<String>,
    sink: W,
    notifier: &dyn Notifier,
) -> Result<DownloadReport>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut downloader = Downloader::new(stream);

    downloader.join(code, password).await?;
    notifier.status("Connected, waiting for the sender...");

    let metadata = downloader.await_pairing().await?;
    notifier.status(&format!(
        "Receiving {} ({} bytes)",
        metadata.file_name, metadata.file_size
    ));

    downloader.send_ready().await?;
    notifier.transfer_started(metadata.file_size);

    let bytes_received = downloader
        .receive_payload(sink, metadata.file_size, notifier)
        .await?;
    notifier.transfer_finished();

    Ok(DownloadReport {
        metadata,
        bytes_received,
    })
}

fn expect_state<T: PartialEq + std::fmt::Debug>(current: T, expected: T) -> Result<()> {
    if current != expected {
        return Err(RiftError::Protocol(format!(
            "operation not valid in state {:?}, expected {:?}",
            current, expected
        )));
    }
    Ok(())
}

async fn next_message<R>(reader: &mut R) -> Result<Sequence>
where
    R: AsyncBufRead + Unpin,
{
    match read_message::<_, ServerMessage>(reader).await? {
        Some(ServerMessage::Sequence(sequence)) => Ok(sequence),
        Some(ServerMessage::Error { error }) => Err(RiftError::Server(error)),
        None => Err(RiftError::Protocol(
            "server closed the connection during the handshake".to_string(),
        )),
    }
}

async fn expect_finalize<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    match next_message(reader).await? {
        Sequence::FinalizeHandshake { code } => Ok(code),
        other => Err(RiftError::Protocol(format!(
            "expected FINALIZE_HANDSHAKE, got {:?}",
            other
        ))),
    }
}

fn trim_newline(bytes: &[u8]) -> &[u8] {
    match bytes.iter().rposition(|b| *b == b'}') {
        Some(end) => &bytes[..=end],
        None => bytes,
    }
}
