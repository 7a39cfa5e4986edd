//! Full-duplex byte relay between a paired uploader and downloader.
//!
//! Each direction runs in its own task as a bounded copy loop: one chunk is
//! read, written out completely, and only then is the next chunk read. A slow
//! destination therefore stalls reads from its source instead of growing a
//! buffer.

use log::{debug, trace, warn};
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::CHUNK_SIZE;

/// Bytes moved in each direction once the relay has ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub uploaded: u64,
    pub downloaded: u64,
}

/// Relay bytes between `uploader` and `downloader` until both directions
/// have finished.
///
/// A direction ending with EOF half-closes its destination and leaves the
/// other direction running. A direction failing with an I/O error tears the
/// other one down as well.
pub async fn relay<U, D>(uploader: U, downloader: D) -> RelayStats
where
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    D: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (up_read, up_write) = split(uploader);
    let (down_read, down_write) = split(downloader);

    let mut upstream = tokio::spawn(copy_direction(up_read, down_write, "uploader->downloader"));
    let mut downstream = tokio::spawn(copy_direction(down_read, up_write, "downloader->uploader"));

    let mut stats = RelayStats::default();

    tokio::select! {
        result = &mut upstream => {
            match flatten(result) {
                Ok(n) => {
                    stats.uploaded = n;
                    stats.downloaded = flatten(downstream.await).unwrap_or(0);
                }
                Err(_) => downstream.abort(),
            }
        }
        result = &mut downstream => {
            match flatten(result) {
                Ok(n) => {
                    stats.downloaded = n;
                    stats.uploaded = flatten(upstream.await).unwrap_or(0);
                }
                Err(_) => upstream.abort(),
            }
        }
    }

    debug!(
        "Relay finished: {} bytes up, {} bytes down",
        stats.uploaded, stats.downloaded
    );
    stats
}

fn flatten(
    result: Result<std::io::Result<u64>, tokio::task::JoinError>,
) -> std::io::Result<u64> {
    result.map_err(std::io::Error::other)?
}

/// Copy `reader` into `writer` one chunk at a time, then shut `writer` down.
pub async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    direction: &'static str,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total_bytes = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("{}: read failed after {} bytes: {}", direction, total_bytes, e);
                return Err(e);
            }
        };

        trace!("{}: {} bytes", direction, n);
        if let Err(e) = writer.write_all(&buf[..n]).await {
            warn!("{}: write failed after {} bytes: {}", direction, total_bytes, e);
            return Err(e);
        }
        writer.flush().await?;
        total_bytes += n as u64;
    }

    debug!("{}: EOF after {} bytes", direction, total_bytes);
    let _ = writer.shutdown().await;

    Ok(total_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relay_forwards_both_directions() {
        let (mut uploader, uploader_server) = duplex(1024);
        let (mut downloader, downloader_server) = duplex(1024);

        let relay_task = tokio::spawn(relay(uploader_server, downloader_server));

        downloader.write_all(b"READY").await.unwrap();
        let mut ready = [0u8; 5];
        uploader.read_exact(&mut ready).await.unwrap();
        assert_eq!(&ready, b"READY");

        uploader.write_all(b"hello, world").await.unwrap();
        uploader.shutdown().await.unwrap();

        let mut received = Vec::new();
        downloader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello, world");

        downloader.shutdown().await.unwrap();
        let stats = relay_task.await.unwrap();
        assert_eq!(stats.uploaded, 12);
        assert_eq!(stats.downloaded, 5);
    }

    #[tokio::test]
    async fn test_relay_preserves_bytes_with_slow_reader() {
        // Tiny duplex buffers force the relay to wait on every write.
        let (mut uploader, uploader_server) = duplex(64);
        let (mut downloader, downloader_server) = duplex(64);

        let relay_task = tokio::spawn(relay(uploader_server, downloader_server));

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            for chunk in payload.chunks(4096) {
                uploader.write_all(chunk).await.unwrap();
            }
            uploader.shutdown().await.unwrap();
            uploader
        });

        let mut received = Vec::new();
        let mut buf = [0u8; 37];
        loop {
            let n = downloader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
            if received.len() % 3700 == 0 {
                tokio::task::yield_now().await;
            }
        }
        assert_eq!(received, expected);

        let _uploader = writer.await.unwrap();
        drop(downloader);
        let stats = relay_task.await.unwrap();
        assert_eq!(stats.uploaded, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_relay_ends_when_both_sides_close() {
        let (uploader, uploader_server) = duplex(64);
        let (downloader, downloader_server) = duplex(64);
        let relay_task = tokio::spawn(relay(uploader_server, downloader_server));

        drop(uploader);
        drop(downloader);

        let stats = relay_task.await.unwrap();
        assert_eq!(stats, RelayStats::default());
    }

    #[tokio::test]
    async fn test_copy_direction_counts_bytes() {
        let data = vec![7u8; CHUNK_SIZE * 3 + 5];
        let mut out = Vec::new();
        let n = copy_direction(&data[..], &mut out, "test").await.unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
    }
}
