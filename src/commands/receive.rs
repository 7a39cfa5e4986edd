use std::path::{Path, PathBuf};

use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};

use crate::bytes::{output_path, prompt_code, unpack_directory};
use crate::client::{Downloader, Notifier};
use crate::commands::ProgressNotifier;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::networking::establish_connection;
use crate::protocol::FileType;

/// Receive the payload behind `code` into `output_dir`, prompting for the
/// code when none is given. Returns where the payload was written.
pub async fn run(
    code: Option<String>,
    password: Option<String>,
    output_dir: &Path,
    config: &ClientConfig,
) -> Result<PathBuf> {
    debug!("Starting receive command");

    let code = match code {
        Some(c) => {
            debug!("Using code from command line");
            c.trim().to_ascii_lowercase()
        }
        None => prompt_code()?,
    };

    let stream = establish_connection(config).await?;
    let notifier = ProgressNotifier::new();
    receive_into(stream, &code, password, output_dir, &notifier).await
}

/// Download over an established stream. Files are streamed to disk;
/// folders are collected in memory and unpacked once complete.
pub async fn receive_into<S>(
    stream: S,
    code: &str,
    password: Option<String>,
    output_dir: &Path,
    notifier: &dyn Notifier,
) -> Result<PathBuf>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut downloader = Downloader::new(stream);

    downloader.join(code, password).await?;
    notifier.status("Connected, waiting for the sender...");

    let metadata = downloader.await_pairing().await?;
    notifier.status(&format!(
        "Receiving {} ({} bytes)",
        metadata.file_name, metadata.file_size
    ));

    tokio::fs::create_dir_all(output_dir).await?;
    let target = output_path(output_dir, &metadata.file_name);

    downloader.send_ready().await?;
    notifier.transfer_started(metadata.file_size);

    match metadata.file_type {
        FileType::File => {
            debug!("Writing to file: {}", target.display());
            let file = tokio::fs::File::create(&target).await?;
            let mut writer = BufWriter::new(file);
            let received = downloader
                .receive_payload(&mut writer, metadata.file_size, notifier)
                .await;
            if received.is_err() {
                drop(writer);
                let _ = tokio::fs::remove_file(&target).await;
            } else {
                writer.flush().await?;
            }
            received?;
        }
        FileType::Directory => {
            let mut zip_data = Vec::with_capacity(metadata.file_size.min(1 << 26) as usize);
            downloader
                .receive_payload(&mut zip_data, metadata.file_size, notifier)
                .await?;
            debug!("Collected {} bytes of zip data", zip_data.len());

            let dest = target.clone();
            tokio::task::spawn_blocking(move || unpack_directory(&zip_data, &dest))
                .await
                .map_err(std::io::Error::other)??;
        }
    }

    notifier.transfer_finished();
    info!("Saved {}", target.display());
    notifier.status(&format!("Saved: {}", target.display()));
    Ok(target)
}
