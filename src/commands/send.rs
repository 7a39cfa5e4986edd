use std::io::Cursor;
use std::path::Path;

use log::debug;

use crate::bytes::{stage_payload, StagedPayload};
use crate::client::{upload, UploadReport};
use crate::commands::ProgressNotifier;
use crate::config::ClientConfig;
use crate::error::{Result, RiftError};
use crate::networking::establish_connection;

/// Send the file or folder at `file_path`:
///     - Stage the payload (folders are zipped in memory)
///     - Connect to the rendezvous server and register the upload
///     - Print the code for the receiver
///     - Stream the payload once the receiver is ready
pub async fn run(
    file_path: &Path,
    password: Option<String>,
    config: &ClientConfig,
) -> Result<UploadReport> {
    if !file_path.exists() {
        return Err(RiftError::Config(format!(
            "Path does not exist: {}",
            file_path.display()
        )));
    }

    let notifier = ProgressNotifier::new();
    let staged = stage_payload(file_path)?;
    let metadata = staged.metadata().clone();
    debug!(
        "Staged {} ({:?}, {} bytes)",
        metadata.file_name, metadata.file_type, metadata.file_size
    );

    let stream = establish_connection(config).await?;

    let report = match staged {
        StagedPayload::File { path, .. } => {
            let file = tokio::fs::File::open(&path).await?;
            upload(stream, &metadata, password, file, &notifier).await?
        }
        StagedPayload::Archive { data, .. } => {
            upload(stream, &metadata, password, Cursor::new(data), &notifier).await?
        }
    };

    debug!(
        "Upload under code {} finished: {} bytes",
        report.code, report.bytes_sent
    );
    Ok(report)
}
