use std::fs::{self, File};
use std::io::{self, BufRead, Cursor, Write};
use std::path::{Component, Path, PathBuf};

use log::debug;
use walkdir::WalkDir;
use zip::read::ZipArchive;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::error::{Result, RiftError};
use crate::protocol::{FileMetadata, FileType};

/// Payload ready to be streamed to the relay
pub enum StagedPayload {
    /// A regular file, read straight from disk
    File { path: PathBuf, metadata: FileMetadata },
    /// A directory packed into an in-memory zip archive
    Archive { data: Vec<u8>, metadata: FileMetadata },
}

impl StagedPayload {
    pub fn metadata(&self) -> &FileMetadata {
        match self {
            StagedPayload::File { metadata, .. } | StagedPayload::Archive { metadata, .. } => {
                metadata
            }
        }
    }
}

/// Inspect `path` and prepare it for sending.
///
/// Files are sent as they are. Directories are zipped first and announced
/// with `fileType: directory` and the archive's size.
///
/// # Arguments
/// * `path` - File or folder chosen by the user
///
/// # Returns
/// The staged payload together with the metadata to announce, or an error if
/// the path cannot be read or the folder cannot be archived
pub fn stage_payload(path: &Path) -> Result<StagedPayload> {
    let file_name = display_name(path)?;
    let meta = fs::metadata(path)?;

    if meta.is_dir() {
        debug!("Compressing folder: {}", path.display());
        let data = compress_folder(path)?;
        let metadata = generate_metadata(file_name, data.len() as u64, FileType::Directory);
        Ok(StagedPayload::Archive { data, metadata })
    } else {
        debug!("File size: {} bytes", meta.len());
        let metadata = generate_metadata(file_name, meta.len(), FileType::File);
        Ok(StagedPayload::File {
            path: path.to_path_buf(),
            metadata,
        })
    }
}

/// Build the metadata announced to the receiver.
///
/// # Arguments
/// * `file_name` - Base name of the file or folder
/// * `size` - Size in bytes (for folders, this is the compressed zip size)
/// * `file_type` - Whether a single file or a zipped folder is sent
///
/// # Returns
/// FileMetadata carried in the upload intent and in `PIPING_COMPLETE`
pub fn generate_metadata(file_name: String, size: u64, file_type: FileType) -> FileMetadata {
    FileMetadata {
        file_name,
        file_type,
        file_size: size,
    }
}

fn display_name(path: &Path) -> Result<String> {
    let canonical = fs::canonicalize(path)?;
    canonical
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| RiftError::Config(format!("cannot send {}", path.display())))
}

/// Compresses a folder into a zip archive in memory.
///
/// # Process
/// 1. Walks through all subdirectories and files in the folder
/// 2. Adds each entry under its path relative to `folder_path`
/// 3. Stores Unix permissions `0o755` on every entry
///
/// # Arguments
/// * `folder_path` - Path to the folder to compress
///
/// # Returns
/// The zip archive bytes, ready to stream to the relay
pub fn compress_folder(folder_path: &Path) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o755);

    for entry in WalkDir::new(folder_path) {
        let entry = entry?;
        let path = entry.path();

        if path == folder_path {
            continue;
        }

        let relative_path = path
            .strip_prefix(folder_path)
            .map_err(|e| RiftError::Archive(e.to_string()))?;
        let name = relative_path
            .to_str()
            .ok_or_else(|| RiftError::Archive(format!("non UTF-8 path {:?}", relative_path)))?
            .replace('\\', "/");

        if path.is_file() {
            debug!("Adding file: {}", name);
            zip.start_file(name, options)?;
            let mut f = File::open(path)?;
            io::copy(&mut f, &mut zip)?;
        } else if path.is_dir() {
            debug!("Adding directory: {}/", name);
            zip.add_directory(name, options)?;
        }
    }

    Ok(zip.finish()?.into_inner())
}

/// Extract a received archive below `output_path`.
///
/// Entries whose path would leave `output_path` are refused.
///
/// # Arguments
/// * `zip_data` - Complete archive as received from the sender
/// * `output_path` - Directory to extract into, created if missing
///
/// # Returns
/// `RiftError::Archive` for a corrupt archive or an unsafe entry path
pub fn unpack_directory(zip_data: &[u8], output_path: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(Cursor::new(zip_data))?;
    fs::create_dir_all(output_path)?;

    debug!("Extracting {} files/folders...", archive.len());

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let relative = file
            .enclosed_name()
            .ok_or_else(|| RiftError::Archive(format!("unsafe entry path {}", file.name())))?;
        let outpath = output_path.join(relative);

        if file.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&outpath)?;
            io::copy(&mut file, &mut outfile)?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = file.unix_mode() {
                fs::set_permissions(&outpath, fs::Permissions::from_mode(mode))?;
            }
        }
    }

    Ok(())
}

/// Where a received payload named `file_name` is written inside `dir`.
///
/// Only the last normal component of the peer-supplied name is used, and an
/// existing entry is never overwritten: `name`, `name (1)`, `name (2)`, ...
pub fn output_path(dir: &Path, file_name: &str) -> PathBuf {
    let base = Path::new(file_name)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .last()
        .filter(|s| !s.is_empty())
        .unwrap_or("received");

    let candidate = dir.join(base);
    if !candidate.exists() {
        return candidate;
    }
    (1..)
        .map(|i| dir.join(format!("{} ({})", base, i)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Ask on stdin for the code shown on the sending machine.
pub fn prompt_code() -> Result<String> {
    print!("Enter the code shown by the sender: ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().lock().read_line(&mut input)?;

    let code = input.trim().to_ascii_lowercase();
    if code.is_empty() {
        return Err(RiftError::Config("no code entered".to_string()));
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_metadata_file() {
        let metadata = generate_metadata("test.txt".to_string(), 1024, FileType::File);
        assert_eq!(metadata.file_name, "test.txt");
        assert_eq!(metadata.file_size, 1024);
        assert_eq!(metadata.file_type, FileType::File);
    }

    #[test]
    fn test_stage_file_uses_base_name_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        fs::write(&path, vec![1u8; 300]).unwrap();

        let staged = stage_payload(&path).unwrap();
        assert!(matches!(staged, StagedPayload::File { .. }));
        assert_eq!(staged.metadata().file_name, "report.pdf");
        assert_eq!(staged.metadata().file_size, 300);
        assert_eq!(staged.metadata().file_type, FileType::File);
    }

    #[test]
    fn test_stage_directory_is_archived() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("photos");
        fs::create_dir_all(folder.join("2024")).unwrap();
        fs::write(folder.join("2024/a.jpg"), b"jpeg").unwrap();

        let staged = stage_payload(&folder).unwrap();
        match &staged {
            StagedPayload::Archive { data, metadata } => {
                assert_eq!(metadata.file_name, "photos");
                assert_eq!(metadata.file_type, FileType::Directory);
                assert_eq!(metadata.file_size, data.len() as u64);
            }
            StagedPayload::File { .. } => panic!("directory staged as a file"),
        }
    }

    #[test]
    fn test_stage_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(stage_payload(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_compress_unpack_keeps_structure() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        fs::create_dir_all(source.join("data/nested")).unwrap();
        fs::create_dir_all(source.join("empty")).unwrap();
        fs::write(source.join("readme.txt"), b"This is the readme file").unwrap();
        fs::write(source.join("data/data.bin"), [0xAA; 1000]).unwrap();
        fs::write(source.join("data/nested/nested.txt"), b"Nested file content").unwrap();

        let archive = compress_folder(&source).unwrap();
        let dest = dir.path().join("dest");
        unpack_directory(&archive, &dest).unwrap();

        assert_eq!(
            fs::read_to_string(dest.join("readme.txt")).unwrap(),
            "This is the readme file"
        );
        let data = fs::read(dest.join("data/data.bin")).unwrap();
        assert_eq!(data.len(), 1000);
        assert!(data.iter().all(|&b| b == 0xAA));
        assert_eq!(
            fs::read_to_string(dest.join("data/nested/nested.txt")).unwrap(),
            "Nested file content"
        );
        assert!(dest.join("empty").is_dir());
    }

    #[test]
    fn test_unpack_refuses_escaping_entries() {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("../evil.txt", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"x").unwrap();
        let data = zip.finish().unwrap().into_inner();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dest");
        assert!(matches!(
            unpack_directory(&data, &dest),
            Err(RiftError::Archive(_))
        ));
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn test_unpack_garbage_is_archive_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            unpack_directory(b"definitely not a zip", dir.path()),
            Err(RiftError::Archive(_))
        ));
    }

    #[test]
    fn test_output_path_strips_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(output_path(dir.path(), "a.txt"), dir.path().join("a.txt"));
        assert_eq!(
            output_path(dir.path(), "../../etc/passwd"),
            dir.path().join("passwd")
        );
        assert_eq!(output_path(dir.path(), "/"), dir.path().join("received"));
        assert_eq!(output_path(dir.path(), ".."), dir.path().join("received"));
    }

    #[test]
    fn test_output_path_avoids_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"old").unwrap();
        fs::write(dir.path().join("a.txt (1)"), b"old").unwrap();
        assert_eq!(
            output_path(dir.path(), "a.txt"),
            dir.path().join("a.txt (2)")
        );
    }
}
