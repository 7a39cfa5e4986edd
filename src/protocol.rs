//! Wire messages exchanged between clients and the rendezvous server.
//!
//! Every handshake step is one JSON record terminated by `\n`. After the
//! downloader has seen `PIPING_COMPLETE` it writes the raw `READY` token and
//! from then on the stream carries unframed payload bytes until the sender
//! closes it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Rejection, Result, RiftError};
use crate::MAX_MESSAGE_LEN;

/// Whether the payload is a single file or a zipped directory
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Directory,
}

/// Payload description supplied by the uploader and forwarded to the downloader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub file_name: String,
    pub file_type: FileType,
    pub file_size: u64,
}

/// Intent record as it appears on the wire, before validation.
///
/// All fields are optional here so that a missing field can be reported
/// with its own reason instead of a generic parse failure.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RawIntent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<FileType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_code: Option<String>,
}

/// A validated client intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Upload {
        metadata: FileMetadata,
        password: Option<String>,
    },
    Download {
        code: String,
        password: Option<String>,
    },
}

impl TryFrom<RawIntent> for Intent {
    type Error = Rejection;

    fn try_from(raw: RawIntent) -> std::result::Result<Self, Self::Error> {
        let transfer_type = raw
            .transfer_type
            .ok_or(Rejection::MissingTransferType)?;

        match transfer_type.as_str() {
            "upload" => {
                let (Some(file_name), Some(file_type)) = (raw.file_name, raw.file_type) else {
                    return Err(Rejection::MissingFileMetadata);
                };
                if file_name.is_empty() {
                    return Err(Rejection::MissingFileMetadata);
                }
                Ok(Intent::Upload {
                    metadata: FileMetadata {
                        file_name,
                        file_type,
                        file_size: raw.file_size.unwrap_or(0),
                    },
                    password: raw.password,
                })
            }
            "download" => {
                let code = raw
                    .client_code
                    .map(|c| c.trim().to_ascii_lowercase())
                    .filter(|c| !c.is_empty())
                    .ok_or(Rejection::MissingCode)?;
                Ok(Intent::Download {
                    code,
                    password: raw.password,
                })
            }
            _ => Err(Rejection::UnknownTransferType),
        }
    }
}

/// Decode and validate one intent record.
pub fn parse_intent(line: &str) -> std::result::Result<Intent, Rejection> {
    let raw: RawIntent = serde_json::from_str(line.trim_end()).map_err(|_| Rejection::Malformed)?;
    Intent::try_from(raw)
}

impl From<&Intent> for RawIntent {
    fn from(intent: &Intent) -> Self {
        match intent {
            Intent::Upload { metadata, password } => RawIntent {
                transfer_type: Some("upload".to_string()),
                file_name: Some(metadata.file_name.clone()),
                file_type: Some(metadata.file_type),
                file_size: Some(metadata.file_size),
                password: password.clone(),
                client_code: None,
            },
            Intent::Download { code, password } => RawIntent {
                transfer_type: Some("download".to_string()),
                client_code: Some(code.clone()),
                password: password.clone(),
                ..RawIntent::default()
            },
        }
    }
}

/// Sequenced replies from the server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "seq")]
pub enum Sequence {
    #[serde(rename = "FINALIZE_HANDSHAKE")]
    FinalizeHandshake { code: String },

    #[serde(rename = "PIPING_COMPLETE")]
    PipingComplete {
        #[serde(rename = "fileType")]
        file_type: FileType,
        #[serde(rename = "fileName")]
        file_name: String,
        #[serde(rename = "fileSize")]
        file_size: u64,
    },
}

/// Anything the server may write to a client during the handshake
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ServerMessage {
    Sequence(Sequence),
    Error { error: String },
}

impl ServerMessage {
    pub fn finalize(code: impl Into<String>) -> Self {
        ServerMessage::Sequence(Sequence::FinalizeHandshake { code: code.into() })
    }

    pub fn piping_complete(metadata: &FileMetadata) -> Self {
        ServerMessage::Sequence(Sequence::PipingComplete {
            file_type: metadata.file_type,
            file_name: metadata.file_name.clone(),
            file_size: metadata.file_size,
        })
    }

    pub fn error(rejection: &Rejection) -> Self {
        ServerMessage::Error {
            error: rejection.to_string(),
        }
    }
}

/// Serialize `message` as one newline-terminated record and flush it.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one newline-terminated record, at most `MAX_MESSAGE_LEN` bytes.
///
/// Returns `Ok(None)` when the peer closed the stream before sending
/// anything. Only the bytes of the record are consumed, so whatever follows
/// stays in the reader's buffer.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = match reader.take(MAX_MESSAGE_LEN).read_line(&mut line).await {
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            return Err(RiftError::Protocol("record is not valid UTF-8".to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    if read == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        return Err(RiftError::Protocol(
            "record truncated or longer than the size limit".to_string(),
        ));
    }
    Ok(Some(line))
}

/// Read and decode one record into `T`.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    match read_line(reader).await? {
        Some(line) => Ok(Some(serde_json::from_str(line.trim_end())?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_upload_intent_parses() {
        let intent =
            parse_intent(r#"{"transferType":"upload","fileName":"a.txt","fileType":"file","fileSize":12}"#)
                .unwrap();
        assert_eq!(
            intent,
            Intent::Upload {
                metadata: FileMetadata {
                    file_name: "a.txt".to_string(),
                    file_type: FileType::File,
                    file_size: 12,
                },
                password: None,
            }
        );
    }

    #[test]
    fn test_upload_without_size_defaults_to_zero() {
        let intent =
            parse_intent(r#"{"transferType":"upload","fileName":"dir","fileType":"directory"}"#)
                .unwrap();
        match intent {
            Intent::Upload { metadata, .. } => {
                assert_eq!(metadata.file_size, 0);
                assert_eq!(metadata.file_type, FileType::Directory);
            }
            other => panic!("unexpected intent {:?}", other),
        }
    }

    #[test]
    fn test_missing_fields_are_rejected() {
        assert_eq!(parse_intent("{}"), Err(Rejection::MissingTransferType));
        assert_eq!(
            parse_intent(r#"{"transferType":"upload","fileName":"a.txt"}"#),
            Err(Rejection::MissingFileMetadata)
        );
        assert_eq!(
            parse_intent(r#"{"transferType":"upload","fileType":"file"}"#),
            Err(Rejection::MissingFileMetadata)
        );
        assert_eq!(
            parse_intent(r#"{"transferType":"download"}"#),
            Err(Rejection::MissingCode)
        );
        assert_eq!(
            parse_intent(r#"{"transferType":"sideways"}"#),
            Err(Rejection::UnknownTransferType)
        );
    }

    #[test]
    fn test_bad_file_type_is_malformed() {
        assert_eq!(
            parse_intent(r#"{"transferType":"upload","fileName":"a","fileType":"socket"}"#),
            Err(Rejection::Malformed)
        );
    }

    #[test]
    fn test_download_code_is_normalised() {
        let intent = parse_intent(r#"{"transferType":"download","clientCode":" AbC12 "}"#).unwrap();
        assert_eq!(
            intent,
            Intent::Download {
                code: "abc12".to_string(),
                password: None,
            }
        );
    }

    #[test]
    fn test_server_messages_wire_shape() {
        let finalize = serde_json::to_value(ServerMessage::finalize("ab3de")).unwrap();
        assert_eq!(
            finalize,
            serde_json::json!({"seq": "FINALIZE_HANDSHAKE", "code": "ab3de"})
        );

        let metadata = FileMetadata {
            file_name: "a.txt".to_string(),
            file_type: FileType::File,
            file_size: 3,
        };
        let piping = serde_json::to_value(ServerMessage::piping_complete(&metadata)).unwrap();
        assert_eq!(
            piping,
            serde_json::json!({
                "seq": "PIPING_COMPLETE",
                "fileType": "file",
                "fileName": "a.txt",
                "fileSize": 3
            })
        );

        let error = serde_json::to_value(ServerMessage::error(&Rejection::Busy)).unwrap();
        assert_eq!(error, serde_json::json!({"error": "Download ID busy"}));
    }

    #[test]
    fn test_error_reply_decodes_as_error_variant() {
        let message: ServerMessage =
            serde_json::from_str(r#"{"error":"Download ID not found"}"#).unwrap();
        assert_eq!(
            message,
            ServerMessage::Error {
                error: "Download ID not found".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_read_message_leaves_trailing_bytes_buffered() {
        let data = b"{\"seq\":\"FINALIZE_HANDSHAKE\",\"code\":\"x1y2z\"}\nREADYpayload".to_vec();
        let mut reader = BufReader::new(&data[..]);

        let message: ServerMessage = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(message, ServerMessage::finalize("x1y2z"));

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"READYpayload");
    }

    #[tokio::test]
    async fn test_read_line_on_closed_stream() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_line(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_record_is_protocol_error() {
        let data = vec![b'a'; MAX_MESSAGE_LEN as usize + 10];
        let mut reader = BufReader::new(&data[..]);
        assert!(matches!(
            read_line(&mut reader).await,
            Err(RiftError::Protocol(_))
        ));
    }
}
