//! Error types for riftgate

use thiserror::Error;

use crate::tls::TlsError;

/// Why the server refused a handshake.
///
/// The `Display` output is the exact line sent to the client in the
/// `{"error": ...}` reply, so it never carries internal state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("Invalid handshake message")]
    Malformed,

    #[error("Missing transfer type")]
    MissingTransferType,

    #[error("Unknown transfer type")]
    UnknownTransferType,

    #[error("Missing file name or file type")]
    MissingFileMetadata,

    #[error("Missing download ID")]
    MissingCode,

    /// Also used when the code belongs to something other than an upload,
    /// so the two cases cannot be told apart from the outside.
    #[error("Download ID not found")]
    NotFound,

    #[error("Download ID busy")]
    Busy,

    #[error("Password mismatch")]
    PasswordMismatch,

    #[error("Unexpected data before pairing")]
    UnexpectedData,

    #[error("No download ID available")]
    NoCodeAvailable,
}

/// Main error type for riftgate
#[derive(Error, Debug)]
pub enum RiftError {
    /// I/O error (network, file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Message out of sequence or not parseable
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server replied with an `{"error": ...}` record
    #[error("Server error: {0}")]
    Server(String),

    /// Peer closed before the announced size arrived
    #[error("Transfer incomplete: received {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },

    /// Packing or unpacking a directory failed
    #[error("Archive error: {0}")]
    Archive(String),
}

/// Result type alias for RiftError
pub type Result<T> = std::result::Result<T, RiftError>;

impl From<serde_json::Error> for RiftError {
    fn from(err: serde_json::Error) -> Self {
        RiftError::Protocol(err.to_string())
    }
}

impl From<zip::result::ZipError> for RiftError {
    fn from(err: zip::result::ZipError) -> Self {
        RiftError::Archive(err.to_string())
    }
}

impl From<walkdir::Error> for RiftError {
    fn from(err: walkdir::Error) -> Self {
        RiftError::Archive(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_messages_match_wire_text() {
        assert_eq!(Rejection::NotFound.to_string(), "Download ID not found");
        assert_eq!(Rejection::Busy.to_string(), "Download ID busy");
        assert_eq!(Rejection::PasswordMismatch.to_string(), "Password mismatch");
    }

    #[test]
    fn test_incomplete_display() {
        let err = RiftError::Incomplete {
            received: 10,
            expected: 20,
        };
        assert_eq!(
            err.to_string(),
            "Transfer incomplete: received 10 of 20 bytes"
        );
    }

    #[test]
    fn test_no_code_available_message() {
        assert_eq!(
            Rejection::NoCodeAvailable.to_string(),
            "No download ID available"
        );
    }
}
