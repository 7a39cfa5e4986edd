pub mod bytes;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod handshake;
pub mod networking;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod tls;

pub use error::{Rejection, Result, RiftError};

/// Port the rendezvous server listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 9966;
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_CODE_LENGTH: usize = 5;

/// Characters a rendezvous code is drawn from.
pub const CODE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Size of a single read in the relay and payload copy loops.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Upper bound on one framed handshake record, newline included.
pub const MAX_MESSAGE_LEN: u64 = 64 * 1024;

/// Raw token the downloader writes once it is able to receive payload bytes.
pub const READY_TOKEN: &[u8] = b"READY";
