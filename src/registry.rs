//! In-memory registry of upload sessions waiting for, or engaged in, a transfer.
//!
//! Each entry is keyed by the rendezvous code handed to the uploader. The
//! uploader's connection itself stays with the task that accepted it; the
//! registry only keeps the one-shot channel through which a paired
//! downloader connection is delivered to that task.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};
use rand::Rng;
use tokio::sync::oneshot;

use crate::protocol::FileMetadata;
use crate::CODE_ALPHABET;

/// Random draws `allocate` makes before giving up on a crowded code space
pub const MAX_DRAWS: usize = 4096;

/// Role the session owner declared in its intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRole {
    Upload,
    Download,
}

/// A registered session. `C` is the connection type handed over on pairing.
pub struct Session<C> {
    pub role: TransferRole,
    pub metadata: FileMetadata,
    pub password: Option<String>,
    busy: bool,
    pairing: Option<oneshot::Sender<C>>,
}

impl<C> Session<C> {
    /// New, not yet busy upload session. The receiver side of the returned
    /// channel yields the downloader's connection once one is paired.
    pub fn upload(
        metadata: FileMetadata,
        password: Option<String>,
    ) -> (Self, oneshot::Receiver<C>) {
        Self::with_role(TransferRole::Upload, metadata, password)
    }

    pub fn with_role(
        role: TransferRole,
        metadata: FileMetadata,
        password: Option<String>,
    ) -> (Self, oneshot::Receiver<C>) {
        let (tx, rx) = oneshot::channel();
        let session = Session {
            role,
            metadata,
            password,
            busy: false,
            pairing: Some(tx),
        };
        (session, rx)
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }
}

/// Copy of the session fields a handler needs to validate a download request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub role: TransferRole,
    pub metadata: FileMetadata,
    pub password: Option<String>,
    pub busy: bool,
}

/// Why `mark_busy` did not hand out the pairing channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkBusyError {
    NotFound,
    AlreadyBusy,
}

/// Code to session mapping shared by every connection handler.
///
/// All operations take the lock for a single map operation and never
/// across an `.await`.
pub struct SessionRegistry<C> {
    sessions: Mutex<HashMap<String, Session<C>>>,
    code_length: usize,
}

impl<C> SessionRegistry<C> {
    pub fn new(code_length: usize) -> Self {
        SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
            code_length,
        }
    }

    /// Length of the codes this registry hands out.
    pub fn code_length(&self) -> usize {
        self.code_length
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Session<C>>> {
        // Every critical section is a single HashMap call.
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Generate a code of the configured length that is not held by any
    /// session at this instant.
    ///
    /// # Returns
    /// `None` when every code of that length is taken, or when no free code
    /// turned up within `MAX_DRAWS` attempts. The lock is released either way.
    pub fn allocate(&self) -> Option<String> {
        self.allocate_with_length(self.code_length)
    }

    /// Same as [`allocate`](Self::allocate) for an explicit `length`.
    pub fn allocate_with_length(&self, length: usize) -> Option<String> {
        let sessions = self.sessions();
        if sessions.len() >= code_space(length) {
            debug!("All {}-character codes are in use", length);
            return None;
        }
        for _ in 0..MAX_DRAWS {
            let code = random_code(length);
            if !sessions.contains_key(&code) {
                return Some(code);
            }
            debug!("Code collision on {}, drawing again", code);
        }
        warn!(
            "No free {}-character code after {} draws ({} sessions)",
            length,
            MAX_DRAWS,
            sessions.len()
        );
        None
    }

    /// Insert `session` under `code`.
    ///
    /// # Arguments
    /// * `code` - Code obtained from [`allocate`](Self::allocate)
    /// * `session` - Session to own the code until released
    ///
    /// # Returns
    /// `Err(session)`, handing the session back, if another handler
    /// registered the same code first
    pub fn register(&self, code: &str, session: Session<C>) -> Result<(), Session<C>> {
        match self.sessions().entry(code.to_string()) {
            Entry::Vacant(e) => {
                e.insert(session);
                Ok(())
            }
            Entry::Occupied(_) => Err(session),
        }
    }

    /// Snapshot of the session registered under `code`.
    ///
    /// # Arguments
    /// * `code` - Normalised (lower-case) rendezvous code
    ///
    /// # Returns
    /// A copy of the fields needed to validate a download request, or `None`
    /// if nothing is registered under `code`. The pairing channel is not part
    /// of the snapshot; use [`mark_busy`](Self::mark_busy) to claim it.
    pub fn lookup(&self, code: &str) -> Option<SessionInfo> {
        self.sessions().get(code).map(|s| SessionInfo {
            role: s.role,
            metadata: s.metadata.clone(),
            password: s.password.clone(),
            busy: s.busy,
        })
    }

    /// Flip `busy` from false to true. Only the first caller succeeds and
    /// receives the channel for delivering its connection to the uploader.
    ///
    /// # Returns
    /// * `Ok(sender)` - This caller won the session
    /// * `Err(MarkBusyError::AlreadyBusy)` - Another downloader got there first
    /// * `Err(MarkBusyError::NotFound)` - The code was released in the meantime
    pub fn mark_busy(&self, code: &str) -> Result<oneshot::Sender<C>, MarkBusyError> {
        let mut sessions = self.sessions();
        let session = sessions.get_mut(code).ok_or(MarkBusyError::NotFound)?;
        if session.busy {
            return Err(MarkBusyError::AlreadyBusy);
        }
        session.busy = true;
        session.pairing.take().ok_or(MarkBusyError::AlreadyBusy)
    }

    /// Remove the session for `code` if it is still present.
    pub fn release(&self, code: &str) -> bool {
        let removed = self.sessions().remove(code).is_some();
        if removed {
            debug!("Released code {}", code);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its code from the registry when dropped, whichever way the
/// owning connection's task ends.
pub struct SessionGuard<C> {
    registry: Arc<SessionRegistry<C>>,
    code: String,
}

impl<C> SessionGuard<C> {
    pub fn new(registry: Arc<SessionRegistry<C>>, code: String) -> Self {
        SessionGuard { registry, code }
    }

    pub fn code(&self) -> &str {
        &self.code
    }
}

impl<C> Drop for SessionGuard<C> {
    fn drop(&mut self) {
        self.registry.release(&self.code);
    }
}

/// Number of distinct codes of `length` characters, saturating at `usize::MAX`.
fn code_space(length: usize) -> usize {
    u32::try_from(length)
        .ok()
        .and_then(|exp| CODE_ALPHABET.len().checked_pow(exp))
        .unwrap_or(usize::MAX)
}

/// Random code of `length` characters drawn from `CODE_ALPHABET`, with no
/// uniqueness check.
pub fn random_code(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}
