//! Remote object stores supporting chunked, resumable uploads.
//!
//! A store exposes the three session endpoints (start, append, finish) plus a
//! single-request upload for artifacts smaller than one chunk. Every failure
//! is classified into a [`RemoteFault`] by the backend, so the uploader's
//! retry policy never inspects transport details.

use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, SubsecRound, Utc};

use crate::config::StoreConfig;
use crate::error::{EngineError, RemoteFault};

mod directory;
mod dropbox;
#[cfg(test)]
pub(crate) mod memory;

pub use directory::DirectoryStore;
pub use dropbox::{classify_response, DropboxStore};

/// Position within an open upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub session_id: String,
    /// Bytes the client believes the session already holds
    pub offset: u64,
}

impl Cursor {
    pub fn new(session_id: String, offset: u64) -> Self {
        Cursor { session_id, offset }
    }
}

/// Commit metadata sent with the final chunk.
///
/// The write mode is always "add": an existing object at `path` is never
/// overwritten and the commit fails instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    /// Destination key
    pub path: String,
    /// Modification time of the local artifact, whole seconds
    pub client_modified: DateTime<Utc>,
}

impl CommitInfo {
    pub fn new(path: impl Into<String>, client_modified: SystemTime) -> Self {
        CommitInfo {
            path: path.into(),
            client_modified: DateTime::<Utc>::from(client_modified).trunc_subsecs(0),
        }
    }
}

/// Metadata of a committed object, as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub path: String,
    pub size: u64,
    /// Dropbox content hash, lower-case hex
    pub content_hash: Option<String>,
    pub server_modified: Option<DateTime<Utc>>,
}

/// A remote store supporting chunked upload sessions.
pub trait ChunkedStore: Send + Sync {
    /// Open a session with its first chunk and return the session id.
    fn start_session(&self, chunk: &[u8]) -> Result<String, RemoteFault>;

    /// Append a chunk at `cursor.offset`.
    ///
    /// # Errors
    /// `RemoteFault::IncorrectOffset` if the session holds a different number
    /// of bytes than `cursor.offset`
    fn append(&self, cursor: &Cursor, chunk: &[u8]) -> Result<(), RemoteFault>;

    /// Append the final chunk and commit the session to `commit.path`.
    fn finish(&self, cursor: &Cursor, chunk: &[u8], commit: &CommitInfo) -> Result<RemoteMetadata, RemoteFault>;

    /// Commit `data` in one request, without a session.
    fn upload(&self, data: &[u8], commit: &CommitInfo) -> Result<RemoteMetadata, RemoteFault>;
}

/// Construct the configured store backend.
///
/// # Errors
/// Returns EngineError::Store if the backend cannot be initialised (missing
/// token, unusable HTTP client, unwritable store root)
pub fn open(config: &StoreConfig) -> Result<Arc<dyn ChunkedStore>, EngineError> {
    match config {
        StoreConfig::Dropbox(dropbox) => Ok(Arc::new(DropboxStore::new(dropbox)?)),
        StoreConfig::Directory(directory) => Ok(Arc::new(DirectoryStore::new(&directory.root)?)),
    }
}
