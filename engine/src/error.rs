//! Error types for the ingest engine.
//!
//! The primary run-level error is `EngineError`, which prevents an ingest run
//! from starting or finishing. File-level faults never abort a run: they are
//! recorded on the failing `FileTask` as a `TaskFault` and the traversal moves
//! on to the next entry.
//!
//! Remote store responses are classified into the closed `RemoteFault` set;
//! the uploader's retry policy is a `match` over those four variants.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that prevent an ingest run from being executed.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Input root does not exist
    #[error("Input root not found: {}", path.display())]
    RootNotFound { path: PathBuf },

    /// Input root exists but is not a directory
    #[error("Input root is not a directory: {}", path.display())]
    RootNotDirectory { path: PathBuf },

    /// Input root cannot be inspected (permissions, I/O)
    #[error("Input root is not accessible: {}", path.display())]
    RootAccessDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Configuration could not be loaded or is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Remote store client could not be constructed
    #[error("Failed to open remote store: {reason}")]
    Store { reason: String },

    /// A pipeline worker thread panicked
    #[error("Pipeline worker panicked")]
    WorkerPanicked,
}

/// Errors raised while loading or validating the startup configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Invalid recipient key: {0}")]
    Key(String),

    #[error("Failed to prepare directory {}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A single entry of the input tree could not be visited or pruned.
///
/// Traversal faults are logged and collected in the run report; they never
/// stop the walk.
#[derive(Debug, Clone, Error)]
#[error("Failed to visit {}: {message}", path.display())]
pub struct TraversalFault {
    pub path: PathBuf,
    pub message: String,
}

/// Failure moving a discovered file into the working area.
#[derive(Debug, Error)]
pub enum StageFault {
    /// A file with the same staged name is already waiting in the working area
    #[error("Staged file already exists: {}", path.display())]
    StagedExists { path: PathBuf },

    #[error("Failed to copy {} to {}", from.display(), to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Short copy of {}: copied {copied} of {expected} bytes", path.display())]
    ShortCopy {
        path: PathBuf,
        copied: u64,
        expected: u64,
    },

    #[error("Failed to remove source {}", path.display())]
    RemoveSource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failure encrypting a staged file.
#[derive(Debug, Error)]
pub enum EncryptionFault {
    #[error("I/O error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Encrypted artifact already exists: {}", path.display())]
    OutputExists { path: PathBuf },

    #[error("Cipher failure: {0}")]
    Cipher(String),
}

/// Classification of a failed remote store call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteFault {
    /// The session holds a different number of bytes than the client sent
    #[error("Incorrect offset, server has {correct_offset} bytes")]
    IncorrectOffset { correct_offset: u64 },

    /// The server asked the client to back off
    #[error("Server asked to retry after {backoff:?}")]
    RetryLater { backoff: Duration },

    /// Network-level failure (timeout, connection reset, 5xx)
    #[error("Transient network fault: {0}")]
    Transient(String),

    /// Any other error reported by the remote API
    #[error("Remote error: {0}")]
    Fatal(String),
}

impl RemoteFault {
    /// Offset mismatches, backoff requests and network faults may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// Terminal failure of an upload.
#[derive(Debug, Error)]
pub enum UploadFault {
    /// Usage error: chunked uploads need at least one full chunk
    #[error("{} is {size} bytes, smaller than one {chunk_size}-byte chunk", path.display())]
    TooSmall {
        path: PathBuf,
        size: u64,
        chunk_size: u64,
    },

    #[error("Failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Non-retryable remote error
    #[error("Upload aborted: {0}")]
    Remote(RemoteFault),

    #[error("Upload failed after {attempts} attempts, last error: {last}")]
    AttemptsExhausted { attempts: u32, last: RemoteFault },

    /// Committed object disagrees with the local artifact
    #[error("Uploaded object {path} does not match local artifact: {reason}")]
    Verification { path: String, reason: String },
}

/// Per-file fault recorded on a failed `FileTask`.
#[derive(Debug, Error)]
pub enum TaskFault {
    #[error(transparent)]
    Stage(#[from] StageFault),

    #[error(transparent)]
    Encryption(#[from] EncryptionFault),

    #[error(transparent)]
    Upload(#[from] UploadFault),
}
