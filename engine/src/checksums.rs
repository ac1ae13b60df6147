//! Content hash computation and upload verification.
//!
//! This module provides:
//! - The Dropbox content hash (SHA-256 over per-block SHA-256 digests)
//! - File-level and in-memory hash computation
//! - Comparison of a committed remote object against the local artifact

use std::fs::File;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::UploadFault;
use crate::fs_ops::read_full;
use crate::store::RemoteMetadata;

/// Block size of the content hash: 4 MiB.
pub const CONTENT_HASH_BLOCK_SIZE: usize = 4 << 20;

/// Incremental content hasher.
///
/// Input is split into 4 MiB blocks; each block is hashed with SHA-256 and
/// the concatenation of those digests is hashed again. Block boundaries are
/// tracked internally, so `update` may be called with slices of any size.
pub struct ContentHasher {
    overall: Sha256,
    block: Sha256,
    block_len: usize,
}

impl ContentHasher {
    pub fn new() -> Self {
        ContentHasher {
            overall: Sha256::new(),
            block: Sha256::new(),
            block_len: 0,
        }
    }

    /// Update the hasher with new data
    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = CONTENT_HASH_BLOCK_SIZE - self.block_len;
            let take = room.min(data.len());
            self.block.update(&data[..take]);
            self.block_len += take;
            data = &data[take..];

            if self.block_len == CONTENT_HASH_BLOCK_SIZE {
                self.flush_block();
            }
        }
    }

    /// Finalize and return the lower-case hex digest
    pub fn finalize(mut self) -> String {
        if self.block_len > 0 {
            self.flush_block();
        }
        format!("{:x}", self.overall.finalize())
    }

    fn flush_block(&mut self) {
        let block = std::mem::replace(&mut self.block, Sha256::new());
        self.overall.update(block.finalize());
        self.block_len = 0;
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the content hash of a file.
pub fn content_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = ContentHasher::new();
    let mut buffer = vec![0u8; 1 << 16];

    loop {
        let n = read_full(&mut file, &mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Compute the content hash of an in-memory buffer.
pub fn content_hash_bytes(data: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Check that a committed object matches the local artifact it came from.
///
/// # Behavior
/// - The reported size must equal the artifact's length
/// - When the store reports a content hash, it must equal the hash of the
///   artifact; stores that report none are checked on size only
///
/// # Errors
/// Returns UploadFault::Verification describing the first disagreement, or
/// UploadFault::Io if the artifact cannot be read.
pub fn verify_remote(artifact: &Path, remote: &RemoteMetadata) -> Result<(), UploadFault> {
    let io_fault = |source: io::Error| UploadFault::Io {
        path: artifact.to_path_buf(),
        source,
    };

    let local_size = std::fs::metadata(artifact).map_err(io_fault)?.len();
    if remote.size != local_size {
        return Err(UploadFault::Verification {
            path: remote.path.clone(),
            reason: format!("size {} != local {}", remote.size, local_size),
        });
    }

    if let Some(remote_hash) = &remote.content_hash {
        let local_hash = content_hash(artifact).map_err(io_fault)?;
        if !remote_hash.eq_ignore_ascii_case(&local_hash) {
            return Err(UploadFault::Verification {
                path: remote.path.clone(),
                reason: format!("content hash {} != local {}", remote_hash, local_hash),
            });
        }
    }

    Ok(())
}
