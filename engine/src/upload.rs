//! Resumable chunked uploads.
//!
//! An upload runs as a sequence of attempts. Each attempt re-opens the file,
//! seeks to the session's committed offset and drives the remaining protocol
//! phases (start, append, finish). Between attempts the retry policy reacts
//! to the classified fault:
//!
//! | Fault              | Reaction                                         |
//! |--------------------|--------------------------------------------------|
//! | `IncorrectOffset`  | adopt the server's offset, retry                 |
//! | `RetryLater`       | sleep for the requested backoff, retry           |
//! | `Transient`        | retry immediately from the same offset           |
//! | `Fatal`            | abort the upload                                 |
//!
//! Every attempt counts against `max_attempts`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::thread;

use tracing::{info, warn};

use crate::error::{RemoteFault, UploadFault};
use crate::model::UploadSession;
use crate::store::{ChunkedStore, CommitInfo, Cursor, RemoteMetadata};

/// Drives uploads of local files to a [`ChunkedStore`].
pub struct ChunkedUploader {
    store: Arc<dyn ChunkedStore>,
    chunk_size: u64,
    max_attempts: u32,
}

impl ChunkedUploader {
    pub fn new(store: Arc<dyn ChunkedStore>, chunk_size: u64, max_attempts: u32) -> Self {
        ChunkedUploader {
            store,
            chunk_size: chunk_size.max(1),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Upload a file of at least one chunk through an upload session.
    ///
    /// # Arguments
    /// * `path` - Local file to upload
    /// * `commit` - Destination and client-modified timestamp
    /// * `progress` - Called with `(committed, total)` after every chunk the
    ///   store acknowledges
    ///
    /// # Errors
    /// - `TooSmall` if the file is shorter than one chunk
    /// - `Io` if the file cannot be read
    /// - `Remote` on a non-retryable store error
    /// - `AttemptsExhausted` when every attempt failed
    pub fn upload_chunked(
        &self,
        path: &Path,
        commit: &CommitInfo,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<RemoteMetadata, UploadFault> {
        let total = std::fs::metadata(path).map_err(|e| io_fault(path, e))?.len();
        if total < self.chunk_size {
            return Err(UploadFault::TooSmall {
                path: path.to_path_buf(),
                size: total,
                chunk_size: self.chunk_size,
            });
        }

        let mut session = UploadSession::new();
        self.with_retries(path, &mut session, |session| {
            self.attempt_chunked(path, total, commit, session, progress)
        })
    }

    /// Upload a small file in a single request.
    ///
    /// Uses the same attempt budget and retry policy as
    /// [`ChunkedUploader::upload_chunked`]. An offset report cannot apply to
    /// a single request and is treated as fatal.
    pub fn upload_single(
        &self,
        path: &Path,
        commit: &CommitInfo,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<RemoteMetadata, UploadFault> {
        let data = std::fs::read(path).map_err(|e| io_fault(path, e))?;
        let total = data.len() as u64;

        let mut session = UploadSession::new();
        let metadata = self.with_retries(path, &mut session, |_| {
            self.store.upload(&data, commit).map_err(|fault| match fault {
                RemoteFault::IncorrectOffset { correct_offset } => UploadFault::Remote(RemoteFault::Fatal(
                    format!("unexpected offset report ({correct_offset}) for a single-request upload"),
                )),
                other => UploadFault::Remote(other),
            })
        })?;

        progress(total, total);
        info!(path = %path.display(), bytes = total, "upload committed");
        Ok(metadata)
    }

    /// Run `attempt` until it succeeds, fails fatally, or the budget is spent.
    ///
    /// Only `UploadFault::Remote` errors are subject to the retry policy; any
    /// other error from `attempt` is returned as is.
    fn with_retries<T>(
        &self,
        path: &Path,
        session: &mut UploadSession,
        mut attempt: impl FnMut(&mut UploadSession) -> Result<T, UploadFault>,
    ) -> Result<T, UploadFault> {
        let mut last = None;

        while session.attempt() < self.max_attempts {
            session.begin_attempt();
            let fault = match attempt(session) {
                Ok(value) => return Ok(value),
                Err(UploadFault::Remote(fault)) if fault.is_retryable() => fault,
                Err(other) => return Err(other),
            };
            let has_next = session.attempt() < self.max_attempts;

            match &fault {
                RemoteFault::IncorrectOffset { correct_offset } => {
                    warn!(
                        path = %path.display(),
                        attempt = session.attempt(),
                        offset = session.committed_offset(),
                        correct_offset,
                        "server reports a different offset, resuming from it"
                    );
                    session.correct_offset(*correct_offset);
                }
                RemoteFault::RetryLater { backoff } => {
                    warn!(
                        path = %path.display(),
                        attempt = session.attempt(),
                        backoff_ms = backoff.as_millis() as u64,
                        "server asked to retry later"
                    );
                    if has_next {
                        thread::sleep(*backoff);
                    }
                }
                RemoteFault::Transient(message) => {
                    warn!(
                        path = %path.display(),
                        attempt = session.attempt(),
                        offset = session.committed_offset(),
                        error = %message,
                        "transient upload failure, retrying"
                    );
                }
                RemoteFault::Fatal(_) => {}
            }
            last = Some(fault);
        }

        Err(UploadFault::AttemptsExhausted {
            attempts: session.attempt(),
            last: last.unwrap_or_else(|| RemoteFault::Transient("no attempt was made".to_string())),
        })
    }

    /// One pass over the protocol from the session's committed offset.
    fn attempt_chunked(
        &self,
        path: &Path,
        total: u64,
        commit: &CommitInfo,
        session: &mut UploadSession,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<RemoteMetadata, UploadFault> {
        let mut file = File::open(path).map_err(|e| io_fault(path, e))?;
        let mut buffer = vec![0u8; self.chunk_size as usize];

        if session.session_id().is_none() {
            file.read_exact(&mut buffer).map_err(|e| io_fault(path, e))?;
            let id = self.store.start_session(&buffer).map_err(UploadFault::Remote)?;
            session.open(id, self.chunk_size);
            self.report(path, session.committed_offset(), total, progress);
        }

        if session.committed_offset() > total {
            return Err(UploadFault::Remote(RemoteFault::Fatal(format!(
                "server holds {} bytes of a {}-byte file",
                session.committed_offset(),
                total
            ))));
        }
        file.seek(SeekFrom::Start(session.committed_offset()))
            .map_err(|e| io_fault(path, e))?;

        while total - session.committed_offset() > self.chunk_size {
            file.read_exact(&mut buffer).map_err(|e| io_fault(path, e))?;
            let cursor = open_cursor(session)?;
            self.store.append(&cursor, &buffer).map_err(UploadFault::Remote)?;
            session.advance(self.chunk_size);
            self.report(path, session.committed_offset(), total, progress);
        }

        let remainder = (total - session.committed_offset()) as usize;
        let tail = &mut buffer[..remainder];
        file.read_exact(tail).map_err(|e| io_fault(path, e))?;
        let cursor = open_cursor(session)?;
        let metadata = self.store.finish(&cursor, tail, commit).map_err(UploadFault::Remote)?;
        session.advance(remainder as u64);
        self.report(path, session.committed_offset(), total, progress);

        info!(path = %path.display(), bytes = total, attempt = session.attempt(), "upload committed");
        Ok(metadata)
    }

    fn report(&self, path: &Path, committed: u64, total: u64, progress: &mut dyn FnMut(u64, u64)) {
        let percent = if total == 0 { 100 } else { committed * 100 / total };
        info!(path = %path.display(), offset = committed, total, percent, "chunk committed");
        progress(committed, total);
    }
}

fn open_cursor(session: &UploadSession) -> Result<Cursor, UploadFault> {
    session
        .cursor()
        .ok_or_else(|| UploadFault::Remote(RemoteFault::Fatal("upload session was never opened".to_string())))
}

fn io_fault(path: &Path, source: io::Error) -> UploadFault {
    UploadFault::Io {
        path: path.to_path_buf(),
        source,
    }
}
