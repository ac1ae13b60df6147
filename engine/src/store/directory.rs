//! Filesystem-backed store.
//!
//! Open sessions are `<root>/.sessions/<uuid>.part` files whose length is the
//! authoritative session offset. Committing hard-links the part file to its
//! destination, which fails if the destination exists, so an object becomes
//! visible all at once or not at all.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{SubsecRound, Utc};
use filetime::FileTime;
use tracing::warn;
use uuid::Uuid;

use super::{ChunkedStore, CommitInfo, Cursor, RemoteMetadata};
use crate::checksums;
use crate::error::{EngineError, RemoteFault};
use crate::fs_ops::remove_quietly;

const SESSIONS_DIR: &str = ".sessions";

/// Store writing committed objects below a local root directory.
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    sessions: PathBuf,
}

impl DirectoryStore {
    /// Open (creating when missing) a store rooted at `root`.
    pub fn new(root: &Path) -> Result<Self, EngineError> {
        let sessions = root.join(SESSIONS_DIR);
        fs::create_dir_all(&sessions).map_err(|e| EngineError::Store {
            reason: format!("cannot prepare {}: {}", sessions.display(), e),
        })?;
        Ok(DirectoryStore {
            root: root.to_path_buf(),
            sessions,
        })
    }

    /// Local path of the object stored under `key`.
    pub fn object_path(&self, key: &str) -> Result<PathBuf, RemoteFault> {
        let mut path = self.root.clone();
        for component in key.trim_start_matches('/').split('/') {
            if component.is_empty() || component == "." || component == ".." || component == SESSIONS_DIR {
                return Err(RemoteFault::Fatal(format!("path/malformed_path: {key}")));
            }
            path.push(component);
        }
        Ok(path)
    }

    fn session_path(&self, session_id: &str) -> Result<PathBuf, RemoteFault> {
        // Ids are only ever issued as UUIDs; anything else cannot name a session
        Uuid::parse_str(session_id)
            .map_err(|_| RemoteFault::Fatal(format!("lookup_failed/not_found: {session_id}")))?;
        Ok(self.sessions.join(format!("{session_id}.part")))
    }

    fn append_at(&self, cursor: &Cursor, chunk: &[u8]) -> Result<PathBuf, RemoteFault> {
        let part = self.session_path(&cursor.session_id)?;
        let mut file = OpenOptions::new().append(true).open(&part).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                RemoteFault::Fatal(format!("lookup_failed/not_found: {}", cursor.session_id))
            } else {
                transient(e)
            }
        })?;

        let held = file.metadata().map_err(transient)?.len();
        if held != cursor.offset {
            return Err(RemoteFault::IncorrectOffset { correct_offset: held });
        }

        file.write_all(chunk).and_then(|_| file.sync_data()).map_err(transient)?;
        Ok(part)
    }

    fn commit(&self, part: &Path, commit: &CommitInfo) -> Result<RemoteMetadata, RemoteFault> {
        let dest = self.object_path(&commit.path)?;
        let size = fs::metadata(part).map_err(transient)?.len();
        let content_hash = checksums::content_hash(part).map_err(transient)?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(transient)?;
        }
        fs::hard_link(part, &dest).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                RemoteFault::Fatal(format!("path/conflict/file: {}", commit.path))
            } else {
                transient(e)
            }
        })?;
        remove_quietly(part);

        let mtime = FileTime::from_unix_time(commit.client_modified.timestamp(), 0);
        if let Err(e) = filetime::set_file_mtime(&dest, mtime) {
            warn!(path = %dest.display(), error = %e, "failed to set client_modified on stored object");
        }

        Ok(RemoteMetadata {
            path: commit.path.clone(),
            size,
            content_hash: Some(content_hash),
            server_modified: Some(Utc::now().trunc_subsecs(0)),
        })
    }
}

fn transient(err: io::Error) -> RemoteFault {
    RemoteFault::Transient(err.to_string())
}

impl ChunkedStore for DirectoryStore {
    fn start_session(&self, chunk: &[u8]) -> Result<String, RemoteFault> {
        let session_id = Uuid::new_v4().to_string();
        let part = self.sessions.join(format!("{session_id}.part"));

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part)
            .map_err(transient)?;
        if let Err(e) = file.write_all(chunk).and_then(|_| file.sync_data()) {
            drop(file);
            remove_quietly(&part);
            return Err(transient(e));
        }

        Ok(session_id)
    }

    fn append(&self, cursor: &Cursor, chunk: &[u8]) -> Result<(), RemoteFault> {
        self.append_at(cursor, chunk).map(|_| ())
    }

    fn finish(&self, cursor: &Cursor, chunk: &[u8], commit: &CommitInfo) -> Result<RemoteMetadata, RemoteFault> {
        let part = self.append_at(cursor, chunk)?;
        self.commit(&part, commit)
    }

    fn upload(&self, data: &[u8], commit: &CommitInfo) -> Result<RemoteMetadata, RemoteFault> {
        let session_id = self.start_session(data)?;
        let part = self.session_path(&session_id)?;
        let result = self.commit(&part, commit);
        if result.is_err() {
            remove_quietly(&part);
        }
        result
    }
}
