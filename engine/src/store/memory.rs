//! Scripted in-memory store for tests.
//!
//! Each call consumes the next scripted [`Step`] (defaulting to `Pass`), so a
//! test can inject a fault at an exact point of the protocol.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use chrono::Utc;

use super::{ChunkedStore, CommitInfo, Cursor, RemoteMetadata};
use crate::checksums::content_hash_bytes;
use crate::error::RemoteFault;

/// Outcome injected into one store call.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// Apply the call normally
    Pass,
    /// Reject the call without applying it
    Fail(RemoteFault),
    /// Apply the call, then lose the acknowledgement
    DropAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Start,
    Append,
    Finish,
    Upload,
}

#[derive(Default)]
struct State {
    sessions: HashMap<String, Vec<u8>>,
    objects: BTreeMap<String, Vec<u8>>,
    script: VecDeque<Step>,
    calls: Vec<(Op, u64)>,
    next_id: u64,
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn scripted(steps: impl IntoIterator<Item = Step>) -> Self {
        let store = Self::new();
        store.lock().script.extend(steps);
        store
    }

    pub(crate) fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(path).cloned()
    }

    pub(crate) fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Every call received, with the offset it claimed.
    pub(crate) fn calls(&self) -> Vec<(Op, u64)> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("memory store lock poisoned")
    }

    fn run<T>(
        &self,
        op: Op,
        offset: u64,
        apply: impl FnOnce(&mut State) -> Result<T, RemoteFault>,
    ) -> Result<T, RemoteFault> {
        let mut state = self.lock();
        state.calls.push((op, offset));
        match state.script.pop_front().unwrap_or(Step::Pass) {
            Step::Pass => apply(&mut *state),
            Step::Fail(fault) => Err(fault),
            Step::DropAck => {
                apply(&mut *state)?;
                Err(RemoteFault::Transient("connection reset before acknowledgement".to_string()))
            }
        }
    }
}

impl State {
    fn append(&mut self, cursor: &Cursor, chunk: &[u8]) -> Result<(), RemoteFault> {
        let session = self
            .sessions
            .get_mut(&cursor.session_id)
            .ok_or_else(|| RemoteFault::Fatal("lookup_failed/not_found".to_string()))?;
        let held = session.len() as u64;
        if held != cursor.offset {
            return Err(RemoteFault::IncorrectOffset { correct_offset: held });
        }
        session.extend_from_slice(chunk);
        Ok(())
    }

    fn commit(&mut self, data: Vec<u8>, commit: &CommitInfo) -> Result<RemoteMetadata, RemoteFault> {
        if self.objects.contains_key(&commit.path) {
            return Err(RemoteFault::Fatal("path/conflict/file".to_string()));
        }
        let meta = RemoteMetadata {
            path: commit.path.clone(),
            size: data.len() as u64,
            content_hash: Some(content_hash_bytes(&data)),
            server_modified: Some(Utc::now()),
        };
        self.objects.insert(commit.path.clone(), data);
        Ok(meta)
    }
}

impl ChunkedStore for MemoryStore {
    fn start_session(&self, chunk: &[u8]) -> Result<String, RemoteFault> {
        self.run(Op::Start, 0, |state| {
            state.next_id += 1;
            let id = format!("mem-{}", state.next_id);
            state.sessions.insert(id.clone(), chunk.to_vec());
            Ok(id)
        })
    }

    fn append(&self, cursor: &Cursor, chunk: &[u8]) -> Result<(), RemoteFault> {
        self.run(Op::Append, cursor.offset, |state| state.append(cursor, chunk))
    }

    fn finish(&self, cursor: &Cursor, chunk: &[u8], commit: &CommitInfo) -> Result<RemoteMetadata, RemoteFault> {
        self.run(Op::Finish, cursor.offset, |state| {
            state.append(cursor, chunk)?;
            if state.objects.contains_key(&commit.path) {
                return Err(RemoteFault::Fatal("path/conflict/file".to_string()));
            }
            let data = state.sessions.remove(&cursor.session_id).unwrap_or_default();
            state.commit(data, commit)
        })
    }

    fn upload(&self, data: &[u8], commit: &CommitInfo) -> Result<RemoteMetadata, RemoteFault> {
        self.run(Op::Upload, 0, |state| state.commit(data.to_vec(), commit))
    }
}
