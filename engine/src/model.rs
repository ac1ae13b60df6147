//! Core data model for ingest runs.
//!
//! This module defines the structures flowing through the engine:
//! - FileTask: one discovered file moving through the stage machine
//! - Stage: the lifecycle states of a FileTask
//! - UploadSession: resumable-transfer state for one upload call
//! - RunReport: the outcome of one traversal of the input root

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use uuid::Uuid;

use crate::config::Config;
use crate::error::{TaskFault, TraversalFault};
use crate::store::{Cursor, RemoteMetadata};

/// Suffix appended to a file's name when it is moved to the working area.
pub const WORKING_SUFFIX: &str = ".work";

/// Suffix that replaces the working suffix on encrypted artifacts.
pub const ENCRYPTED_SUFFIX: &str = ".enc";

/// Lifecycle stage of a FileTask.
///
/// Stages advance strictly in declaration order; `Failed` freezes the task
/// with every on-disk remnant left in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Found under the input root with a matching extension
    Discovered,
    /// Copied into the working area; source removed
    Staged,
    /// Encrypted artifact written to the output area
    Encrypted,
    /// Remote commit confirmed
    Uploaded,
    /// Local staged and encrypted copies removed
    Purged,
    /// Stopped; see `FileTask::failed_from` and `FileTask::fault`
    Failed,
}

impl Stage {
    /// Returns true if this stage is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Purged | Stage::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Discovered => "discovered",
            Stage::Staged => "staged",
            Stage::Encrypted => "encrypted",
            Stage::Uploaded => "uploaded",
            Stage::Purged => "purged",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The unit of work flowing through the pipeline.
#[derive(Debug)]
pub struct FileTask {
    /// Unique identifier for this task within the run
    pub id: Uuid,

    /// Where the file was discovered
    pub source_path: PathBuf,

    /// `<working_path>/<name>.work`
    pub staged_path: PathBuf,

    /// `<output_path>/<name>.enc`
    pub output_path: PathBuf,

    /// Destination at the remote store (`remote_prefix` + artifact name)
    pub remote_key: String,

    /// Source size at discovery
    pub size: u64,

    /// Source modification time at discovery, when the platform reports one
    pub modified: Option<SystemTime>,

    pub stage: Stage,

    /// The stage the task was in when it failed
    pub failed_from: Option<Stage>,

    pub fault: Option<TaskFault>,

    /// Metadata of the committed remote object
    pub remote: Option<RemoteMetadata>,
}

impl FileTask {
    /// Create a task for a discovered file, deriving every downstream path.
    pub fn new(source_path: &Path, size: u64, config: &Config) -> Self {
        let name = source_path.file_name().unwrap_or_default();
        let staged_name = staged_file_name(name);
        let output_name = encrypted_file_name(&staged_name);
        let remote_key = format!("{}{}", config.remote_prefix, output_name.to_string_lossy());

        FileTask {
            id: Uuid::new_v4(),
            source_path: source_path.to_path_buf(),
            staged_path: config.working_path.join(staged_name),
            output_path: config.output_path.join(output_name),
            remote_key,
            size,
            modified: None,
            stage: Stage::Discovered,
            failed_from: None,
            fault: None,
            remote: None,
        }
    }

    /// File name of the source, for display.
    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "(unknown)".to_string())
    }

    pub(crate) fn advance(&mut self, next: Stage) {
        debug_assert!(
            !self.stage.is_terminal() && next > self.stage,
            "illegal transition {} -> {}",
            self.stage,
            next
        );
        self.stage = next;
    }

    pub(crate) fn fail(&mut self, fault: TaskFault) {
        self.failed_from = Some(self.stage);
        self.stage = Stage::Failed;
        self.fault = Some(fault);
    }
}

fn staged_file_name(name: &std::ffi::OsStr) -> OsString {
    let mut staged = name.to_os_string();
    staged.push(WORKING_SUFFIX);
    staged
}

fn encrypted_file_name(staged: &std::ffi::OsStr) -> OsString {
    let lossy = staged.to_string_lossy();
    let base = lossy.strip_suffix(WORKING_SUFFIX).unwrap_or(&lossy);
    OsString::from(format!("{base}{ENCRYPTED_SUFFIX}"))
}

/// Resumable-transfer state for one upload call.
///
/// `committed_offset` only grows through [`UploadSession::advance`]; the only
/// way to move it backwards is an explicit server-reported correction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSession {
    session_id: Option<String>,
    committed_offset: u64,
    attempt: u32,
}

impl UploadSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn committed_offset(&self) -> u64 {
        self.committed_offset
    }

    /// 1-based number of the attempt in progress (0 before the first).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.session_id
            .as_ref()
            .map(|id| Cursor::new(id.clone(), self.committed_offset))
    }

    pub(crate) fn begin_attempt(&mut self) {
        self.attempt += 1;
    }

    /// Record the session handle issued for the first chunk.
    pub(crate) fn open(&mut self, session_id: String, first_chunk: u64) {
        self.session_id = Some(session_id);
        self.committed_offset = first_chunk;
    }

    pub(crate) fn advance(&mut self, bytes: u64) {
        self.committed_offset = self.committed_offset.saturating_add(bytes);
    }

    /// Replace the offset with the value the server reports holding.
    pub(crate) fn correct_offset(&mut self, offset: u64) {
        self.committed_offset = offset;
    }
}

/// Outcome of one traversal of the input root.
#[derive(Debug)]
pub struct RunReport {
    /// Unique identifier for this run
    pub id: Uuid,

    pub input_path: PathBuf,

    pub started_at: SystemTime,

    pub finished_at: Option<SystemTime>,

    /// Every task, in discovery order
    pub tasks: Vec<FileTask>,

    /// Regular files left alone because their extension is not configured
    pub unmatched_files: usize,

    /// Symbolic links observed (never followed or processed)
    pub symlinks: usize,

    pub traversal_faults: Vec<TraversalFault>,

    /// Directories removed because they were empty after the walk
    pub pruned_dirs: Vec<PathBuf>,
}

impl RunReport {
    pub fn new(input_path: &Path) -> Self {
        RunReport {
            id: Uuid::new_v4(),
            input_path: input_path.to_path_buf(),
            started_at: SystemTime::now(),
            finished_at: None,
            tasks: Vec::new(),
            unmatched_files: 0,
            symlinks: 0,
            traversal_faults: Vec::new(),
            pruned_dirs: Vec::new(),
        }
    }

    pub fn purged_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.stage == Stage::Purged).count()
    }

    pub fn failed_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.stage == Stage::Failed).count()
    }

    /// Total bytes of the committed remote objects.
    pub fn bytes_uploaded(&self) -> u64 {
        self.tasks
            .iter()
            .filter_map(|t| t.remote.as_ref())
            .map(|r| r.size)
            .sum()
    }

    pub fn has_failures(&self) -> bool {
        self.failed_count() > 0
    }
}
