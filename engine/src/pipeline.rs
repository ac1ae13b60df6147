//! Per-file state machine.
//!
//! [`FilePipeline::process`] drives one [`FileTask`] through
//! `Discovered -> Staged -> Encrypted -> Uploaded -> Purged`, synchronously.
//! The first failing transition freezes the task at `Failed` and leaves every
//! on-disk remnant where it is:
//!
//! - staging failure: the source stays at its original path
//! - encryption failure: the staged copy stays in the working area
//! - upload failure: both the staged copy and the artifact stay
//!
//! Purge failures are logged and never escalated. A purged-but-not-deleted
//! remnant is not reconsidered by later runs, since it no longer lives under
//! the input root.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, info_span, warn};

use crate::checksums;
use crate::config::Config;
use crate::crypto::EncryptionGateway;
use crate::error::{TaskFault, UploadFault};
use crate::fs_ops;
use crate::model::{FileTask, Stage};
use crate::progress::PipelineObserver;
use crate::store::{ChunkedStore, CommitInfo, RemoteMetadata};
use crate::upload::ChunkedUploader;

/// Drives discovered files through staging, encryption, upload and purge.
pub struct FilePipeline {
    config: Arc<Config>,
    gateway: Arc<dyn EncryptionGateway>,
    uploader: ChunkedUploader,
}

impl FilePipeline {
    pub fn new(config: Arc<Config>, store: Arc<dyn ChunkedStore>, gateway: Arc<dyn EncryptionGateway>) -> Self {
        let uploader = ChunkedUploader::new(store, config.chunk_size, config.max_attempts);
        FilePipeline {
            config,
            gateway,
            uploader,
        }
    }

    /// Create a task for a regular file if its extension is configured.
    ///
    /// Matching happens only here; staged and encrypted names are never
    /// re-matched.
    pub fn discover(&self, path: &Path, size: u64, modified: Option<SystemTime>) -> Option<FileTask> {
        if !self.config.matches_extension(path) {
            debug!(path = %path.display(), "extension not configured, skipping");
            return None;
        }
        let mut task = FileTask::new(path, size, &self.config);
        task.modified = modified;
        Some(task)
    }

    /// Run every remaining stage of `task`.
    ///
    /// Never returns an error: the outcome is recorded on the task itself
    /// (`stage`, `failed_from`, `fault`).
    pub fn process(&self, task: &mut FileTask, observer: Option<&dyn PipelineObserver>) {
        let span = info_span!("file", task = %task.id, file = %task.file_name());
        let _enter = span.enter();

        if let Some(obs) = observer {
            obs.on_task_started(task);
        }

        if let Err(fault) = self.run_stages(task, observer) {
            warn!(
                stage = %task.stage,
                source = %task.source_path.display(),
                error = %fault,
                "file failed, leaving local copies in place"
            );
            task.fail(fault);
        }

        if let Some(obs) = observer {
            obs.on_task_finished(task);
        }
    }

    fn run_stages(&self, task: &mut FileTask, observer: Option<&dyn PipelineObserver>) -> Result<(), TaskFault> {
        let staged_bytes = fs_ops::stage_file(&task.source_path, &task.staged_path)?;
        info!(bytes = staged_bytes, to = %task.staged_path.display(), "staged");
        self.advance(task, Stage::Staged, observer);

        self.gateway.encrypt(
            &task.staged_path,
            &task.output_path,
            &self.config.recipient_key,
            self.config.armor,
            self.config.integrity_check,
        )?;
        if let Err(e) = fs_ops::copy_mtime(&task.staged_path, &task.output_path) {
            debug!(error = %e, "could not carry modification time to the artifact");
        }
        self.advance(task, Stage::Encrypted, observer);

        let remote = self.upload(task, observer)?;
        task.remote = Some(remote);
        self.advance(task, Stage::Uploaded, observer);

        self.purge(task);
        self.advance(task, Stage::Purged, observer);
        Ok(())
    }

    fn upload(&self, task: &FileTask, observer: Option<&dyn PipelineObserver>) -> Result<RemoteMetadata, UploadFault> {
        let metadata = fs::metadata(&task.output_path).map_err(|source| UploadFault::Io {
            path: task.output_path.clone(),
            source,
        })?;
        let modified = metadata.modified().unwrap_or_else(|_| SystemTime::now());
        let commit = CommitInfo::new(task.remote_key.clone(), modified);

        let mut progress = |committed: u64, total: u64| {
            if let Some(obs) = observer {
                obs.on_upload_progress(task, committed, total);
            }
        };

        let remote = if metadata.len() < self.uploader.chunk_size() {
            self.uploader.upload_single(&task.output_path, &commit, &mut progress)?
        } else {
            self.uploader.upload_chunked(&task.output_path, &commit, &mut progress)?
        };

        if self.config.verify_upload {
            checksums::verify_remote(&task.output_path, &remote)?;
        }
        Ok(remote)
    }

    fn purge(&self, task: &FileTask) {
        let staged_gone = fs_ops::remove_quietly(&task.staged_path);
        let output_gone = fs_ops::remove_quietly(&task.output_path);
        if !(staged_gone && output_gone) {
            warn!(
                remote = %task.remote_key,
                "purge incomplete, remaining local copies will not be retried"
            );
        }
    }

    fn advance(&self, task: &mut FileTask, next: Stage, observer: Option<&dyn PipelineObserver>) {
        task.advance(next);
        info!(stage = %next, "stage complete");
        if let Some(obs) = observer {
            obs.on_stage_changed(task, next);
        }
    }
}
