//! Progress reporting trait.
//!
//! This module defines the PipelineObserver trait, which decouples the engine
//! from any specific output (terminal progress bar, structured logs, tests).
//!
//! Observers are informational only: nothing they do changes how a file moves
//! through the pipeline.

use std::path::Path;

use crate::model::{FileTask, RunReport, Stage};

/// Trait for receiving progress updates from an ingest run.
///
/// Every method has a no-op default, so implementors override only what they
/// display. With more than one worker, methods are called concurrently from
/// worker threads, hence the `Send + Sync` bound.
pub trait PipelineObserver: Send + Sync {
    /// Called once before the walk starts.
    fn on_run_started(&self, _input_root: &Path) {}

    /// Called when a matching file is about to be staged.
    fn on_task_started(&self, _task: &FileTask) {}

    /// Called after every successful stage transition.
    fn on_stage_changed(&self, _task: &FileTask, _stage: Stage) {}

    /// Called after every chunk the remote store acknowledges.
    ///
    /// `committed` is the number of artifact bytes the session holds.
    fn on_upload_progress(&self, _task: &FileTask, _committed: u64, _total: u64) {}

    /// Called when a task reaches `Purged` or `Failed`.
    fn on_task_finished(&self, _task: &FileTask) {}

    /// Called once after the walk and all pruning are done.
    fn on_run_completed(&self, _report: &RunReport) {}
}
