//! Ingest run orchestration.
//!
//! This module ties traversal and the per-file pipeline together:
//! - walking the input root and discovering matching files
//! - running each task sequentially or on a bounded worker pool
//! - pruning directories that are empty once their files are processed
//! - collecting the RunReport

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

use crossbeam_channel::{bounded, unbounded};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crypto::EncryptionGateway;
use crate::error::{EngineError, TraversalFault};
use crate::fs_ops;
use crate::model::{FileTask, RunReport};
use crate::pipeline::FilePipeline;
use crate::progress::PipelineObserver;
use crate::store::ChunkedStore;
use crate::walk::{TreeWalker, Visit};

/// Run one traversal of the input root.
///
/// Every matching regular file is driven through the pipeline; per-file
/// failures are recorded on the task and never stop the run. After all
/// entries of a directory are done, the directory is removed if it is empty
/// and is not the input root.
///
/// With `workers > 1`, tasks run on a pool of scoped threads fed through a
/// bounded channel. Pruning is then deferred until every worker has drained,
/// so no directory disappears while a task under it is still in flight.
///
/// # Arguments
/// * `config` - Validated configuration
/// * `store` - Remote store the artifacts are uploaded to
/// * `gateway` - Encryption implementation
/// * `observer` - Optional observer for progress updates
///
/// # Errors
/// Returns EngineError only for run-level problems (unusable input root,
/// panicked worker). File-level errors are recorded in the report.
pub fn run_ingest(
    config: Arc<Config>,
    store: Arc<dyn ChunkedStore>,
    gateway: Arc<dyn EncryptionGateway>,
    observer: Option<&dyn PipelineObserver>,
) -> Result<RunReport, EngineError> {
    let walker = TreeWalker::new(&config.input_path)?;
    let workers = config.workers.max(1);
    let pipeline = FilePipeline::new(config, store, gateway);
    let mut report = RunReport::new(walker.root());

    info!(
        run = %report.id,
        root = %walker.root().display(),
        workers,
        "ingest run started"
    );
    if let Some(obs) = observer {
        obs.on_run_started(walker.root());
    }

    if workers == 1 {
        run_sequential(&walker, &pipeline, &mut report, observer);
    } else {
        run_parallel(&walker, &pipeline, &mut report, observer, workers)?;
    }

    report.finished_at = Some(SystemTime::now());
    info!(
        run = %report.id,
        files = report.tasks.len(),
        purged = report.purged_count(),
        failed = report.failed_count(),
        unmatched = report.unmatched_files,
        pruned = report.pruned_dirs.len(),
        faults = report.traversal_faults.len(),
        "ingest run finished"
    );

    // Invoke run completed callback
    if let Some(obs) = observer {
        obs.on_run_completed(&report);
    }

    Ok(report)
}

/// Walk and process in one thread; directories are pruned as the walk
/// leaves them.
fn run_sequential(
    walker: &TreeWalker,
    pipeline: &FilePipeline,
    report: &mut RunReport,
    observer: Option<&dyn PipelineObserver>,
) {
    for visit in walker.visits() {
        match visit {
            Visit::File { path, size, modified } => match pipeline.discover(&path, size, modified) {
                Some(mut task) => {
                    pipeline.process(&mut task, observer);
                    report.tasks.push(task);
                }
                None => report.unmatched_files += 1,
            },
            Visit::DirectoryDone { path, is_root } => {
                if !is_root {
                    prune(&path, report);
                }
            }
            other => record_passive(other, report),
        }
    }
}

/// Walk on the calling thread, process on `workers` scoped threads.
fn run_parallel(
    walker: &TreeWalker,
    pipeline: &FilePipeline,
    report: &mut RunReport,
    observer: Option<&dyn PipelineObserver>,
    workers: usize,
) -> Result<(), EngineError> {
    let (task_tx, task_rx) = bounded::<(usize, FileTask)>(workers * 2);
    let (done_tx, done_rx) = unbounded::<(usize, FileTask)>();
    let mut deferred_dirs: Vec<PathBuf> = Vec::new();

    thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let task_rx = task_rx.clone();
                let done_tx = done_tx.clone();
                scope.spawn(move || {
                    for (index, mut task) in task_rx {
                        pipeline.process(&mut task, observer);
                        if done_tx.send((index, task)).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();
        // Only the workers hold these now
        drop(task_rx);
        drop(done_tx);

        let mut next_index = 0;
        for visit in walker.visits() {
            match visit {
                Visit::File { path, size, modified } => match pipeline.discover(&path, size, modified) {
                    Some(task) => {
                        if task_tx.send((next_index, task)).is_err() {
                            // Every worker is gone; the join below reports why
                            break;
                        }
                        next_index += 1;
                    }
                    None => report.unmatched_files += 1,
                },
                Visit::DirectoryDone { path, is_root } => {
                    if !is_root {
                        deferred_dirs.push(path);
                    }
                }
                other => record_passive(other, report),
            }
        }
        drop(task_tx);

        let mut panicked = false;
        for handle in handles {
            if handle.join().is_err() {
                panicked = true;
            }
        }
        if panicked {
            Err(EngineError::WorkerPanicked)
        } else {
            Ok(())
        }
    })?;

    // Restore discovery order
    let mut finished: Vec<(usize, FileTask)> = done_rx.try_iter().collect();
    finished.sort_by_key(|(index, _)| *index);
    report.tasks = finished.into_iter().map(|(_, task)| task).collect();

    // Directories arrive in post-order, so children are pruned before parents
    for dir in deferred_dirs {
        prune(&dir, report);
    }
    Ok(())
}

/// Record entries that are observed but never processed.
fn record_passive(visit: Visit, report: &mut RunReport) {
    match visit {
        Visit::Symlink { path } => {
            debug!(path = %path.display(), "symbolic link, not followed");
            report.symlinks += 1;
        }
        Visit::Other { path } => {
            debug!(path = %path.display(), "not a regular file, skipping");
        }
        Visit::Failed(fault) => {
            warn!(path = %fault.path.display(), error = %fault.message, "failed to visit entry");
            report.traversal_faults.push(fault);
        }
        Visit::File { .. } | Visit::DirectoryDone { .. } => {}
    }
}

fn prune(dir: &Path, report: &mut RunReport) {
    match fs_ops::remove_dir_if_empty(dir) {
        Ok(true) => {
            info!(path = %dir.display(), "removed empty directory");
            report.pruned_dirs.push(dir.to_path_buf());
        }
        Ok(false) => {}
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "failed to prune directory");
            report.traversal_faults.push(TraversalFault {
                path: dir.to_path_buf(),
                message: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{open_sealed, AgeGateway};
    use crate::error::RemoteFault;
    use crate::model::Stage;
    use crate::pipeline::test_support::Sandbox;
    use crate::store::memory::{MemoryStore, Step};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn run(sandbox: &Sandbox, store: &Arc<MemoryStore>, observer: Option<&dyn PipelineObserver>) -> RunReport {
        let store: Arc<dyn ChunkedStore> = store.clone();
        run_ingest(sandbox.config.clone(), store, Arc::new(AgeGateway), observer).expect("Run should complete")
    }

    #[derive(Default)]
    struct CallTracker {
        started: AtomicUsize,
        finished: AtomicUsize,
        completed: Mutex<Option<usize>>,
    }

    impl PipelineObserver for CallTracker {
        fn on_task_started(&self, _task: &FileTask) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_task_finished(&self, task: &FileTask) {
            assert!(task.stage.is_terminal());
            self.finished.fetch_add(1, Ordering::SeqCst);
        }

        fn on_run_completed(&self, report: &RunReport) {
            *self.completed.lock().unwrap() = Some(report.tasks.len());
        }
    }

    #[test]
    fn test_matched_file_is_shipped_and_unmatched_left_alone() {
        let sandbox = Sandbox::new(256, 1);
        let report_path = sandbox.write_input("a/report.txt", b"numbers");
        let image_path = sandbox.write_input("a/image.png", b"pixels");
        let store = Arc::new(MemoryStore::new());

        let report = run(&sandbox, &store, None);

        assert!(!report_path.exists());
        assert_eq!(fs::read(&image_path).unwrap(), b"pixels");
        assert!(sandbox.input().join("a").is_dir(), "Directory still holds image.png");
        assert_eq!(store.object_count(), 1);
        let object = store.object("/backup/report.txt.enc").expect("Object should exist");
        assert_eq!(open_sealed(&object, &sandbox.secret).unwrap(), b"numbers");

        assert_eq!(report.tasks.len(), 1);
        assert_eq!(report.purged_count(), 1);
        assert_eq!(report.unmatched_files, 1);
        assert!(!report.has_failures());
        assert!(report.pruned_dirs.is_empty());
        assert!(report.finished_at.is_some());
    }

    #[test]
    fn test_emptied_directories_are_pruned_but_root_is_kept() {
        let sandbox = Sandbox::new(256, 1);
        sandbox.write_input("a/report.txt", b"numbers");
        sandbox.write_input("a/b/deeper.txt", b"more");
        fs::create_dir_all(sandbox.input().join("empty").join("nested")).unwrap();
        let store = Arc::new(MemoryStore::new());

        let report = run(&sandbox, &store, None);

        assert_eq!(report.purged_count(), 2);
        assert!(sandbox.input().is_dir(), "The input root is never removed");
        assert_eq!(fs::read_dir(sandbox.input()).unwrap().count(), 0);
        let input = sandbox.input();
        assert_eq!(
            report.pruned_dirs,
            vec![
                input.join("a").join("b"),
                input.join("a"),
                input.join("empty").join("nested"),
                input.join("empty"),
            ]
        );
    }

    #[test]
    fn test_empty_root_survives() {
        let sandbox = Sandbox::new(256, 1);
        let store = Arc::new(MemoryStore::new());

        let report = run(&sandbox, &store, None);

        assert!(report.tasks.is_empty());
        assert!(sandbox.input().is_dir());
    }

    #[test]
    fn test_stuck_file_is_not_rediscovered() {
        let sandbox = Sandbox::new(64, 1);
        let source = sandbox.write_input("report.txt", &[1u8; 2048]);
        let store = Arc::new(MemoryStore::scripted([
            Step::Pass,
            Step::Pass,
            Step::Fail(RemoteFault::Fatal("path/disallowed_name".to_string())),
        ]));

        let first = run(&sandbox, &store, None);
        assert!(first.has_failures());
        let task = &first.tasks[0];
        assert_eq!(task.failed_from, Some(Stage::Encrypted));
        assert!(!source.exists());
        assert!(task.staged_path.exists());
        assert!(task.output_path.exists());
        let calls_after_first = store.calls().len();

        let second = run(&sandbox, &store, None);

        assert!(second.tasks.is_empty(), "Staged files live outside the input root");
        assert_eq!(store.calls().len(), calls_after_first);
        assert!(task.staged_path.exists());
        assert!(task.output_path.exists());
        assert_eq!(store.object_count(), 0);
    }

    #[test]
    fn test_failure_does_not_stop_the_run() {
        let sandbox = Sandbox::new(1 << 20, 1);
        sandbox.write_input("a.txt", b"first");
        sandbox.write_input("b.txt", b"second");
        let store = Arc::new(MemoryStore::scripted([Step::Fail(RemoteFault::Fatal(
            "path/conflict/file".to_string(),
        ))]));

        let report = run(&sandbox, &store, None);

        assert_eq!(report.tasks.len(), 2);
        assert_eq!(report.tasks[0].stage, Stage::Failed);
        assert_eq!(report.tasks[1].stage, Stage::Purged);
        assert!(report.has_failures());
    }

    #[test]
    fn test_worker_pool_processes_everything() {
        let sandbox = Sandbox::new(128, 4);
        for dir in ["x", "y", "z"] {
            for name in ["1.txt", "2.txt", "3.txt"] {
                sandbox.write_input(&format!("{dir}/{dir}{name}"), format!("{dir}/{name}").as_bytes());
            }
        }
        sandbox.write_input("y/keep.png", b"keep");
        let store = Arc::new(MemoryStore::new());
        let tracker = CallTracker::default();

        let report = run(&sandbox, &store, Some(&tracker));

        assert_eq!(report.tasks.len(), 9);
        assert_eq!(report.purged_count(), 9);
        assert_eq!(store.object_count(), 9);
        let sources: Vec<_> = report.tasks.iter().map(|t| t.source_path.clone()).collect();
        let mut sorted = sources.clone();
        sorted.sort();
        assert_eq!(sources, sorted, "Tasks are reported in discovery order");

        let input = sandbox.input();
        assert!(!input.join("x").exists());
        assert!(input.join("y").join("keep.png").exists());
        assert!(!input.join("z").exists());
        assert_eq!(report.pruned_dirs, vec![input.join("x"), input.join("z")]);

        assert_eq!(tracker.started.load(Ordering::SeqCst), 9);
        assert_eq!(tracker.finished.load(Ordering::SeqCst), 9);
        assert_eq!(*tracker.completed.lock().unwrap(), Some(9));
    }

    #[test]
    fn test_missing_root_is_a_run_error() {
        let sandbox = Sandbox::new(256, 1);
        fs::remove_dir(sandbox.input()).unwrap();
        let store: Arc<dyn ChunkedStore> = Arc::new(MemoryStore::new());

        let result = run_ingest(sandbox.config.clone(), store, Arc::new(AgeGateway), None);

        assert!(matches!(result, Err(EngineError::RootNotFound { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_counted_not_processed() {
        let sandbox = Sandbox::new(256, 1);
        let target = sandbox.dir.path().join("outside.txt");
        fs::write(&target, b"outside").unwrap();
        std::os::unix::fs::symlink(&target, sandbox.input().join("link.txt")).unwrap();
        let store = Arc::new(MemoryStore::new());

        let report = run(&sandbox, &store, None);

        assert_eq!(report.symlinks, 1);
        assert!(report.tasks.is_empty());
        assert!(target.exists());
        assert!(sandbox.input().join("link.txt").symlink_metadata().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_directory_is_reported_and_walk_continues() {
        use std::os::unix::fs::PermissionsExt;

        let sandbox = Sandbox::new(256, 1);
        sandbox.write_input("locked/hidden.txt", b"hidden");
        let shipped = sandbox.write_input("open/report.txt", b"numbers");
        let locked = sandbox.input().join("locked");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).expect("Failed to lock dir");
        if fs::read_dir(&locked).is_ok() {
            // Permission bits do not bind this user
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("Failed to unlock dir");
            return;
        }
        let store = Arc::new(MemoryStore::new());

        let report = run(&sandbox, &store, None);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("Failed to unlock dir");

        assert!(report.traversal_faults.iter().any(|fault| fault.path == locked));
        assert!(!shipped.exists());
        assert_eq!(report.purged_count(), 1);
        assert!(store.object("/backup/report.txt.enc").is_some());
        assert!(!sandbox.input().join("open").exists());
        assert!(locked.join("hidden.txt").exists());
    }
}
