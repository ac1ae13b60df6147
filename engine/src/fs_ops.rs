//! Filesystem operations module.
//!
//! This module provides the local mutations behind each pipeline transition:
//! - Staging a file (verified copy into the working area, then source removal)
//! - Best-effort removal of intermediate artifacts
//! - Pruning directories that became empty during a run
//! - Small helpers shared by the encryption and hashing code

use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::path::Path;

use filetime::FileTime;
use tracing::{debug, warn};

use crate::error::StageFault;

/// Move a file into the working area.
///
/// The copy is created exclusively, flushed to disk and length-checked
/// against the source before the source is deleted, so the source is never
/// removed without a complete staged copy. The source modification time is
/// carried over to the staged copy.
///
/// # Arguments
/// * `source` - Discovered file under the input root
/// * `staged` - Destination path in the working area
///
/// # Returns
/// Number of bytes staged
///
/// # Errors
/// Returns StageFault if the copy cannot be made or verified, or if the
/// source cannot be removed. In every error case the source is left in
/// place and no partial staged copy remains.
pub fn stage_file(source: &Path, staged: &Path) -> Result<u64, StageFault> {
    let copy_error = |source_err: io::Error| StageFault::Copy {
        from: source.to_path_buf(),
        to: staged.to_path_buf(),
        source: source_err,
    };

    let mut src_file = fs::File::open(source).map_err(copy_error)?;
    let src_metadata = src_file.metadata().map_err(copy_error)?;
    let expected = src_metadata.len();
    let src_mtime = src_metadata.modified().ok();

    // Never overwrite a remnant of an earlier, stuck run
    let mut dst_file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(staged)
        .map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                StageFault::StagedExists {
                    path: staged.to_path_buf(),
                }
            } else {
                copy_error(e)
            }
        })?;

    let copied = io::copy(&mut src_file, &mut dst_file).and_then(|n| dst_file.sync_all().map(|_| n));
    drop(dst_file);
    let copied = match copied {
        Ok(n) => n,
        Err(e) => {
            remove_quietly(staged);
            return Err(copy_error(e));
        }
    };

    if copied != expected {
        remove_quietly(staged);
        return Err(StageFault::ShortCopy {
            path: source.to_path_buf(),
            copied,
            expected,
        });
    }

    if let Some(mtime) = src_mtime {
        if let Err(e) = filetime::set_file_mtime(staged, FileTime::from_system_time(mtime)) {
            debug!(path = %staged.display(), error = %e, "could not preserve modification time");
        }
    }

    if let Err(e) = fs::remove_file(source) {
        // Keep exactly one copy: the original
        remove_quietly(staged);
        return Err(StageFault::RemoveSource {
            path: source.to_path_buf(),
            source: e,
        });
    }

    Ok(copied)
}

/// Delete a file, logging instead of failing.
///
/// Returns true if the file is gone afterwards.
pub fn remove_quietly(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to remove file");
            false
        }
    }
}

/// Delete `dir` if it has no entries at the time of the call.
///
/// Emptiness is checked here, not cached, since sibling processing may have
/// just emptied the directory.
///
/// # Returns
/// true if the directory was removed, false if it still has entries
pub fn remove_dir_if_empty(dir: &Path) -> io::Result<bool> {
    let is_empty = fs::read_dir(dir)?.next().is_none();
    if !is_empty {
        return Ok(false);
    }
    match fs::remove_dir(dir) {
        Ok(()) => Ok(true),
        // Something appeared between the check and the removal
        Err(_) if fs::read_dir(dir)?.next().is_some() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Copy the modification time of `from` onto `to`.
pub fn copy_mtime(from: &Path, to: &Path) -> io::Result<()> {
    let metadata = fs::metadata(from)?;
    filetime::set_file_mtime(to, FileTime::from_last_modification_time(&metadata))
}

/// Fill `buf` from `reader`, stopping early only at end of input.
///
/// Returns the number of bytes read.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Format a byte count with binary units, e.g. `8.0 MiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.1} {}", size, UNITS[unit_idx])
}
