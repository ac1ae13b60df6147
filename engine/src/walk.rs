//! Directory traversal.
//!
//! [`TreeWalker`] yields every entry under the input root exactly once, as a
//! lazy sequence of [`Visit`]s. Directories are reported after all of their
//! contents (`DirectoryDone`), which is the point at which the caller decides
//! whether to prune them. Symbolic links are reported and never followed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

use crate::error::{EngineError, TraversalFault};

/// One entry produced by the walk.
#[derive(Debug)]
pub enum Visit {
    /// Regular file
    File {
        path: PathBuf,
        size: u64,
        modified: Option<SystemTime>,
    },
    /// Symbolic link (not followed)
    Symlink { path: PathBuf },
    /// Socket, FIFO, device or other special file
    Other { path: PathBuf },
    /// All entries below this directory have been visited
    DirectoryDone { path: PathBuf, is_root: bool },
    /// The entry could not be read; the walk continues
    Failed(TraversalFault),
}

/// Walker over one input root.
#[derive(Debug, Clone)]
pub struct TreeWalker {
    root: PathBuf,
}

impl TreeWalker {
    /// Create a walker after checking the root is a readable directory.
    ///
    /// # Errors
    /// - `RootNotFound` if the root does not exist
    /// - `RootNotDirectory` if it is not a directory
    /// - `RootAccessDenied` if it cannot be inspected or listed
    pub fn new(root: &Path) -> Result<Self, EngineError> {
        let metadata = fs::metadata(root).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                EngineError::RootNotFound {
                    path: root.to_path_buf(),
                }
            } else {
                EngineError::RootAccessDenied {
                    path: root.to_path_buf(),
                    source,
                }
            }
        })?;

        if !metadata.is_dir() {
            return Err(EngineError::RootNotDirectory {
                path: root.to_path_buf(),
            });
        }

        fs::read_dir(root).map_err(|source| EngineError::RootAccessDenied {
            path: root.to_path_buf(),
            source,
        })?;

        Ok(TreeWalker {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazily walk the tree, contents before their directory, siblings in
    /// file-name order.
    pub fn visits(&self) -> impl Iterator<Item = Visit> {
        WalkDir::new(&self.root)
            .follow_links(false)
            .contents_first(true)
            .sort_by_file_name()
            .into_iter()
            .map(classify)
    }
}

fn classify(entry: walkdir::Result<walkdir::DirEntry>) -> Visit {
    let entry = match entry {
        Ok(entry) => entry,
        Err(e) => {
            return Visit::Failed(TraversalFault {
                path: e.path().map(Path::to_path_buf).unwrap_or_default(),
                message: e.to_string(),
            })
        }
    };

    let file_type = entry.file_type();
    if file_type.is_symlink() {
        return Visit::Symlink {
            path: entry.into_path(),
        };
    }
    if file_type.is_dir() {
        let is_root = entry.depth() == 0;
        return Visit::DirectoryDone {
            path: entry.into_path(),
            is_root,
        };
    }
    if !file_type.is_file() {
        return Visit::Other {
            path: entry.into_path(),
        };
    }

    match entry.metadata() {
        Ok(metadata) => Visit::File {
            size: metadata.len(),
            modified: metadata.modified().ok(),
            path: entry.into_path(),
        },
        Err(e) => Visit::Failed(TraversalFault {
            path: entry.into_path(),
            message: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn describe(visit: &Visit, root: &Path) -> String {
        let rel = |p: &Path| p.strip_prefix(root).unwrap().display().to_string();
        match visit {
            Visit::File { path, size, .. } => format!("file {} {}", rel(path), size),
            Visit::Symlink { path } => format!("link {}", rel(path)),
            Visit::Other { path } => format!("other {}", rel(path)),
            Visit::DirectoryDone { path, is_root } => format!("dir {} {}", rel(path), is_root),
            Visit::Failed(fault) => format!("failed {}", fault),
        }
    }

    #[test]
    fn test_contents_before_directory() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        fs::create_dir_all(root.join("a").join("b")).expect("Failed to create dirs");
        fs::write(root.join("a").join("report.txt"), b"12345").expect("Failed to write file");
        fs::write(root.join("a").join("b").join("deep.txt"), b"1").expect("Failed to write file");
        fs::write(root.join("top.txt"), b"12").expect("Failed to write file");

        let walker = TreeWalker::new(root).expect("Failed to create walker");
        let seen: Vec<String> = walker.visits().map(|v| describe(&v, root)).collect();

        let sep = std::path::MAIN_SEPARATOR;
        assert_eq!(
            seen,
            vec![
                format!("file a{sep}b{sep}deep.txt 1"),
                format!("dir a{sep}b false"),
                format!("file a{sep}report.txt 5"),
                "dir a false".to_string(),
                "file top.txt 2".to_string(),
                "dir  true".to_string(),
            ]
        );
    }

    #[test]
    fn test_root_validation() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file = temp_dir.path().join("plain.txt");
        fs::write(&file, b"x").expect("Failed to write file");

        assert!(matches!(
            TreeWalker::new(&temp_dir.path().join("missing")),
            Err(EngineError::RootNotFound { .. })
        ));
        assert!(matches!(
            TreeWalker::new(&file),
            Err(EngineError::RootNotDirectory { .. })
        ));
        let walker = TreeWalker::new(temp_dir.path()).expect("Failed to create walker");
        assert_eq!(walker.root(), temp_dir.path());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_reported_not_followed() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("in");
        let elsewhere = temp_dir.path().join("elsewhere");
        fs::create_dir_all(&root).expect("Failed to create dir");
        fs::create_dir_all(&elsewhere).expect("Failed to create dir");
        fs::write(elsewhere.join("secret.txt"), b"x").expect("Failed to write file");
        std::os::unix::fs::symlink(&elsewhere, root.join("link")).expect("Failed to create symlink");

        let walker = TreeWalker::new(&root).expect("Failed to create walker");
        let seen: Vec<String> = walker.visits().map(|v| describe(&v, &root)).collect();

        assert_eq!(seen, vec!["link link".to_string(), "dir  true".to_string()]);
    }
}
