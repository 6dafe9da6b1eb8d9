//! Removal of build outputs and run scratch space.

use std::fs;
use std::io;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors from cleaning.
#[derive(Error, Debug)]
pub enum CleanError {
    /// A configured path would escape the project root.
    #[error("refusing to clean '{0}': path must be relative and stay inside the project")]
    OutsideProject(Utf8PathBuf),

    /// Removing a path failed.
    #[error("failed to remove {path}: {source}")]
    Io {
        /// Path being removed.
        path: Utf8PathBuf,
        /// Underlying error.
        source: io::Error,
    },
}

/// Result alias for clean operations.
pub type CleanResult<T> = Result<T, CleanError>;

/// What a clean pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    /// Paths that existed and were removed.
    pub removed: Vec<Utf8PathBuf>,
    /// Paths that were already absent.
    pub missing: Vec<Utf8PathBuf>,
}

/// Remove each of `paths` (relative to `root`) if present.
///
/// Every path is checked before anything is deleted, so a bad entry leaves
/// the tree untouched.
#[instrument(skip(paths), fields(root = %root))]
pub fn clean(root: &Utf8Path, paths: &[Utf8PathBuf]) -> CleanResult<CleanReport> {
    for path in paths {
        check_inside(path)?;
    }

    let mut report = CleanReport::default();
    for path in paths {
        let target = root.join(path);
        match fs::symlink_metadata(&target) {
            Ok(meta) => {
                let removal = if meta.is_dir() {
                    fs::remove_dir_all(&target)
                } else {
                    fs::remove_file(&target)
                };
                removal.map_err(|source| CleanError::Io {
                    path: target.clone(),
                    source,
                })?;
                debug!(path = %target, "removed");
                report.removed.push(path.clone());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => report.missing.push(path.clone()),
            Err(source) => return Err(CleanError::Io { path: target, source }),
        }
    }

    info!(removed = report.removed.len(), "clean complete");
    Ok(report)
}

fn check_inside(path: &Utf8Path) -> CleanResult<()> {
    let escapes = path.as_str().is_empty()
        || path.components().any(|c| {
            matches!(
                c,
                Utf8Component::Prefix(_) | Utf8Component::RootDir | Utf8Component::ParentDir
            )
        })
        || path.components().all(|c| c == Utf8Component::CurDir);
    if escapes {
        return Err(CleanError::OutsideProject(path.to_path_buf()));
    }
    Ok(())
}
