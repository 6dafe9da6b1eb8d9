//! Append-only artifact storage.
//!
//! Layout under the store root:
//!
//! ```text
//! <version>/
//!   .lock                   exclusive while a release attempt runs
//!   assets/<platform>/<file>
//!   staging.json            entries uploaded by an unfinished attempt
//!   release.json            the release record; present means released
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::checksum::sha256_file;
use super::{ArtifactEntry, ReleaseRecord};

/// Errors from artifact storage.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem access failed.
    #[error("{path}: {source}")]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A stored JSON document could not be read or written.
    #[error("{path}: {source}")]
    Json {
        /// Document path.
        path: Utf8PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A different file already occupies an artifact's location.
    #[error("{0} already exists with different contents")]
    Conflict(Utf8PathBuf),

    /// A release record already exists for this version.
    #[error("release record for {0} already exists")]
    RecordExists(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

fn io_err(path: &Utf8Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Destination for released artifacts and records.
///
/// Writes are append-only: an artifact or record, once stored, is never
/// replaced.
pub trait ArtifactStore {
    /// Guard holding the per-version lock; released on drop.
    type Guard;

    /// Block until the exclusive lock for `version` is held.
    fn lock(&self, version: &str) -> StoreResult<Self::Guard>;

    /// The committed record for `version`, if any.
    fn load_record(&self, version: &str) -> StoreResult<Option<ReleaseRecord>>;

    /// Entries uploaded by an earlier, unfinished attempt.
    fn staged(&self, version: &str) -> StoreResult<Vec<ArtifactEntry>>;

    /// Store `source` for `platform` and stage its entry.
    fn upload(
        &self,
        version: &str,
        platform: &str,
        source: &Utf8Path,
        sha256: &str,
    ) -> StoreResult<ArtifactEntry>;

    /// Persist the record and clear staging.
    fn commit(&self, record: &ReleaseRecord) -> StoreResult<()>;
}

/// Artifact store on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: Utf8PathBuf,
}

/// Exclusive lock on one version directory.
#[derive(Debug)]
pub struct VersionLock {
    path: Utf8PathBuf,
    file: File,
}

impl VersionLock {
    /// Lock file path.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for VersionLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path, error = %e, "failed to release version lock");
        }
    }
}

impl FsArtifactStore {
    /// Store rooted at `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store root.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn version_dir(&self, version: &str) -> Utf8PathBuf {
        self.root.join(version)
    }

    fn record_path(&self, version: &str) -> Utf8PathBuf {
        self.version_dir(version).join("release.json")
    }

    fn staging_path(&self, version: &str) -> Utf8PathBuf {
        self.version_dir(version).join("staging.json")
    }
}

fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> StoreResult<Option<T>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path)(e)),
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })
}

/// Write JSON through a temp file in the same directory, then rename.
fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T, clobber: bool) -> StoreResult<()> {
    let dir = path.parent().unwrap_or(Utf8Path::new("."));
    fs::create_dir_all(dir).map_err(io_err(dir))?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err(dir))?;
    serde_json::to_writer_pretty(&mut tmp, value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    tmp.write_all(b"\n").map_err(io_err(path))?;
    tmp.as_file().sync_all().map_err(io_err(path))?;
    if clobber {
        tmp.persist(path).map_err(|e| io_err(path)(e.error))?;
    } else {
        tmp.persist_noclobber(path).map_err(|e| io_err(path)(e.error))?;
    }
    Ok(())
}

impl ArtifactStore for FsArtifactStore {
    type Guard = VersionLock;

    #[instrument(skip(self))]
    fn lock(&self, version: &str) -> StoreResult<VersionLock> {
        let dir = self.version_dir(version);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let path = dir.join(".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err(&path))?;
        file.lock_exclusive().map_err(io_err(&path))?;
        debug!(%path, "acquired version lock");
        Ok(VersionLock { path, file })
    }

    fn load_record(&self, version: &str) -> StoreResult<Option<ReleaseRecord>> {
        read_json(&self.record_path(version))
    }

    fn staged(&self, version: &str) -> StoreResult<Vec<ArtifactEntry>> {
        Ok(read_json(&self.staging_path(version))?.unwrap_or_default())
    }

    #[instrument(skip(self))]
    fn upload(
        &self,
        version: &str,
        platform: &str,
        source: &Utf8Path,
        sha256: &str,
    ) -> StoreResult<ArtifactEntry> {
        let file_name = source
            .file_name()
            .ok_or_else(|| io_err(source)(io::Error::other("artifact path has no file name")))?;
        let dest_dir = self.version_dir(version).join("assets").join(platform);
        let dest = dest_dir.join(file_name);
        fs::create_dir_all(&dest_dir).map_err(io_err(&dest_dir))?;

        if dest.exists() {
            // Left behind by an attempt that died before staging the entry.
            if sha256_file(&dest).map_err(io_err(&dest))? != sha256 {
                return Err(StoreError::Conflict(dest));
            }
            debug!(%dest, "artifact already present");
        } else {
            let mut tmp = NamedTempFile::new_in(&dest_dir).map_err(io_err(&dest_dir))?;
            let mut input = File::open(source).map_err(io_err(source))?;
            io::copy(&mut input, &mut tmp).map_err(io_err(&dest))?;
            tmp.as_file().sync_all().map_err(io_err(&dest))?;
            tmp.persist_noclobber(&dest)
                .map_err(|e| io_err(&dest)(e.error))?;
            debug!(%dest, "uploaded artifact");
        }

        let entry = ArtifactEntry {
            platform: platform.to_string(),
            file_name: file_name.to_string(),
            sha256: sha256.to_string(),
            location: dest.to_string(),
        };
        let mut staged = self.staged(version)?;
        staged.retain(|e| !(e.platform == entry.platform && e.file_name == entry.file_name));
        staged.push(entry.clone());
        write_json_atomic(&self.staging_path(version), &staged, true)?;
        Ok(entry)
    }

    #[instrument(skip(self, record), fields(version = %record.version))]
    fn commit(&self, record: &ReleaseRecord) -> StoreResult<()> {
        let version = record.version.to_string();
        let path = self.record_path(&version);
        if path.exists() {
            return Err(StoreError::RecordExists(version));
        }
        write_json_atomic(&path, record, false)?;

        let staging = self.staging_path(&version);
        match fs::remove_file(&staging) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %staging, error = %e, "could not clear staging file"),
        }
        debug!(%path, "committed release record");
        Ok(())
    }
}
