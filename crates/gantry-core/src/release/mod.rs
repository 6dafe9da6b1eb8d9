//! Release records and publication.
//!
//! [`ReleaseCoordinator::release`] turns a successful [`PipelineRun`] into a
//! durable [`ReleaseRecord`]: it collects platform artifacts, checksums
//! them, uploads what the store does not already hold, and commits the
//! record. Everything happens under a per-version lock, and a version is
//! released at most once.

pub mod checksum;
pub mod store;

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::pipeline::{PipelineRun, Verdict};
use crate::stage::StageStatus;

pub use store::{ArtifactStore, FsArtifactStore, StoreError, StoreResult, VersionLock};

/// Errors from the release coordinator.
#[derive(Error, Debug)]
pub enum ReleaseError {
    /// The run or target does not satisfy release preconditions.
    #[error("not releasable: {0}")]
    NotReleasable(String),

    /// A record for this version already exists.
    #[error("version {0} is already released")]
    AlreadyReleased(Version),

    /// A previous attempt uploaded a different file under the same name.
    #[error("artifact {platform}/{file_name} was already uploaded with a different checksum")]
    ArtifactConflict {
        /// Platform identifier.
        platform: String,
        /// Artifact file name.
        file_name: String,
    },

    /// Reading an artifact for checksumming failed.
    #[error("cannot read artifact {path}: {source}")]
    Artifact {
        /// Artifact path.
        path: Utf8PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Artifact storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result alias for release operations.
pub type ReleaseResult<T> = Result<T, ReleaseError>;

/// One stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Platform identifier.
    pub platform: String,
    /// File name within the platform directory.
    pub file_name: String,
    /// Hex SHA-256 of the contents.
    pub sha256: String,
    /// Where the store put it.
    pub location: String,
}

/// The immutable record of a published version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    /// Released version.
    pub version: Version,
    /// Tag the release was built from.
    pub tag: String,
    /// Full commit hash.
    pub source_commit: String,
    /// Artifacts by platform.
    pub artifact_manifest: BTreeMap<String, Vec<ArtifactEntry>>,
    /// When the record was committed.
    pub created_at: DateTime<Utc>,
}

/// Publishes releases into an [`ArtifactStore`].
#[derive(Debug)]
pub struct ReleaseCoordinator<S> {
    store: S,
}

impl<S: ArtifactStore> ReleaseCoordinator<S> {
    /// Coordinator writing to `store`.
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Publish `run` as `target`.
    ///
    /// Preconditions are checked before anything is written: the run must
    /// have completed with [`Verdict::Success`] and its version must be the
    /// release form of `target`. A retry after a partial publication skips
    /// artifacts that were already uploaded with the same checksum.
    #[instrument(skip(self, run), fields(run = %run.id))]
    pub fn release(&self, run: &PipelineRun, target: &Version) -> ReleaseResult<ReleaseRecord> {
        check_releasable(run, target)?;
        let key = target.to_string();

        let _lock = self.store.lock(&key)?;
        if self.store.load_record(&key)?.is_some() {
            return Err(ReleaseError::AlreadyReleased(target.clone()));
        }

        let staged = self.store.staged(&key)?;
        let mut manifest: BTreeMap<String, Vec<ArtifactEntry>> = BTreeMap::new();
        for (platform, path) in platform_artifacts(run) {
            let sha256 = checksum::sha256_file(&path).map_err(|source| ReleaseError::Artifact {
                path: path.clone(),
                source,
            })?;
            let file_name = path.file_name().unwrap_or_default();

            let previous = staged
                .iter()
                .find(|e| e.platform == platform && e.file_name == file_name);
            let entry = match previous {
                Some(entry) if entry.sha256 == sha256 => {
                    debug!(%platform, %file_name, "already uploaded");
                    entry.clone()
                }
                Some(_) => {
                    return Err(ReleaseError::ArtifactConflict {
                        platform,
                        file_name: file_name.to_string(),
                    });
                }
                None => match self.store.upload(&key, &platform, &path, &sha256) {
                    Ok(entry) => entry,
                    Err(StoreError::Conflict(_)) => {
                        return Err(ReleaseError::ArtifactConflict {
                            platform,
                            file_name: file_name.to_string(),
                        });
                    }
                    Err(e) => return Err(e.into()),
                },
            };
            manifest.entry(platform).or_default().push(entry);
        }

        let record = ReleaseRecord {
            version: target.clone(),
            tag: run.version.tag().to_string(),
            source_commit: run.version.source_commit.clone(),
            artifact_manifest: manifest,
            created_at: Utc::now(),
        };
        self.store.commit(&record)?;
        info!(version = %record.version, platforms = record.artifact_manifest.len(), "release recorded");
        Ok(record)
    }
}

/// Check release preconditions without side effects.
pub fn check_releasable(run: &PipelineRun, target: &Version) -> ReleaseResult<()> {
    match run.verdict() {
        Some(Verdict::Success) => {}
        Some(verdict) => {
            return Err(ReleaseError::NotReleasable(format!(
                "pipeline verdict is {verdict}"
            )));
        }
        None => {
            return Err(ReleaseError::NotReleasable(
                "pipeline run has not completed".to_string(),
            ));
        }
    }
    match run.version.release_version() {
        Some(version) if version == target => Ok(()),
        Some(version) => Err(ReleaseError::NotReleasable(format!(
            "target {target} does not match the checked-out release {version}"
        ))),
        None => Err(ReleaseError::NotReleasable(format!(
            "working tree is not exactly at a clean release tag (resolved {})",
            run.version.version()
        ))),
    }
}

/// Artifacts from succeeded stages that declare a platform.
fn platform_artifacts(run: &PipelineRun) -> Vec<(String, Utf8PathBuf)> {
    run.stages
        .iter()
        .filter(|s| s.status == StageStatus::Succeeded)
        .filter_map(|s| s.platform.as_ref().map(|p| (p, &s.artifacts)))
        .flat_map(|(platform, paths)| paths.iter().map(|p| (platform.clone(), p.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::fs;

    use camino::Utf8Path;

    use super::*;
    use crate::pipeline::StageGraph;
    use crate::stage::{FailureKind, StageDefinition, StageResult};
    use crate::version::{VersionSpec, parse_release_tag};

    fn spec_at(tag: &str, distance: usize) -> VersionSpec {
        let tag = parse_release_tag(tag).unwrap();
        VersionSpec::new(Some(&tag), distance, false, "0123456789abcdef").unwrap()
    }

    /// A completed run whose build stages produced the given artifacts.
    fn completed_run(
        spec: VersionSpec,
        builds: &[(&str, Vec<Utf8PathBuf>)],
        fail: Option<&str>,
    ) -> PipelineRun {
        let defs: Vec<StageDefinition> = builds
            .iter()
            .map(|(platform, _)| StageDefinition::new(format!("build-{platform}"), "x").for_platform(*platform))
            .collect();
        let graph = StageGraph::new(defs).unwrap();
        let mut run = PipelineRun::new("run-1", spec, &graph);
        run.start().unwrap();
        for (result, (platform, artifacts)) in run.stages.iter_mut().zip(builds) {
            finish(result, fail == Some(*platform), artifacts.clone());
        }
        run.complete().unwrap();
        run
    }

    fn finish(result: &mut StageResult, fail: bool, artifacts: Vec<Utf8PathBuf>) {
        result.start().unwrap();
        if fail {
            result.fail(FailureKind::Timeout, None).unwrap();
        } else {
            result.succeed(artifacts).unwrap();
        }
    }

    fn write(dir: &Utf8Path, name: &str, contents: &str) -> Utf8PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn workspace() -> (tempfile::TempDir, Utf8PathBuf) {
        let tmp = tempfile::TempDir::new().unwrap();
        let base = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        (tmp, base)
    }

    #[test]
    fn releases_with_checksum_manifest() {
        let (_tmp, base) = workspace();
        let linux = write(&base, "app-linux.tar.gz", "linux");
        let macos = write(&base, "app-macos.tar.gz", "macos");
        let run = completed_run(
            spec_at("v1.0.0", 0),
            &[("linux", vec![linux.clone()]), ("macos", vec![macos])],
            None,
        );
        let coordinator = ReleaseCoordinator::new(FsArtifactStore::new(base.join("store")));

        let record = coordinator.release(&run, &Version::new(1, 0, 0)).unwrap();
        assert_eq!(record.tag, "v1.0.0");
        assert_eq!(record.source_commit, "0123456789abcdef");
        assert_eq!(record.artifact_manifest.len(), 2);
        let entry = &record.artifact_manifest["linux"][0];
        assert_eq!(entry.sha256, checksum::sha256_file(&linux).unwrap());
        assert!(Utf8Path::new(&entry.location).exists());
        assert_eq!(
            coordinator.store().load_record("1.0.0").unwrap(),
            Some(record)
        );
    }

    #[test]
    fn second_release_is_rejected_and_manifest_kept() {
        let (_tmp, base) = workspace();
        let linux = write(&base, "app.tar.gz", "linux");
        let run = completed_run(spec_at("v1.0.0", 0), &[("linux", vec![linux.clone()])], None);
        let coordinator = ReleaseCoordinator::new(FsArtifactStore::new(base.join("store")));
        let first = coordinator.release(&run, &Version::new(1, 0, 0)).unwrap();

        fs::write(&linux, "tampered").unwrap();
        let err = coordinator.release(&run, &Version::new(1, 0, 0)).unwrap_err();
        assert!(matches!(err, ReleaseError::AlreadyReleased(v) if v == Version::new(1, 0, 0)));
        assert_eq!(
            coordinator.store().load_record("1.0.0").unwrap(),
            Some(first)
        );
    }

    #[test]
    fn failed_run_is_not_releasable() {
        let (_tmp, base) = workspace();
        let run = completed_run(
            spec_at("v1.0.0", 0),
            &[("linux", vec![]), ("windows", vec![])],
            Some("windows"),
        );
        let store_root = base.join("store");
        let coordinator = ReleaseCoordinator::new(FsArtifactStore::new(&store_root));
        let err = coordinator.release(&run, &Version::new(1, 0, 0)).unwrap_err();
        assert!(matches!(err, ReleaseError::NotReleasable(_)));
        assert!(!store_root.exists());
    }

    #[test]
    fn dev_version_is_not_releasable() {
        let (_tmp, base) = workspace();
        let run = completed_run(spec_at("v1.0.0", 3), &[], None);
        let coordinator = ReleaseCoordinator::new(FsArtifactStore::new(base.join("store")));
        let err = coordinator.release(&run, &Version::new(1, 0, 0)).unwrap_err();
        assert!(err.to_string().contains("not exactly at a clean release tag"));
    }

    #[test]
    fn target_must_match_tag() {
        let (_tmp, base) = workspace();
        let run = completed_run(spec_at("v1.0.0", 0), &[], None);
        let coordinator = ReleaseCoordinator::new(FsArtifactStore::new(base.join("store")));
        let err = coordinator.release(&run, &Version::new(2, 0, 0)).unwrap_err();
        assert!(matches!(err, ReleaseError::NotReleasable(_)));
    }

    #[test]
    fn no_artifacts_gives_empty_manifest() {
        let (_tmp, base) = workspace();
        let run = completed_run(spec_at("v0.1.0", 0), &[], None);
        let coordinator = ReleaseCoordinator::new(FsArtifactStore::new(base.join("store")));
        let record = coordinator.release(&run, &Version::new(0, 1, 0)).unwrap();
        assert!(record.artifact_manifest.is_empty());
    }

    /// Filesystem store that fails the Nth upload.
    struct Flaky {
        inner: FsArtifactStore,
        fail_on: Cell<Option<usize>>,
        uploads: Cell<usize>,
    }

    impl ArtifactStore for Flaky {
        type Guard = VersionLock;

        fn lock(&self, version: &str) -> StoreResult<VersionLock> {
            self.inner.lock(version)
        }

        fn load_record(&self, version: &str) -> StoreResult<Option<ReleaseRecord>> {
            self.inner.load_record(version)
        }

        fn staged(&self, version: &str) -> StoreResult<Vec<ArtifactEntry>> {
            self.inner.staged(version)
        }

        fn upload(
            &self,
            version: &str,
            platform: &str,
            source: &Utf8Path,
            sha256: &str,
        ) -> StoreResult<ArtifactEntry> {
            let n = self.uploads.get() + 1;
            self.uploads.set(n);
            if self.fail_on.get() == Some(n) {
                return Err(StoreError::Io {
                    path: source.to_path_buf(),
                    source: std::io::Error::other("network down"),
                });
            }
            self.inner.upload(version, platform, source, sha256)
        }

        fn commit(&self, record: &ReleaseRecord) -> StoreResult<()> {
            self.inner.commit(record)
        }
    }

    #[test]
    fn retry_after_partial_publication_does_not_reupload() {
        let (_tmp, base) = workspace();
        let builds: Vec<(&str, Vec<Utf8PathBuf>)> = ["linux", "macos", "windows", "freebsd"]
            .into_iter()
            .map(|p| (p, vec![write(&base, &format!("app-{p}.tar.gz"), p)]))
            .collect();
        let run = completed_run(spec_at("v3.1.4", 0), &builds, None);
        let coordinator = ReleaseCoordinator::new(Flaky {
            inner: FsArtifactStore::new(base.join("store")),
            fail_on: Cell::new(Some(4)),
            uploads: Cell::new(0),
        });
        let target = Version::new(3, 1, 4);

        let err = coordinator.release(&run, &target).unwrap_err();
        assert!(matches!(err, ReleaseError::Store(_)));
        assert!(coordinator.store().load_record("3.1.4").unwrap().is_none());
        assert_eq!(coordinator.store().staged("3.1.4").unwrap().len(), 3);

        coordinator.store().fail_on.set(None);
        let record = coordinator.release(&run, &target).unwrap();
        assert_eq!(record.artifact_manifest.len(), 4);
        assert_eq!(coordinator.store().uploads.get(), 5);
        assert!(coordinator.store().staged("3.1.4").unwrap().is_empty());
    }

    #[test]
    fn changed_artifact_after_partial_publication_conflicts() {
        let (_tmp, base) = workspace();
        let linux = write(&base, "app-linux.tar.gz", "v1");
        let windows = write(&base, "app-windows.tar.gz", "win");
        let run = completed_run(
            spec_at("v1.0.0", 0),
            &[("linux", vec![linux.clone()]), ("windows", vec![windows])],
            None,
        );
        let coordinator = ReleaseCoordinator::new(Flaky {
            inner: FsArtifactStore::new(base.join("store")),
            fail_on: Cell::new(Some(2)),
            uploads: Cell::new(0),
        });
        let target = Version::new(1, 0, 0);
        assert!(coordinator.release(&run, &target).is_err());

        fs::write(&linux, "rebuilt differently").unwrap();
        coordinator.store().fail_on.set(None);
        let err = coordinator.release(&run, &target).unwrap_err();
        assert!(matches!(err, ReleaseError::ArtifactConflict { platform, .. } if platform == "linux"));
    }

    #[test]
    fn concurrent_releases_of_one_version_publish_once() {
        let (_tmp, base) = workspace();
        let linux = write(&base, "app.tar.gz", "linux");
        let run = completed_run(spec_at("v1.0.0", 0), &[("linux", vec![linux])], None);
        let store_root = base.join("store");
        let target = Version::new(1, 0, 0);

        let outcomes: Vec<ReleaseResult<ReleaseRecord>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        ReleaseCoordinator::new(FsArtifactStore::new(&store_root))
                            .release(&run, &target)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let successes = outcomes.iter().filter(|o| o.is_ok()).count();
        let rejected = outcomes
            .iter()
            .filter(|o| matches!(o, Err(ReleaseError::AlreadyReleased(_))))
            .count();
        assert_eq!((successes, rejected), (1, 3));
    }
}
