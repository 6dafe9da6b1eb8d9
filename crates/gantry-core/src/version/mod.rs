//! Version resolution from repository tags and commits.
//!
//! The resolved version of a working tree is either a release version
//! (HEAD sits exactly on a clean `vX.Y.Z` tag) or a development version
//! derived from the nearest tag, the commit distance, the commit hash, and
//! a dirty marker:
//!
//! ```text
//! v1.2.3, HEAD on tag, clean   -> 1.2.3
//! v1.2.3, 4 commits later      -> 1.2.4-dev.4+gabc1234
//! v1.2.3, 4 commits, dirty     -> 1.2.4-dev.4+gabc1234.dirty
//! no tags, 7 commits           -> 0.0.1-dev.7+gabc1234
//! ```
//!
//! Development versions are pre-releases of the next patch, so they sort
//! strictly after the base release and strictly before the next one.

pub mod tag;

use std::collections::{HashMap, HashSet, VecDeque};

use semver::{BuildMetadata, Prerelease, Version};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::git::{RepoMetadata, RepoState};

pub use tag::{VersionTag, normalize_tag_input, parse_prefixed_release_tag, parse_release_tag};

/// Errors from version operations.
#[derive(Error, Debug)]
pub enum VersionError {
    /// Repository metadata could not be read. Fatal for the whole run.
    #[error("repository unavailable: {0}")]
    RepositoryUnavailable(String),

    /// Failed to parse a semver string.
    #[error("invalid semver: {0}")]
    InvalidSemver(#[from] semver::Error),

    /// The next patch version after the base tag cannot be represented.
    #[error("cannot derive a development version after {0}: patch number overflows")]
    PatchOverflow(Version),

    /// A tag name supplied by the user is not an acceptable version.
    #[error("invalid version tag '{0}': expected X.Y.Z, vX.Y.Z, or vX.Y.Z-suffix")]
    InvalidTag(String),
}

/// Result alias for version operations.
pub type VersionResult<T> = Result<T, VersionError>;

/// Tag prefix recognized when none is configured.
const DEFAULT_PREFIX: &str = "v";

/// Length of the abbreviated commit hash used in development versions.
const SHORT_HASH_LEN: usize = 7;

/// The resolved version of a working tree.
///
/// Computed once per invocation and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionSpec {
    /// Nearest reachable release tag, if any.
    pub base_tag: Option<String>,
    /// Commits between the base tag and HEAD.
    pub distance: usize,
    /// Tracked files have uncommitted modifications.
    pub dirty: bool,
    /// Abbreviated HEAD hash.
    pub commit_hash: String,
    /// Full HEAD hash.
    pub source_commit: String,
    version: Version,
}

impl VersionSpec {
    /// Build a spec from its parts, composing the resolved version.
    pub fn new(
        base: Option<&VersionTag>,
        distance: usize,
        dirty: bool,
        source_commit: &str,
    ) -> VersionResult<Self> {
        let commit_hash: String = source_commit.chars().take(SHORT_HASH_LEN).collect();
        let base_version = base.map_or_else(|| Version::new(0, 0, 0), |t| t.version.clone());

        let version = if base.is_some() && distance == 0 && !dirty {
            base_version
        } else {
            let patch = base_version
                .patch
                .checked_add(1)
                .ok_or_else(|| VersionError::PatchOverflow(base_version.clone()))?;
            let mut dev = Version::new(base_version.major, base_version.minor, patch);
            dev.pre = Prerelease::new(&format!("dev.{distance}"))?;
            let build = if dirty {
                format!("g{commit_hash}.dirty")
            } else {
                format!("g{commit_hash}")
            };
            dev.build = BuildMetadata::new(&build)?;
            dev
        };

        Ok(Self {
            base_tag: base.map(|t| t.name.clone()),
            distance,
            dirty,
            commit_hash,
            source_commit: source_commit.to_string(),
            version,
        })
    }

    /// The resolved version.
    pub const fn version(&self) -> &Version {
        &self.version
    }

    /// HEAD sits exactly on a release tag with a clean tree.
    pub const fn is_release(&self) -> bool {
        self.base_tag.is_some() && self.distance == 0 && !self.dirty
    }

    /// The release version, or `None` for development builds.
    pub fn release_version(&self) -> Option<&Version> {
        self.is_release().then_some(&self.version)
    }

    /// The base tag name, or an empty string when no tag exists.
    pub fn tag(&self) -> &str {
        self.base_tag.as_deref().unwrap_or("")
    }
}

impl std::fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.version)
    }
}

/// Resolve the version of a repository through a metadata provider.
///
/// Any failure to read metadata becomes [`VersionError::RepositoryUnavailable`].
pub fn resolve_repo(provider: &impl RepoMetadata) -> VersionResult<VersionSpec> {
    resolve_repo_with_prefix(provider, DEFAULT_PREFIX)
}

/// Like [`resolve_repo`], also recognizing tags written with `prefix`.
#[instrument(skip(provider))]
pub fn resolve_repo_with_prefix(
    provider: &impl RepoMetadata,
    prefix: &str,
) -> VersionResult<VersionSpec> {
    let state = provider
        .repo_state()
        .map_err(|e| VersionError::RepositoryUnavailable(e.to_string()))?;
    resolve_with_prefix(&state, prefix)
}

/// Resolve a [`VersionSpec`] from a repository snapshot.
///
/// Pure and deterministic: the same state always yields the same spec.
pub fn resolve(state: &RepoState) -> VersionResult<VersionSpec> {
    resolve_with_prefix(state, DEFAULT_PREFIX)
}

/// Like [`resolve`], with release tags written as `<prefix>X.Y.Z`.
///
/// `vX.Y.Z` and `X.Y.Z` tags are recognized whatever the prefix.
#[instrument(skip(state), fields(head = %state.head))]
pub fn resolve_with_prefix(state: &RepoState, prefix: &str) -> VersionResult<VersionSpec> {
    if !state.parents.contains_key(&state.head) {
        return Err(VersionError::RepositoryUnavailable(format!(
            "HEAD {} is missing from the commit history",
            state.head
        )));
    }

    let mut tags_by_commit: HashMap<&str, Vec<VersionTag>> = HashMap::new();
    for tag in &state.tags {
        if let Some(parsed) = parse_prefixed_release_tag(&tag.name, prefix) {
            tags_by_commit
                .entry(tag.commit.as_str())
                .or_default()
                .push(parsed);
        } else {
            debug!(tag = %tag.name, "ignoring non-version tag");
        }
    }

    let nearest = nearest_tag(state, &tags_by_commit);
    let reachable_from_head = ancestors(state, &state.head);
    let distance = match &nearest {
        Some((_, commit)) => reachable_from_head.len() - ancestors(state, commit).len(),
        None => reachable_from_head.len(),
    };

    let spec = VersionSpec::new(
        nearest.as_ref().map(|(tag, _)| tag),
        distance,
        state.dirty,
        &state.head,
    )?;
    debug!(version = %spec.version, base = ?spec.base_tag, distance, dirty = spec.dirty, "resolved version");
    Ok(spec)
}

/// Breadth-first search from HEAD for the shallowest tagged commit.
///
/// All commits at the winning depth are considered; the highest version wins.
fn nearest_tag<'a>(
    state: &'a RepoState,
    tags_by_commit: &HashMap<&str, Vec<VersionTag>>,
) -> Option<(VersionTag, &'a str)> {
    let mut seen: HashSet<&str> = HashSet::from([state.head.as_str()]);
    let mut frontier: Vec<&str> = vec![state.head.as_str()];

    while !frontier.is_empty() {
        let best = frontier
            .iter()
            .filter_map(|commit| {
                tags_by_commit
                    .get(commit)
                    .into_iter()
                    .flatten()
                    .max_by(|a, b| a.precedence(b))
                    .map(|tag| (tag, *commit))
            })
            .max_by(|(a, _), (b, _)| a.precedence(b));
        if let Some((tag, commit)) = best {
            return Some((tag.clone(), commit));
        }

        let mut next = Vec::new();
        for commit in frontier {
            for parent in state.parents.get(commit).into_iter().flatten() {
                if seen.insert(parent.as_str()) {
                    next.push(parent.as_str());
                }
            }
        }
        frontier = next;
    }
    None
}

/// Every commit reachable from `start`, including itself.
fn ancestors<'a>(state: &'a RepoState, start: &'a str) -> HashSet<&'a str> {
    let mut seen = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(commit) = queue.pop_front() {
        for parent in state.parents.get(commit).into_iter().flatten() {
            if seen.insert(parent.as_str()) {
                queue.push_back(parent.as_str());
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::git::{GitRepo, TagRef, testing};

    /// Linear history `c0 <- c1 <- ... <- c{n-1}` with HEAD at the tip.
    fn linear(n: usize) -> RepoState {
        let mut state = RepoState::default();
        for i in 0..n {
            let parents = if i == 0 {
                vec![]
            } else {
                vec![hash(i - 1)]
            };
            state.parents.insert(hash(i), parents);
        }
        state.head = hash(n - 1);
        state
    }

    fn hash(i: usize) -> String {
        format!("{i:0>40}")
    }

    fn tag(state: &mut RepoState, name: &str, commit: usize) {
        state.tags.push(TagRef {
            name: name.into(),
            commit: hash(commit),
        });
    }

    #[test]
    fn exactly_on_clean_tag_is_release() {
        let mut state = linear(3);
        tag(&mut state, "v1.2.3", 2);
        let spec = resolve(&state).unwrap();
        assert_eq!(spec.version(), &Version::new(1, 2, 3));
        assert_eq!(spec.distance, 0);
        assert!(spec.is_release());
        assert_eq!(spec.release_version(), Some(&Version::new(1, 2, 3)));
        assert_eq!(spec.tag(), "v1.2.3");
    }

    #[test]
    fn dirty_dev_version_sorts_between_releases() {
        let mut state = linear(6);
        tag(&mut state, "v1.2.3", 1);
        state.dirty = true;
        let spec = resolve(&state).unwrap();

        assert_eq!(spec.distance, 4);
        assert!(!spec.is_release());
        assert!(spec.release_version().is_none());
        assert_eq!(spec.version().to_string(), "1.2.4-dev.4+g0000000.dirty");
        assert!(spec.version() > &Version::new(1, 2, 3));
        assert!(spec.version() < &Version::new(1, 2, 4));
    }

    #[test]
    fn dirty_on_tag_is_not_release() {
        let mut state = linear(1);
        tag(&mut state, "v1.0.0", 0);
        state.dirty = true;
        let spec = resolve(&state).unwrap();
        assert!(!spec.is_release());
        assert_eq!(spec.distance, 0);
    }

    #[test]
    fn no_tags_counts_all_commits() {
        let state = linear(7);
        let spec = resolve(&state).unwrap();
        assert!(spec.base_tag.is_none());
        assert_eq!(spec.distance, 7);
        assert_eq!(spec.version().to_string(), "0.0.1-dev.7+g0000000");
    }

    #[test]
    fn same_commit_prefers_highest_numeric_version() {
        let mut state = linear(2);
        tag(&mut state, "v1.9.0", 1);
        tag(&mut state, "v1.10.0", 1);
        tag(&mut state, "nightly", 1);
        let spec = resolve(&state).unwrap();
        assert_eq!(spec.tag(), "v1.10.0");
    }

    #[test]
    fn equal_versions_prefer_prefixed_spelling() {
        let mut state = linear(2);
        tag(&mut state, "1.2.3", 1);
        tag(&mut state, "v1.2.3", 1);
        assert_eq!(resolve(&state).unwrap().tag(), "v1.2.3");

        state.tags.reverse();
        assert_eq!(resolve(&state).unwrap().tag(), "v1.2.3");
    }

    #[test]
    fn nearest_tag_wins_over_higher_older_tag() {
        let mut state = linear(5);
        tag(&mut state, "v9.0.0", 0);
        tag(&mut state, "v1.1.0", 3);
        let spec = resolve(&state).unwrap();
        assert_eq!(spec.tag(), "v1.1.0");
        assert_eq!(spec.distance, 1);
    }

    #[test]
    fn merge_history_counts_commits_not_on_tag() {
        // base <- a <- merge
        //      \- b <-/
        let mut state = RepoState::default();
        state.parents.insert(hash(0), vec![]);
        state.parents.insert(hash(1), vec![hash(0)]);
        state.parents.insert(hash(2), vec![hash(0)]);
        state.parents.insert(hash(3), vec![hash(1), hash(2)]);
        state.head = hash(3);
        tag(&mut state, "v2.0.0", 0);

        let spec = resolve(&state).unwrap();
        assert_eq!(spec.tag(), "v2.0.0");
        assert_eq!(spec.distance, 3);
    }

    #[test]
    fn resolve_is_deterministic() {
        let mut state = linear(4);
        tag(&mut state, "v0.3.0", 1);
        assert_eq!(resolve(&state).unwrap(), resolve(&state).unwrap());
    }

    #[test]
    fn configured_prefix_tags_are_release_tags() {
        let mut state = linear(2);
        tag(&mut state, "release-1.2.3", 1);
        assert!(resolve(&state).unwrap().base_tag.is_none());

        let spec = resolve_with_prefix(&state, "release-").unwrap();
        assert!(spec.is_release());
        assert_eq!(spec.version(), &Version::new(1, 2, 3));
        assert_eq!(spec.tag(), "release-1.2.3");
    }

    #[test]
    fn patch_overflow_is_an_error() {
        let mut state = linear(2);
        tag(&mut state, &format!("v1.2.{}", u64::MAX), 0);
        assert!(matches!(
            resolve(&state),
            Err(VersionError::PatchOverflow(v)) if v.patch == u64::MAX
        ));

        // Sitting exactly on the tag needs no increment.
        let mut on_tag = linear(1);
        tag(&mut on_tag, &format!("v1.2.{}", u64::MAX), 0);
        assert!(resolve(&on_tag).unwrap().is_release());
    }

    #[test]
    fn missing_head_is_unavailable() {
        let state = RepoState::default();
        assert!(matches!(
            resolve(&state),
            Err(VersionError::RepositoryUnavailable(_))
        ));
    }

    #[test]
    fn resolve_repo_maps_git_errors() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let err = resolve_repo(&GitRepo::new(root)).unwrap_err();
        assert!(matches!(err, VersionError::RepositoryUnavailable(_)));
    }

    #[test]
    fn resolves_real_repository() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        testing::init(&root);
        for i in 0..5 {
            testing::commit(&root, &format!("commit {i}"));
        }
        testing::run(&root, &["tag", "-a", "v1.0.0", "-m", "Release v1.0.0"]);

        let spec = resolve_repo(&GitRepo::new(root.clone())).unwrap();
        assert_eq!(spec.version(), &Version::new(1, 0, 0));
        assert!(spec.is_release());

        let head = testing::commit(&root, "after release");
        let spec = resolve_repo(&GitRepo::new(root)).unwrap();
        assert_eq!(spec.distance, 1);
        assert_eq!(spec.source_commit, head);
        assert_eq!(spec.commit_hash, &head[..7]);
    }
}
