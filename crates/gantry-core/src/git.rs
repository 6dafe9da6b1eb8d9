//! Repository metadata and tag operations.
//!
//! Shells out to `git` for all operations. This ensures we inherit the user's
//! SSH keys, GPG signing, hooks, and other configuration.

use std::collections::HashMap;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors from git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// Failed to execute the `git` command.
    #[error("failed to run git: {0}")]
    Exec(#[from] std::io::Error),

    /// `git` returned a non-zero exit code.
    #[error("git {command} failed: {stderr}")]
    Command {
        /// The git subcommand that failed (e.g., "status").
        command: String,
        /// Captured stderr.
        stderr: String,
    },

    /// Not inside a git repository.
    #[error("not a git repository (or any parent up to mount point)")]
    NotARepo,

    /// The repository exists but HEAD has no commits yet.
    #[error("repository has no commits")]
    NoCommits,

    /// `git` printed something we could not make sense of.
    #[error("unexpected git output: {0}")]
    Parse(String),
}

/// Result alias for git operations.
pub type GitResult<T> = Result<T, GitError>;

/// A tag and the commit it ultimately points to.
///
/// Annotated tags are peeled, so `commit` is always a commit hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagRef {
    /// Tag name without the `refs/tags/` prefix.
    pub name: String,
    /// Full hash of the tagged commit.
    pub commit: String,
}

/// Snapshot of everything version resolution needs from a repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoState {
    /// Full hash of HEAD.
    pub head: String,
    /// Parent hashes for every commit reachable from HEAD.
    pub parents: HashMap<String, Vec<String>>,
    /// All tags in the repository.
    pub tags: Vec<TagRef>,
    /// Whether tracked files have uncommitted modifications.
    pub dirty: bool,
}

/// Source of repository metadata.
///
/// [`GitRepo`] reads a real checkout; tests supply a fixed [`RepoState`].
pub trait RepoMetadata {
    /// Read the current repository state.
    fn repo_state(&self) -> GitResult<RepoState>;
}

impl RepoMetadata for RepoState {
    fn repo_state(&self) -> GitResult<RepoState> {
        Ok(self.clone())
    }
}

/// A git checkout on disk.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: Utf8PathBuf,
}

impl GitRepo {
    /// Wrap the checkout containing `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory git commands run from.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }
}

impl RepoMetadata for GitRepo {
    fn repo_state(&self) -> GitResult<RepoState> {
        read_repo_state(&self.root)
    }
}

/// Read HEAD, the commit graph, tags, and dirtiness for the repo at `root`.
#[instrument]
pub fn read_repo_state(root: &Utf8Path) -> GitResult<RepoState> {
    let head = match git_in(root, &["rev-parse", "--verify", "--quiet", "HEAD"]) {
        Ok(out) => out.trim().to_string(),
        Err(GitError::Command { .. }) => return Err(GitError::NoCommits),
        Err(e) => return Err(e),
    };

    let parents = parse_parent_lines(&git_in(root, &["rev-list", "--parents", "HEAD"])?);
    let tags = parse_tag_lines(&git_in(
        root,
        &[
            "for-each-ref",
            "--format=%(refname:strip=2)%09%(objectname)%09%(*objectname)",
            "refs/tags",
        ],
    )?)?;
    let dirty = !git_in(root, &["status", "--porcelain", "--untracked-files=no"])?
        .trim()
        .is_empty();

    debug!(%head, commits = parents.len(), tags = tags.len(), dirty, "repository state");
    Ok(RepoState {
        head,
        parents,
        tags,
        dirty,
    })
}

fn parse_parent_lines(output: &str) -> HashMap<String, Vec<String>> {
    output
        .lines()
        .filter_map(|line| {
            let mut hashes = line.split_whitespace().map(str::to_string);
            let commit = hashes.next()?;
            Some((commit, hashes.collect()))
        })
        .collect()
}

fn parse_tag_lines(output: &str) -> GitResult<Vec<TagRef>> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut fields = line.split('\t');
            let (Some(name), Some(object)) = (fields.next(), fields.next()) else {
                return Err(GitError::Parse(line.to_string()));
            };
            let peeled = fields.next().unwrap_or("").trim();
            let commit = if peeled.is_empty() { object } else { peeled };
            Ok(TagRef {
                name: name.to_string(),
                commit: commit.trim().to_string(),
            })
        })
        .collect()
}

/// Check if `root` is inside a git work tree.
#[instrument]
pub fn is_inside_repo(root: &Utf8Path) -> GitResult<bool> {
    match git_in(root, &["rev-parse", "--is-inside-work-tree"]) {
        Ok(output) => Ok(output.trim() == "true"),
        Err(GitError::Command { .. } | GitError::NotARepo) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Top-level directory of the work tree containing `dir`.
#[instrument]
pub fn toplevel(dir: &Utf8Path) -> GitResult<Utf8PathBuf> {
    let out = git_in(dir, &["rev-parse", "--show-toplevel"])?;
    Ok(Utf8PathBuf::from(out.trim()))
}

/// Whether a tag with this exact name exists.
#[instrument]
pub fn tag_exists(root: &Utf8Path, name: &str) -> GitResult<bool> {
    let refname = format!("refs/tags/{name}");
    match git_in(root, &["rev-parse", "--verify", "--quiet", &refname]) {
        Ok(_) => Ok(true),
        Err(GitError::Command { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Create an annotated tag at HEAD.
#[instrument]
pub fn create_annotated_tag(root: &Utf8Path, name: &str, message: &str) -> GitResult<()> {
    git_in(root, &["tag", "-a", name, "-m", message])?;
    debug!(%name, "created tag");
    Ok(())
}

/// Push a single tag to `remote`.
#[instrument]
pub fn push_tag(root: &Utf8Path, remote: &str, name: &str) -> GitResult<()> {
    let refspec = format!("refs/tags/{name}");
    git_in(root, &["push", remote, &refspec])?;
    debug!(%remote, %name, "pushed tag");
    Ok(())
}

/// Run a git command in `root` and return its stdout.
fn git_in(root: &Utf8Path, args: &[&str]) -> GitResult<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root.as_std_path())
        .args(args)
        .output()?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if stderr.contains("not a git repository") {
            return Err(GitError::NotARepo);
        }

        Err(GitError::Command {
            command: args.first().unwrap_or(&"").to_string(),
            stderr,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn temp_repo() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        testing::init(&root);
        (dir, root)
    }

    #[test]
    fn empty_repo_has_no_commits() {
        let (_dir, root) = temp_repo();
        let err = read_repo_state(&root).unwrap_err();
        assert!(matches!(err, GitError::NoCommits), "got {err:?}");
    }

    #[test]
    fn non_repo_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        assert!(!is_inside_repo(root).unwrap());
        assert!(read_repo_state(root).is_err());
    }

    #[test]
    fn reads_commits_and_peeled_tags() {
        let (_dir, root) = temp_repo();
        let first = testing::commit(&root, "first");
        testing::run(&root, &["tag", "-a", "v0.1.0", "-m", "Release v0.1.0"]);
        let second = testing::commit(&root, "second");
        testing::run(&root, &["tag", "light"]);

        let state = read_repo_state(&root).unwrap();
        assert_eq!(state.head, second);
        assert_eq!(state.parents[&second], vec![first.clone()]);
        assert!(state.parents[&first].is_empty());
        assert!(!state.dirty);

        let annotated = state.tags.iter().find(|t| t.name == "v0.1.0").unwrap();
        assert_eq!(annotated.commit, first);
        let light = state.tags.iter().find(|t| t.name == "light").unwrap();
        assert_eq!(light.commit, second);
    }

    #[test]
    fn modified_tracked_file_is_dirty() {
        let (_dir, root) = temp_repo();
        std::fs::write(root.join("file.txt"), "one").unwrap();
        testing::run(&root, &["add", "file.txt"]);
        testing::commit(&root, "add file");
        std::fs::write(root.join("untracked.txt"), "ignored").unwrap();
        assert!(!read_repo_state(&root).unwrap().dirty);

        std::fs::write(root.join("file.txt"), "two").unwrap();
        assert!(read_repo_state(&root).unwrap().dirty);
    }

    #[test]
    fn tag_lifecycle() {
        let (_dir, root) = temp_repo();
        testing::commit(&root, "first");
        assert!(!tag_exists(&root, "v1.0.0").unwrap());
        create_annotated_tag(&root, "v1.0.0", "Release v1.0.0").unwrap();
        assert!(tag_exists(&root, "v1.0.0").unwrap());
        assert!(create_annotated_tag(&root, "v1.0.0", "again").is_err());
    }

    #[test]
    fn parse_tag_lines_prefers_peeled_target() {
        let tags = parse_tag_lines("v1.0.0\taaa\tbbb\nlight\tccc\t\n").unwrap();
        assert_eq!(tags[0].commit, "bbb");
        assert_eq!(tags[1].commit, "ccc");
    }

    #[test]
    fn parse_tag_lines_rejects_garbage() {
        assert!(matches!(
            parse_tag_lines("no-tabs-here"),
            Err(GitError::Parse(_))
        ));
    }

    #[test]
    fn git_error_on_bad_command() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        assert!(git_in(root, &["not-a-real-subcommand"]).is_err());
    }
}
