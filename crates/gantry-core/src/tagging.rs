//! Creating and pushing release tags.

use camino::Utf8Path;
use thiserror::Error;
use tracing::{info, instrument};

use crate::git::{self, GitError};
use crate::version::{VersionError, normalize_tag_input};

/// Errors from tag creation.
#[derive(Error, Debug)]
pub enum TagError {
    /// The requested version is not acceptable as a tag.
    #[error(transparent)]
    Version(#[from] VersionError),

    /// A tag with this name already exists.
    #[error("tag '{0}' already exists")]
    AlreadyExists(String),

    /// A git operation failed.
    #[error(transparent)]
    Git(#[from] GitError),
}

/// Result alias for tagging operations.
pub type TagResult<T> = Result<T, TagError>;

/// Turn user input like `1.2.3` or `v1.2.3-rc1` into a tag name with `prefix`.
pub fn plan_tag(input: &str, prefix: &str) -> TagResult<String> {
    let bare = normalize_tag_input(input)?;
    Ok(format!("{prefix}{bare}"))
}

/// Message recorded on annotated release tags.
pub fn tag_message(name: &str) -> String {
    format!("Release {name}")
}

/// Create annotated tag `name` at HEAD, refusing to overwrite.
#[instrument]
pub fn create_tag(root: &Utf8Path, name: &str) -> TagResult<()> {
    if git::tag_exists(root, name)? {
        return Err(TagError::AlreadyExists(name.to_string()));
    }
    git::create_annotated_tag(root, name, &tag_message(name))?;
    info!(%name, "created release tag");
    Ok(())
}

/// Push tag `name` to `remote`.
#[instrument]
pub fn push(root: &Utf8Path, remote: &str, name: &str) -> TagResult<()> {
    git::push_tag(root, remote, name)?;
    info!(%remote, %name, "pushed release tag");
    Ok(())
}
