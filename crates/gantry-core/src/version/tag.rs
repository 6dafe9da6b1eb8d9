//! Parsing of version-shaped tag names.

use std::cmp::Ordering;

use semver::Version;
use serde::Serialize;

use crate::version::{VersionError, VersionResult};

/// A tag whose name is a plain `MAJOR.MINOR.PATCH`, optionally prefixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionTag {
    /// Tag name as it appears in the repository.
    pub name: String,
    /// Parsed version.
    pub version: Version,
}

impl VersionTag {
    fn has_prefix(&self) -> bool {
        !self.name.starts_with(|c: char| c.is_ascii_digit())
    }

    /// Ordering used to pick between competing tags.
    ///
    /// Higher versions win; `v1.2.3` beats `1.2.3`; remaining ties fall back
    /// to the name so the result never depends on input order.
    pub fn precedence(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.has_prefix().cmp(&other.has_prefix()))
            .then_with(|| other.name.cmp(&self.name))
    }
}

/// Parse a tag name of the form `vX.Y.Z` or `X.Y.Z`.
///
/// Anything else (pre-release suffixes, extra components, leading zeros)
/// returns `None` and is ignored by version resolution.
pub fn parse_release_tag(name: &str) -> Option<VersionTag> {
    parse_prefixed_release_tag(name, "v")
}

/// Parse a release tag written with `prefix`, e.g. `release-1.2.3`.
///
/// The `v` and bare spellings are always recognized as well.
pub fn parse_prefixed_release_tag(name: &str, prefix: &str) -> Option<VersionTag> {
    let bare = match name.strip_prefix(prefix) {
        Some(rest) if !prefix.is_empty() => rest,
        _ => name.strip_prefix('v').unwrap_or(name),
    };
    let (major, minor, patch) = parse_triple(bare)?;
    Some(VersionTag {
        name: name.to_string(),
        version: Version::new(major, minor, patch),
    })
}

/// Validate user input for a new tag and return its bare version text.
///
/// Accepts `X.Y.Z` with an optional `v` prefix and an optional single
/// alphanumeric pre-release suffix, e.g. `v1.2.0-rc1`.
pub fn normalize_tag_input(input: &str) -> VersionResult<String> {
    let trimmed = input.trim();
    let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let (core, suffix) = match bare.split_once('-') {
        Some((core, suffix)) => (core, Some(suffix)),
        None => (bare, None),
    };

    let valid_suffix =
        suffix.is_none_or(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric()));
    if parse_triple(core).is_none() || !valid_suffix {
        return Err(VersionError::InvalidTag(input.to_string()));
    }
    // Round-trip through semver so the result is always a valid version.
    Version::parse(bare)?;
    Ok(bare.to_string())
}

fn parse_triple(s: &str) -> Option<(u64, u64, u64)> {
    let mut parts = s.split('.');
    let major = parse_component(parts.next()?)?;
    let minor = parse_component(parts.next()?)?;
    let patch = parse_component(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

fn parse_component(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}
