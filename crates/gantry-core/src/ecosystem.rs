//! Ecosystem types and the default stage graphs that go with them.
//!
//! Detection logic lives in [`crate::detect`]; this module is pure types and
//! data.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::stage::StageDefinition;

/// A recognized project ecosystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    /// Python project (detected via `pyproject.toml`).
    Python,
    /// Rust project (detected via `Cargo.toml`).
    Rust,
    /// Node.js project (detected via `package.json`).
    Node,
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Python => write!(f, "python"),
            Self::Rust => write!(f, "rust"),
            Self::Node => write!(f, "node"),
        }
    }
}

impl Ecosystem {
    /// Filename that signals this ecosystem when found in a directory.
    pub const fn marker_file(self) -> &'static str {
        match self {
            Self::Python => "pyproject.toml",
            Self::Rust => "Cargo.toml",
            Self::Node => "package.json",
        }
    }

    /// All recognized ecosystems, in detection priority order.
    pub const ALL: &[Self] = &[Self::Python, Self::Rust, Self::Node];

    /// Stage graph used when the project configures no `[[stages]]`.
    pub fn default_stages(self) -> Vec<StageDefinition> {
        match self {
            Self::Python => vec![
                StageDefinition::new("lint", "ruff check .").in_group("lint"),
                StageDefinition::new("format", "ruff format --check .").in_group("lint"),
                StageDefinition::new("typecheck", "mypy .").in_group("lint"),
                StageDefinition::new("test", "pytest").after(["lint"]),
                StageDefinition::new("bench", "pytest --benchmark-only")
                    .after(["test"])
                    .advisory(),
                StageDefinition::new("build", "python -m build")
                    .after(["test"])
                    .for_platform("any")
                    .with_artifacts(["dist/*.whl", "dist/*.tar.gz"]),
            ],
            Self::Rust => vec![
                StageDefinition::new("lint", "cargo clippy --all-targets -- -D warnings")
                    .in_group("lint"),
                StageDefinition::new("format", "cargo fmt --all -- --check").in_group("lint"),
                StageDefinition::new("test", "cargo test").after(["lint"]),
                StageDefinition::new("build", "cargo build --release").after(["test"]),
            ],
            Self::Node => vec![
                StageDefinition::new("lint", "npm run lint"),
                StageDefinition::new("test", "npm test").after(["lint"]),
                StageDefinition::new("build", "npm run build").after(["test"]),
                StageDefinition::new("pack", "npm pack")
                    .after(["build"])
                    .for_platform("any")
                    .with_artifacts(["*.tgz"]),
            ],
        }
    }
}
