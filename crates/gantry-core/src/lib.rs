//! Core library for gantry.
//!
//! This crate provides the version resolver, stage runner, pipeline
//! orchestrator, and release coordinator used by the `gantry` CLI and any
//! downstream consumers.
//!
//! # Modules
//!
//! - [`cancel`] - Cooperative cancellation shared across a run
//! - [`clean`] - Build artifact removal
//! - [`config`] - Configuration loading and management
//! - [`detect`] - Project ecosystem detection and default stages
//! - [`ecosystem`] - Ecosystem types and their default stage graphs
//! - [`error`] - Configuration error types and result aliases
//! - [`git`] - Repository metadata provider and tagging
//! - [`pipeline`] - Stage graph, scheduling, and verdicts
//! - [`preflight`] - Requirement checks before running stages
//! - [`release`] - Release records and artifact storage
//! - [`stage`] - Stage definitions and the stage runner
//! - [`tagging`] - Release tag creation
//! - [`version`] - Version resolution from tags and commits
//!
//! # Quick Start
//!
//! ```no_run
//! use camino::Utf8Path;
//! use gantry_core::git::GitRepo;
//! use gantry_core::version;
//!
//! let repo = GitRepo::new(Utf8Path::new("."));
//! let spec = version::resolve_repo(&repo).expect("repository readable");
//! println!("building {}", spec.version());
//! ```
#![deny(unsafe_code)]

pub mod cancel;

pub mod clean;

pub mod config;

pub mod detect;

pub mod ecosystem;

pub mod error;

pub mod git;

pub mod pipeline;

pub mod preflight;

pub mod release;

pub mod stage;

pub mod tagging;

pub mod version;

pub use config::{Config, ConfigLoader, LogLevel};

pub use error::{ConfigError, ConfigResult};

// Re-export semver so downstream crates don't need a direct dependency.
pub use semver;
