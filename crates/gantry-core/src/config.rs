//! Configuration loading and discovery.
//!
//! Sources are merged in order of precedence, highest first:
//! - explicit files passed with `--config`
//! - `.gantry.<ext>` or `gantry.<ext>` in the current directory or a parent,
//!   stopping at the enclosing `.git`
//! - `~/.config/gantry/config.<ext>` (user config)
//! - built-in defaults
//!
//! Where `<ext>` is one of `toml`, `yaml`, `yml`, `json`.
//!
//! # Example
//!
//! ```toml
//! workers = 4
//! fail_fast = false
//!
//! [version]
//! tag_prefix = "v"
//!
//! [clean]
//! paths = ["dist", "build"]
//!
//! [[stages]]
//! name = "lint"
//! command = "ruff check ."
//!
//! [[stages]]
//! name = "test"
//! command = "pytest"
//! depends_on = ["lint"]
//! timeout_secs = 600
//! ```
//!
//! ```no_run
//! use camino::Utf8PathBuf;
//! use gantry_core::config::ConfigLoader;
//!
//! let cwd = std::env::current_dir().unwrap();
//! let cwd = Utf8PathBuf::try_from(cwd).expect("current directory is not valid UTF-8");
//! let config = ConfigLoader::new()
//!     .with_project_search(&cwd)
//!     .load()
//!     .unwrap();
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use figment::Figment;
use figment::providers::{Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};

use crate::ecosystem::Ecosystem;
use crate::error::{ConfigError, ConfigResult};
use crate::stage::StageDefinition;

/// Default directory for run scratch space and stage logs.
pub const DEFAULT_STATE_DIR: &str = ".gantry";

/// Default tag prefix.
pub const DEFAULT_TAG_PREFIX: &str = "v";

/// Default artifact store, relative to the project root.
pub const DEFAULT_RELEASE_STORE: &str = ".gantry/releases";

/// Default remote for pushing tags.
pub const DEFAULT_REMOTE: &str = "origin";

/// The configuration for gantry.
///
/// Every section is optional; accessors fill in defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Log level for the application (e.g., "debug", "info", "warn", "error").
    pub log_level: LogLevel,
    /// Directory for JSONL log files (falls back to platform defaults if unset).
    pub log_dir: Option<Utf8PathBuf>,
    /// Maximum stages running at once.
    pub workers: Option<usize>,
    /// Start no new stage once a required stage has failed.
    pub fail_fast: bool,
    /// Run scratch directory, relative to the project root.
    pub state_dir: Option<Utf8PathBuf>,
    /// Project overrides.
    pub project: Option<ProjectConfig>,
    /// Tagging settings.
    pub version: Option<VersionConfig>,
    /// Paths removed by `gantry clean`.
    pub clean: Option<CleanConfig>,
    /// Release publication settings.
    pub release: Option<ReleaseConfig>,
    /// Stage graph. When empty, defaults come from the detected ecosystem.
    pub stages: Vec<StageDefinition>,
}

/// Project-level overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Override the detected ecosystem (e.g., `"python"`, `"rust"`).
    #[serde(rename = "type")]
    pub project_type: Option<Ecosystem>,
}

/// Tagging settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct VersionConfig {
    /// Prefix added to new tags (default `"v"`).
    pub tag_prefix: Option<String>,
}

/// Clean settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CleanConfig {
    /// Paths to remove, relative to the project root.
    pub paths: Option<Vec<Utf8PathBuf>>,
}

/// Release publication settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ReleaseConfig {
    /// Artifact store root, relative to the project root.
    pub store: Option<Utf8PathBuf>,
    /// Remote that `gantry tag --push` pushes to.
    pub remote: Option<String>,
}

impl Config {
    /// Worker pool size: configured, else available parallelism. Never zero.
    pub fn workers(&self) -> usize {
        self.workers
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, usize::from))
            .max(1)
    }

    /// Run scratch directory, relative to the project root.
    pub fn state_dir(&self) -> Utf8PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_STATE_DIR))
    }

    /// Prefix for new tags.
    pub fn tag_prefix(&self) -> &str {
        self.version
            .as_ref()
            .and_then(|v| v.tag_prefix.as_deref())
            .unwrap_or(DEFAULT_TAG_PREFIX)
    }

    /// Paths removed by `gantry clean`.
    pub fn clean_paths(&self) -> Vec<Utf8PathBuf> {
        self.clean
            .as_ref()
            .and_then(|c| c.paths.clone())
            .unwrap_or_else(|| vec![Utf8PathBuf::from("dist"), Utf8PathBuf::from("build")])
    }

    /// Artifact store root, relative to the project root.
    pub fn release_store(&self) -> Utf8PathBuf {
        self.release
            .as_ref()
            .and_then(|r| r.store.clone())
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_RELEASE_STORE))
    }

    /// Remote for pushing tags.
    pub fn remote(&self) -> &str {
        self.release
            .as_ref()
            .and_then(|r| r.remote.as_deref())
            .unwrap_or(DEFAULT_REMOTE)
    }

    /// Ecosystem override from `[project] type`.
    pub fn project_type(&self) -> Option<Ecosystem> {
        self.project.as_ref().and_then(|p| p.project_type)
    }
}

/// Log level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Verbose output for debugging and development.
    Debug,
    /// Standard operational information (default).
    #[default]
    Info,
    /// Warnings about potential issues.
    Warn,
    /// Errors that indicate failures.
    Error,
}

impl LogLevel {
    /// Returns the log level as a lowercase string slice.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Supported configuration file extensions (in order of preference).
const CONFIG_EXTENSIONS: &[&str] = &["toml", "yaml", "yml", "json"];

/// Application name for XDG directory lookup and config file names.
const APP_NAME: &str = "gantry";

/// Builder for loading configuration from multiple sources.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// Starting directory for project config search.
    project_search_root: Option<Utf8PathBuf>,
    /// Whether to include user config from XDG directory.
    include_user_config: bool,
    /// Stop searching when we hit a directory containing this file/dir.
    boundary_marker: Option<String>,
    /// Explicit config files to load (for testing or programmatic use).
    explicit_files: Vec<Utf8PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader with default settings.
    pub fn new() -> Self {
        Self {
            project_search_root: None,
            include_user_config: true,
            boundary_marker: Some(".git".to_string()),
            explicit_files: Vec::new(),
        }
    }

    /// Set the starting directory for project config search.
    ///
    /// The loader will walk up from this directory looking for config files.
    pub fn with_project_search<P: AsRef<Utf8Path>>(mut self, path: P) -> Self {
        self.project_search_root = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set whether to include user config from `~/.config/gantry/`.
    pub const fn with_user_config(mut self, include: bool) -> Self {
        self.include_user_config = include;
        self
    }

    /// Set a boundary marker to stop directory traversal.
    ///
    /// When walking up directories, stop if we find a directory containing
    /// this file or directory name. Default is `.git`.
    pub fn with_boundary_marker<S: Into<String>>(mut self, marker: S) -> Self {
        self.boundary_marker = Some(marker.into());
        self
    }

    /// Disable boundary marker (search all the way to filesystem root).
    pub fn without_boundary_marker(mut self) -> Self {
        self.boundary_marker = None;
        self
    }

    /// Add an explicit config file to load.
    ///
    /// Files are loaded in order, with later files taking precedence.
    /// Explicit files are loaded after discovered files.
    pub fn with_file<P: AsRef<Utf8Path>>(mut self, path: P) -> Self {
        self.explicit_files.push(path.as_ref().to_path_buf());
        self
    }

    /// Load configuration, merging all discovered sources.
    ///
    /// Precedence (highest to lowest):
    /// 1. Explicit files (in order added via `with_file`)
    /// 2. Project config (closest to search root)
    /// 3. User config (`~/.config/gantry/config.<ext>`)
    /// 4. Default values
    #[tracing::instrument(skip(self), fields(search_root = ?self.project_search_root))]
    pub fn load(self) -> ConfigResult<Config> {
        tracing::debug!("loading configuration");
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        // Start with user config (lowest precedence of file sources)
        if self.include_user_config
            && let Some(user_config) = self.find_user_config()
        {
            figment = Self::merge_file(figment, &user_config);
        }

        // Add project config
        if let Some(ref root) = self.project_search_root
            && let Some(project_config) = self.find_project_config(root)
        {
            figment = Self::merge_file(figment, &project_config);
        }

        // Add explicit files (highest precedence)
        for file in &self.explicit_files {
            figment = Self::merge_file(figment, file);
        }

        let config: Config = figment
            .extract()
            .map_err(|e| ConfigError::Deserialize(Box::new(e)))?;
        tracing::info!(
            log_level = config.log_level.as_str(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Load configuration, returning an error if no config file is found.
    pub fn load_or_error(self) -> ConfigResult<Config> {
        let has_user = self.include_user_config && self.find_user_config().is_some();
        let has_project = self
            .project_search_root
            .as_ref()
            .and_then(|root| self.find_project_config(root))
            .is_some();
        let has_explicit = !self.explicit_files.is_empty();

        if !has_user && !has_project && !has_explicit {
            return Err(ConfigError::NotFound);
        }

        self.load()
    }

    /// Find project config by walking up from the given directory.
    fn find_project_config(&self, start: &Utf8Path) -> Option<Utf8PathBuf> {
        let mut current = Some(start.to_path_buf());

        while let Some(dir) = current {
            // Check for boundary marker
            if let Some(ref marker) = self.boundary_marker {
                let marker_path = dir.join(marker);
                if marker_path.exists() && dir != start {
                    // Found boundary in a parent dir, stop searching
                    break;
                }
            }

            // Check for config files in this directory (try each extension)
            for ext in CONFIG_EXTENSIONS {
                // Try dotfile first (.gantry.toml)
                let dotfile = dir.join(format!(".{APP_NAME}.{ext}"));
                if dotfile.is_file() {
                    return Some(dotfile);
                }

                // Then try regular name (gantry.toml)
                let regular = dir.join(format!("{APP_NAME}.{ext}"));
                if regular.is_file() {
                    return Some(regular);
                }
            }

            current = dir.parent().map(Utf8Path::to_path_buf);
        }

        None
    }

    /// Find user config in XDG config directory.
    fn find_user_config(&self) -> Option<Utf8PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("", "", APP_NAME)?;
        let config_dir = proj_dirs.config_dir();

        // Try each supported extension
        for ext in CONFIG_EXTENSIONS {
            let config_path = config_dir.join(format!("config.{ext}"));
            if config_path.is_file() {
                return Utf8PathBuf::from_path_buf(config_path).ok();
            }
        }

        None
    }

    /// Merge a config file into the figment, detecting format from extension.
    fn merge_file(figment: Figment, path: &Utf8Path) -> Figment {
        match path.extension() {
            Some("toml") => figment.merge(Toml::file_exact(path.as_str())),
            Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path.as_str())),
            Some("json") => figment.merge(Json::file_exact(path.as_str())),
            _ => figment.merge(Toml::file_exact(path.as_str())),
        }
    }
}

/// Find the project config file path without loading it.
///
/// Useful for commands that need to know where config is located.
pub fn find_project_config<P: AsRef<Utf8Path>>(start: P) -> Option<Utf8PathBuf> {
    ConfigLoader::new()
        .with_project_search(start.as_ref())
        .find_project_config(start.as_ref())
}

/// Get the user config directory path.
///
/// Returns `~/.config/gantry/` on Linux, `~/Library/Application Support/gantry/`
/// on macOS, and equivalent on other platforms.
pub fn user_config_dir() -> Option<Utf8PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("", "", APP_NAME)?;
    Utf8PathBuf::from_path_buf(proj_dirs.config_dir().to_path_buf()).ok()
}
