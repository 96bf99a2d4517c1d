use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::workspace::CleanMode;

/// Run settings, loadable from a TOML file. Every field has a default so
/// an empty (or absent) file is a valid configuration; CLI flags override
/// whatever the file says.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub workdir: PathBuf,
    pub output_dir: PathBuf,
    /// Shared files overlay copied into each tree's `files/`.
    pub files_dir: Option<PathBuf>,
    /// 0 means one worker per flavor.
    pub max_parallel: usize,
    /// Attribution name override; when unset the GitHub profile of
    /// `github_repo_owner` is consulted.
    pub compiler: Option<String>,
    pub github_repo_owner: Option<String>,
    pub clean: CleanMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("workdir"),
            output_dir: PathBuf::from("uploads"),
            files_dir: None,
            max_parallel: 0,
            compiler: None,
            github_repo_owner: None,
            clean: CleanMode::None,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::filesystem(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| Error::config(format!("invalid settings file {}: {e}", path.display())))
    }

    /// Loads `path` when given, otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }
}
