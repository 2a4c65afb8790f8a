// ABOUTME: Resolves where projects live for a CLI invocation
// ABOUTME: Command line flag, then NODEFLEET_PROJECTS_DIR, then the saved settings

use nodefleet_config::{expand_home, Settings, SettingsError};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Projects folder does not exist: {}", .0.display())]
    MissingProjectsDir(PathBuf),
    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Settings plus the file they came from
#[derive(Debug)]
pub struct CliConfig {
    pub settings: Settings,
    pub settings_path: PathBuf,
}

impl CliConfig {
    pub fn load() -> Self {
        Self::load_from(Settings::default_path())
    }

    pub fn load_from(settings_path: PathBuf) -> Self {
        Self {
            settings: Settings::load_from(&settings_path),
            settings_path,
        }
    }

    /// Projects root for this run. An explicit `--projects-dir` wins.
    pub fn projects_root(&self, flag: Option<&Path>) -> PathBuf {
        match flag {
            Some(dir) => expand_home(&dir.to_string_lossy()),
            None => self.settings.projects_root(),
        }
    }

    /// Persist a new projects folder after checking it exists.
    ///
    /// # Errors
    ///
    /// * `ConfigError::MissingProjectsDir` - Nothing at that path
    /// * `ConfigError::NotADirectory` - The path is a file
    /// * `ConfigError::Settings` - The settings file could not be written
    pub fn set_projects_dir(&mut self, dir: &Path) -> Result<PathBuf, ConfigError> {
        let expanded = expand_home(&dir.to_string_lossy());
        if !expanded.exists() {
            return Err(ConfigError::MissingProjectsDir(expanded));
        }
        if !expanded.is_dir() {
            return Err(ConfigError::NotADirectory(expanded));
        }

        let resolved = nodefleet_core::canonical_path(&expanded);
        self.settings.projects_folder = resolved.to_string_lossy().to_string();
        self.settings.save_to(&self.settings_path)?;
        Ok(resolved)
    }
}
