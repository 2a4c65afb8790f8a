// ABOUTME: Persisted user preferences (projects folder, theme) stored as a JSON document
// ABOUTME: Unknown keys are preserved so the document stays opaque to the lifecycle engine

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::constants::{
    APP_CONFIG_DIR_NAME, DEFAULT_PROJECTS_FOLDER, FALLBACK_PROJECTS_FOLDER, HOME,
    NODEFLEET_CONFIG_DIR, NODEFLEET_PROJECTS_DIR, SETTINGS_FILE_NAME,
};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to write settings to {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode settings: {0}")]
    Encode(#[from] serde_json::Error),
}

/// User preferences document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub projects_folder: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,

    /// Keys written by other tools or older versions, carried through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Get the Nodefleet configuration directory.
///
/// `NODEFLEET_CONFIG_DIR` wins, then the platform config dir
/// (`~/.config`, `~/Library/Application Support`, `%APPDATA%`).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = env::var(NODEFLEET_CONFIG_DIR) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    match dirs::config_dir() {
        Some(dir) => dir.join(APP_CONFIG_DIR_NAME),
        None => home_dir().join(".config").join(APP_CONFIG_DIR_NAME),
    }
}

fn home_dir() -> PathBuf {
    // HOME first so tests can redirect it
    if let Ok(home) = env::var(HOME) {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Expand a leading `~` against the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return home_dir();
    }
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        return home_dir().join(rest);
    }
    PathBuf::from(path)
}

impl Settings {
    /// Path of the settings file inside [`config_dir`].
    pub fn default_path() -> PathBuf {
        config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Load settings from the default location.
    pub fn load() -> Self {
        Self::load_from(&Self::default_path())
    }

    /// Load settings from `path`.
    ///
    /// Never fails: a missing or undecodable file yields defaults, and an
    /// empty `projects_folder` is replaced with the default folder.
    pub fn load_from(path: &Path) -> Self {
        let mut settings = if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match serde_json::from_str::<Settings>(&content) {
                    Ok(settings) => {
                        info!("Config loaded from: {}", path.display());
                        settings
                    }
                    Err(e) => {
                        error!(
                            "Error decoding config file {}: {}. Using defaults.",
                            path.display(),
                            e
                        );
                        Settings::default()
                    }
                },
                Err(e) => {
                    error!(
                        "Error loading config file {}: {}. Using defaults.",
                        path.display(),
                        e
                    );
                    Settings::default()
                }
            }
        } else {
            info!("Config file not found at {}. Using defaults.", path.display());
            Settings::default()
        };

        if settings.projects_folder.trim().is_empty() {
            settings.projects_folder = default_projects_folder().to_string_lossy().to_string();
        }

        settings
    }

    /// Persist settings to the default location.
    pub fn save(&self) -> Result<(), SettingsError> {
        self.save_to(&Self::default_path())
    }

    /// Persist settings to `path` as pretty JSON, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| SettingsError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        info!("Config saved to: {}", path.display());
        Ok(())
    }

    /// The projects root the scanner should use.
    ///
    /// `NODEFLEET_PROJECTS_DIR` overrides the stored value.
    pub fn projects_root(&self) -> PathBuf {
        if let Ok(dir) = env::var(NODEFLEET_PROJECTS_DIR) {
            if !dir.trim().is_empty() {
                return expand_home(dir.trim());
            }
        }
        expand_home(&self.projects_folder)
    }
}

/// Resolve (and create if needed) the default projects folder.
///
/// Falls back to `~/nodefleet_projects`, then to the home directory itself.
pub fn default_projects_folder() -> PathBuf {
    let default_folder = expand_home(DEFAULT_PROJECTS_FOLDER);
    if default_folder.exists() {
        return default_folder;
    }

    match fs::create_dir_all(&default_folder) {
        Ok(()) => {
            info!("Created default projects folder: {}", default_folder.display());
            default_folder
        }
        Err(e) => {
            error!(
                "Could not create default projects folder {}: {}",
                default_folder.display(),
                e
            );
            let fallback = home_dir().join(FALLBACK_PROJECTS_FOLDER);
            match fs::create_dir_all(&fallback) {
                Ok(()) => {
                    warn!("Using fallback projects folder: {}", fallback.display());
                    fallback
                }
                Err(e) => {
                    error!(
                        "Could not create fallback projects folder {}: {}",
                        fallback.display(),
                        e
                    );
                    debug!("Using home directory as projects folder");
                    home_dir()
                }
            }
        }
    }
}
