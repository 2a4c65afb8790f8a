// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Nodefleet

// Paths
pub const NODEFLEET_PROJECTS_DIR: &str = "NODEFLEET_PROJECTS_DIR";
pub const NODEFLEET_CONFIG_DIR: &str = "NODEFLEET_CONFIG_DIR";

// Runtime commands
pub const NODEFLEET_NPM_CMD: &str = "NODEFLEET_NPM_CMD";
pub const NODEFLEET_NODE_CMD: &str = "NODEFLEET_NODE_CMD";

// Termination protocol timeouts
pub const NODEFLEET_STOP_GRACE_SECS: &str = "NODEFLEET_STOP_GRACE_SECS";
pub const NODEFLEET_STOP_KILL_SECS: &str = "NODEFLEET_STOP_KILL_SECS";
pub const NODEFLEET_DRAIN_TIMEOUT_SECS: &str = "NODEFLEET_DRAIN_TIMEOUT_SECS";

// System Environment Variables
pub const HOME: &str = "HOME";
pub const USERPROFILE: &str = "USERPROFILE"; // Windows

/// Directory name used under the platform config dir
pub const APP_CONFIG_DIR_NAME: &str = "nodefleet";

/// File name of the persisted settings document
pub const SETTINGS_FILE_NAME: &str = "config.json";

/// Default projects folder, expanded against the home directory
#[cfg(windows)]
pub const DEFAULT_PROJECTS_FOLDER: &str = "C:/node_projects";
#[cfg(not(windows))]
pub const DEFAULT_PROJECTS_FOLDER: &str = "~/node_projects";

/// Fallback folder (under home) when the default cannot be created
pub const FALLBACK_PROJECTS_FOLDER: &str = "nodefleet_projects";
