// ABOUTME: Configuration for Nodefleet
// ABOUTME: Environment variable names plus the persisted user settings document

pub mod constants;
pub mod settings;

pub use settings::{config_dir, expand_home, Settings, SettingsError};
