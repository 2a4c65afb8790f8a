// ABOUTME: Core types, traits, and utilities for Nodefleet
// ABOUTME: Status state machine, manifest subset and path helpers shared by every Nodefleet package

pub mod constants;
pub mod manifest;
pub mod status;
pub mod types;
pub mod utils;

// Re-export main types
pub use manifest::{resolve_run_target, Manifest, ManifestError, RunTarget};
pub use status::{Action, AppStatus, ErrorKind};
pub use types::{VcsBranch, VcsDirty, VcsInfo};

// Re-export constants
pub use constants::{
    is_long_running_script, COMMON_ENTRY_FILES, INSTALLED_MARKER_DIR, MANIFEST_FILE,
};

// Re-export utilities
pub use utils::{canonical_path, is_nested_under, path_exists, sanitize_project_name};
