// ABOUTME: Shared utility functions for Nodefleet
// ABOUTME: Path canonicalization, nesting checks and project name sanitizing

use std::path::{Path, PathBuf};
use tokio::fs;

/// Checks if a path exists
pub async fn path_exists(path: impl AsRef<Path>) -> bool {
    fs::metadata(path).await.is_ok()
}

/// Resolve symlinks and make `path` absolute.
///
/// Falls back to a lexically absolute path when the target does not exist
/// (e.g. a project directory that was deleted externally).
pub fn canonical_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    match std::fs::canonicalize(path) {
        Ok(resolved) => resolved,
        Err(_) if path.is_absolute() => path.to_path_buf(),
        Err(_) => std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf()),
    }
}

/// True if `candidate` equals `root` or lives somewhere below it.
///
/// Compares whole path components, so `/apps/web2` is not under `/apps/web`.
pub fn is_nested_under(candidate: &Path, root: &Path) -> bool {
    candidate.starts_with(root)
}

/// Keep only ASCII alphanumerics, `-` and `_`, trimming the result.
///
/// # Examples
///
/// ```
/// use nodefleet_core::sanitize_project_name;
///
/// assert_eq!(sanitize_project_name(" my app! "), "myapp");
/// assert_eq!(sanitize_project_name("api_v2-beta"), "api_v2-beta");
/// ```
pub fn sanitize_project_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect::<String>()
        .trim()
        .to_string()
}
