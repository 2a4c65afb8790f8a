// ABOUTME: The subset of package.json the supervisor reads (name, main, scripts)
// ABOUTME: Also resolves which entry point `start` should launch

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::constants::MANIFEST_FILE;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("No package.json found in {}", path.display())]
    Missing { path: PathBuf },

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Parsed manifest fields. Everything else in the file is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,

    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
}

impl Manifest {
    /// Read and parse `<project_dir>/package.json`.
    pub fn load(project_dir: &Path) -> Result<Self, ManifestError> {
        let path = project_dir.join(MANIFEST_FILE);
        if !path.is_file() {
            return Err(ManifestError::Missing {
                path: project_dir.to_path_buf(),
            });
        }

        let content = fs::read_to_string(&path).map_err(|source| ManifestError::Read {
            path: path.clone(),
            source,
        })?;

        Self::parse(&content).map_err(|source| ManifestError::Parse { path, source })
    }

    pub fn parse(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// The declared name, ignoring blank values
    pub fn declared_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    pub fn start_script(&self) -> Option<&str> {
        self.scripts
            .get("start")
            .map(String::as_str)
            .filter(|cmd| !cmd.trim().is_empty())
    }

    pub fn has_script(&self, name: &str) -> bool {
        self.scripts.contains_key(name)
    }
}

/// What `start` launches for a project
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTarget {
    /// `npm start`
    StartScript,
    /// `node <main>` from the manifest's `main` field
    MainEntry(String),
    /// `node <file>` for a conventional entry file found on disk
    EntryFile(String),
}

impl RunTarget {
    pub fn describe(&self) -> String {
        match self {
            RunTarget::StartScript => "start script".to_string(),
            RunTarget::MainEntry(main) => format!("main entry {}", main),
            RunTarget::EntryFile(file) => format!("entry file {}", file),
        }
    }
}

/// Resolve the run target: declared start script, else `main`, else the
/// first of `entry_files` present in `project_dir`.
///
/// # Examples
///
/// ```
/// use nodefleet_core::{resolve_run_target, Manifest, RunTarget, COMMON_ENTRY_FILES};
/// use std::path::Path;
///
/// let manifest = Manifest::parse(r#"{"main": "server.js"}"#).unwrap();
/// assert_eq!(
///     resolve_run_target(Path::new("."), &manifest, COMMON_ENTRY_FILES),
///     Some(RunTarget::MainEntry("server.js".to_string()))
/// );
/// ```
pub fn resolve_run_target<S: AsRef<str>>(
    project_dir: &Path,
    manifest: &Manifest,
    entry_files: &[S],
) -> Option<RunTarget> {
    if manifest.start_script().is_some() {
        return Some(RunTarget::StartScript);
    }

    if let Some(main) = manifest.main.as_deref().filter(|m| !m.trim().is_empty()) {
        return Some(RunTarget::MainEntry(main.to_string()));
    }

    for file in entry_files {
        let file = file.as_ref();
        if project_dir.join(file).is_file() {
            return Some(RunTarget::EntryFile(file.to_string()));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::COMMON_ENTRY_FILES;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_parse_subset_ignores_other_keys() {
        let manifest = Manifest::parse(
            r#"{
                "name": "api",
                "version": "1.0.0",
                "main": "server.js",
                "scripts": {"start": "node server.js", "test": "jest"},
                "dependencies": {"express": "^4"}
            }"#,
        )
        .unwrap();

        assert_eq!(manifest.declared_name(), Some("api"));
        assert_eq!(manifest.main.as_deref(), Some("server.js"));
        assert_eq!(manifest.start_script(), Some("node server.js"));
        assert!(manifest.has_script("test"));
        assert!(!manifest.has_script("dev"));
    }

    #[test]
    fn test_load_missing_and_invalid() {
        let temp_dir = TempDir::new().unwrap();
        assert!(matches!(
            Manifest::load(temp_dir.path()),
            Err(ManifestError::Missing { .. })
        ));

        fs::write(temp_dir.path().join(MANIFEST_FILE), "{ nope").unwrap();
        assert!(matches!(
            Manifest::load(temp_dir.path()),
            Err(ManifestError::Parse { .. })
        ));
    }

    #[test]
    fn test_blank_name_is_not_declared() {
        let manifest = Manifest::parse(r#"{"name": "  "}"#).unwrap();
        assert_eq!(manifest.declared_name(), None);
    }

    #[test]
    fn test_resolve_prefers_start_script() {
        let temp_dir = TempDir::new().unwrap();
        let manifest =
            Manifest::parse(r#"{"main": "app.js", "scripts": {"start": "node app.js"}}"#).unwrap();
        assert_eq!(
            resolve_run_target(temp_dir.path(), &manifest, COMMON_ENTRY_FILES),
            Some(RunTarget::StartScript)
        );
    }

    #[test]
    fn test_resolve_main_then_entry_files() {
        let temp_dir = TempDir::new().unwrap();

        let with_main = Manifest::parse(r#"{"main": "lib/run.js"}"#).unwrap();
        assert_eq!(
            resolve_run_target(temp_dir.path(), &with_main, COMMON_ENTRY_FILES),
            Some(RunTarget::MainEntry("lib/run.js".to_string()))
        );

        let bare = Manifest::default();
        assert_eq!(resolve_run_target(temp_dir.path(), &bare, COMMON_ENTRY_FILES), None);

        fs::write(temp_dir.path().join("server.js"), "").unwrap();
        fs::write(temp_dir.path().join("main.js"), "").unwrap();
        assert_eq!(
            resolve_run_target(temp_dir.path(), &bare, COMMON_ENTRY_FILES),
            Some(RunTarget::EntryFile("server.js".to_string()))
        );
    }
}
