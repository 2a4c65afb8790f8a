use nodefleet_core::{AppStatus, Manifest, VcsInfo};
use serde::{Serialize, Serializer};
use std::path::{Path, PathBuf};

use crate::process::OwnedProcess;

/// One record per discovered project, keyed by its canonical directory path
#[derive(Debug, Clone, Serialize)]
pub struct AppRecord {
    pub path: PathBuf,
    pub name: String,
    pub status: AppStatus,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    /// Present only while a process we spawned is being tracked
    #[serde(rename = "owned", serialize_with = "serialize_owned")]
    pub owned_handle: Option<OwnedProcess>,
    pub installed: bool,
    pub manifest: Option<Manifest>,
    pub vcs: VcsInfo,
    /// Bumped on every applied change; lets a scan detect concurrent writes
    #[serde(skip)]
    pub(crate) revision: u64,
}

fn serialize_owned<S: Serializer>(
    handle: &Option<OwnedProcess>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_bool(handle.is_some())
}

impl AppRecord {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            status: AppStatus::Unknown,
            port: None,
            pid: None,
            owned_handle: None,
            installed: false,
            manifest: None,
            vcs: VcsInfo::default(),
            revision: 0,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.status.is_busy()
    }

    pub fn is_owned(&self) -> bool {
        self.owned_handle.is_some()
    }

    /// Directory name, used when no manifest name is declared
    pub fn dir_name(&self) -> String {
        dir_name(&self.path)
    }
}

pub(crate) fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Partial update applied through [`Registry::update`](crate::registry::Registry::update).
///
/// Only fields that are set are touched. Clearable fields use a nested
/// `Option`: `Some(None)` clears, `None` leaves the field alone.
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    pub name: Option<String>,
    pub status: Option<AppStatus>,
    pub port: Option<Option<u16>>,
    pub pid: Option<Option<u32>>,
    pub owned_handle: Option<Option<OwnedProcess>>,
    pub installed: Option<bool>,
    pub manifest: Option<Option<Manifest>>,
    pub vcs: Option<VcsInfo>,
}

impl RecordUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn status(mut self, status: AppStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn port(mut self, port: Option<u16>) -> Self {
        self.port = Some(port);
        self
    }

    pub fn pid(mut self, pid: Option<u32>) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn handle(mut self, handle: Option<OwnedProcess>) -> Self {
        self.owned_handle = Some(handle);
        self
    }

    pub fn installed(mut self, installed: bool) -> Self {
        self.installed = Some(installed);
        self
    }

    pub fn manifest(mut self, manifest: Option<Manifest>) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn vcs(mut self, vcs: VcsInfo) -> Self {
        self.vcs = Some(vcs);
        self
    }

    /// Clears port, pid and handle: the process is gone.
    pub fn process_cleared(self) -> Self {
        self.port(None).pid(None).handle(None)
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.status.is_none()
            && self.port.is_none()
            && self.pid.is_none()
            && self.owned_handle.is_none()
            && self.installed.is_none()
            && self.manifest.is_none()
            && self.vcs.is_none()
    }

    /// Apply to `record`, returning whether any field actually changed.
    pub(crate) fn apply(self, record: &mut AppRecord) -> bool {
        let mut changed = false;

        fn set<T: PartialEq>(field: &mut T, value: Option<T>, changed: &mut bool) {
            if let Some(value) = value {
                if *field != value {
                    *field = value;
                    *changed = true;
                }
            }
        }

        set(&mut record.name, self.name, &mut changed);
        set(&mut record.status, self.status, &mut changed);
        set(&mut record.port, self.port, &mut changed);
        set(&mut record.pid, self.pid, &mut changed);
        set(&mut record.owned_handle, self.owned_handle, &mut changed);
        set(&mut record.installed, self.installed, &mut changed);
        set(&mut record.manifest, self.manifest, &mut changed);
        set(&mut record.vcs, self.vcs, &mut changed);

        if changed {
            record.revision += 1;
        }
        changed
    }
}

/// Notification sent to the presentation layer
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// Full record after a change
    Updated(AppRecord),
    Removed(PathBuf),
    /// A scan replaced the snapshot; carries the record count
    Rescanned(usize),
}

/// Why an intent was refused at the call boundary
#[derive(Debug, thiserror::Error)]
pub enum ActionRejected {
    #[error("Unknown project: {}", path.display())]
    UnknownProject { path: PathBuf },

    #[error("'{name}' is busy ({status})")]
    Busy { name: String, status: AppStatus },

    #[error("'{name}' has no installed dependencies; install them first")]
    NotInstalled { name: String },

    #[error("'{name}' is already running (PID: {pid})")]
    AlreadyRunning { name: String, pid: u32 },

    #[error("'{name}' is currently running; stop it first")]
    StillRunning { name: String },

    #[error("'{name}' has a missing or invalid package.json")]
    NoManifest { name: String },

    #[error("'{name}' has no start script, main field, or common entry file")]
    NoStartTarget { name: String },

    #[error("'{name}' has no script named '{script}'")]
    UnknownScript { name: String, script: String },

    #[error("Project folder not found: {}", path.display())]
    FolderMissing { path: PathBuf },

    #[error("Invalid project name '{name}': use letters, digits, '-' or '_'")]
    InvalidName { name: String },

    #[error("Folder already exists: {}", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodefleet_core::ErrorKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_apply_reports_changes_only() {
        let mut record = AppRecord::new("/apps/web", "web");

        assert!(RecordUpdate::new()
            .status(AppStatus::Running)
            .pid(Some(42))
            .apply(&mut record));
        assert_eq!(record.revision, 1);

        // Same values again: no change, no revision bump
        assert!(!RecordUpdate::new()
            .status(AppStatus::Running)
            .pid(Some(42))
            .apply(&mut record));
        assert_eq!(record.revision, 1);

        // Untouched fields stay as they were
        assert!(RecordUpdate::new().port(Some(3000)).apply(&mut record));
        assert_eq!(record.pid, Some(42));
        assert_eq!(record.status, AppStatus::Running);
    }

    #[test]
    fn test_process_cleared() {
        let mut record = AppRecord::new("/apps/web", "web");
        record.port = Some(3000);
        record.pid = Some(7);

        RecordUpdate::new()
            .status(AppStatus::Stopped)
            .process_cleared()
            .apply(&mut record);
        assert_eq!(record.port, None);
        assert_eq!(record.pid, None);
        assert!(!record.is_owned());
    }

    #[test]
    fn test_empty_update() {
        assert!(RecordUpdate::new().is_empty());
        assert!(!RecordUpdate::new().installed(true).is_empty());
        let mut record = AppRecord::new("/apps/web", "web");
        assert!(!RecordUpdate::new().apply(&mut record));
    }

    #[test]
    fn test_record_serializes_owned_flag() {
        let mut record = AppRecord::new("/apps/web", "web");
        record.status = AppStatus::Error(ErrorKind::Start);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["owned"], false);
        assert_eq!(json["status"]["state"], "error");
        assert!(json.get("revision").is_none());
    }
}
