// ABOUTME: Reconciliation scan: disk discovery, carry-forward of live/busy records, OS process adoption
// ABOUTME: Pure with respect to the registry; the caller installs the result with Registry::apply_scan

use nodefleet_core::{
    canonical_path, is_nested_under, AppStatus, ErrorKind, Manifest, INSTALLED_MARKER_DIR,
    MANIFEST_FILE,
};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::activity::LogSink;
use crate::inspect::ProcessInspector;
use crate::types::{dir_name, AppRecord, RecordUpdate};

#[derive(Clone)]
pub struct Scanner {
    inspector: Arc<dyn ProcessInspector>,
    runtime_names: Vec<String>,
    log: Arc<dyn LogSink>,
}

impl Scanner {
    pub fn new(
        inspector: Arc<dyn ProcessInspector>,
        runtime_names: Vec<String>,
        log: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            inspector,
            runtime_names,
            log,
        }
    }

    /// Build the next registry snapshot.
    ///
    /// Blocking: reads the filesystem, probes VCS state and enumerates OS
    /// processes. Run it on a blocking task.
    ///
    /// # Arguments
    ///
    /// * `root` - Projects root; each immediate subdirectory with a manifest is a project
    /// * `previous` - Registry snapshot the scan starts from
    ///
    /// # Returns
    ///
    /// The full new snapshot, ordered by path.
    pub fn scan(&self, root: &Path, previous: &[AppRecord]) -> Vec<AppRecord> {
        let discovered = self.discover(root);
        let mut next = self.carry_forward(discovered, previous);
        self.adopt(&mut next, previous);

        debug!("Scan of {} produced {} records", root.display(), next.len());
        next.into_values().collect()
    }

    /// Step 1: one fresh record per manifest-bearing subdirectory
    fn discover(&self, root: &Path) -> BTreeMap<PathBuf, AppRecord> {
        let mut found = BTreeMap::new();

        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) => {
                self.log.error(
                    None,
                    &format!("Cannot read projects folder {}: {}", root.display(), e),
                );
                return found;
            }
        };

        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() || !dir.join(MANIFEST_FILE).is_file() {
                continue;
            }
            let record = self.inspect_project(&dir);
            found.insert(record.path.clone(), record);
        }

        found
    }

    fn inspect_project(&self, dir: &Path) -> AppRecord {
        let path = canonical_path(dir);
        let mut record = AppRecord::new(path.clone(), dir_name(&path));

        record.installed = path.join(INSTALLED_MARKER_DIR).is_dir();
        record.vcs = nodefleet_git_utils::probe(&path);

        match Manifest::load(&path) {
            Ok(manifest) => {
                if let Some(name) = manifest.declared_name() {
                    record.name = name.to_string();
                }
                record.status = AppStatus::idle(record.installed);
                record.manifest = Some(manifest);
            }
            Err(e) => {
                self.log.error(Some(&record.name), &e.to_string());
                record.status = AppStatus::Error(ErrorKind::Manifest);
            }
        }

        record
    }

    /// Step 2: previous records that are busy, own a process, or point at a
    /// live PID survive the rescan with only their disk metadata refreshed
    fn carry_forward(
        &self,
        mut discovered: BTreeMap<PathBuf, AppRecord>,
        previous: &[AppRecord],
    ) -> BTreeMap<PathBuf, AppRecord> {
        for prev in previous {
            if self.is_protected(prev) {
                let mut kept = prev.clone();
                if let Some(fresh) = discovered.remove(&prev.path) {
                    let revision = kept.revision;
                    RecordUpdate::new()
                        .name(fresh.name)
                        .installed(fresh.installed)
                        .manifest(fresh.manifest)
                        .vcs(fresh.vcs)
                        .apply(&mut kept);
                    // The overlay is ours, not a concurrent change
                    kept.revision = revision;
                }
                discovered.insert(kept.path.clone(), kept);
            } else if let Some(fresh) = discovered.get_mut(&prev.path) {
                fresh.revision = prev.revision;
            }
        }
        discovered
    }

    fn is_protected(&self, record: &AppRecord) -> bool {
        record.is_busy()
            || record.is_owned()
            || record.pid.is_some_and(|pid| self.inspector.is_alive(pid))
    }

    /// Step 3: attach unowned runtime processes to the project they run in
    fn adopt(&self, records: &mut BTreeMap<PathBuf, AppRecord>, previous: &[AppRecord]) {
        let mut claimed_paths: HashSet<PathBuf> = HashSet::new();
        let mut claimed_pids: HashSet<u32> = HashSet::new();

        for record in records.values() {
            if let Some(pid) = record.pid.filter(|_| record.status.is_live() || record.is_owned()) {
                claimed_paths.insert(record.path.clone());
                claimed_pids.insert(pid);
            }
        }

        for process in self.inspector.runtime_processes(&self.runtime_names) {
            if claimed_pids.contains(&process.pid) {
                continue;
            }
            let Some(cwd) = process.cwd.as_deref().map(canonical_path) else {
                continue;
            };

            let Some(record) = records
                .values_mut()
                .find(|r| is_nested_under(&cwd, &r.path))
            else {
                continue;
            };

            if claimed_paths.contains(&record.path) || record.is_owned() || record.is_busy() {
                continue;
            }

            // Fall back to the last port seen for this project
            let port = self.inspector.listening_port(process.pid).or_else(|| {
                previous
                    .iter()
                    .find(|prev| prev.path == record.path)
                    .and_then(|prev| prev.port)
            });
            let revision = record.revision;
            RecordUpdate::new()
                .status(AppStatus::Running)
                .pid(Some(process.pid))
                .handle(None)
                .port(port)
                .apply(record);
            record.revision = revision;

            claimed_paths.insert(record.path.clone());
            claimed_pids.insert(process.pid);

            info!(
                "Adopted {} (PID: {}) for {}",
                process.name,
                process.pid,
                record.path.display()
            );
            self.log.info(
                Some(&record.name),
                &format!(
                    "Found running process for '{}' (PID: {}{})",
                    record.name,
                    process.pid,
                    port.map(|p| format!(", port {}", p)).unwrap_or_default()
                ),
            );
        }
    }
}
