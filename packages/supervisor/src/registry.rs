// ABOUTME: Registry of application records keyed by canonical project path
// ABOUTME: Writes are serialized per record; every applied change is broadcast to subscribers

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::debug;

use crate::types::{ActionRejected, AppRecord, RecordUpdate, RegistryEvent};

const EVENT_CHANNEL_CAPACITY: usize = 256;

type Entry = Arc<Mutex<AppRecord>>;

/// The single source of truth for status, port, owned handle and metadata.
///
/// The map lock is only held to find or insert an entry; field updates lock the
/// individual record, so operations on different projects never contend.
#[derive(Clone)]
pub struct Registry {
    records: Arc<RwLock<BTreeMap<PathBuf, Entry>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            records: Arc::new(RwLock::new(BTreeMap::new())),
            events,
        }
    }

    /// Receive change notifications. Lagging receivers skip old events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn entry(&self, path: &Path) -> Option<Entry> {
        self.records.read().await.get(path).cloned()
    }

    /// Insert or replace a record.
    pub async fn insert(&self, record: AppRecord) {
        let path = record.path.clone();
        let snapshot = record.clone();
        let mut records = self.records.write().await;
        match records.get(&path) {
            Some(entry) => {
                let mut current = entry.lock().await;
                let revision = current.revision + 1;
                *current = record;
                current.revision = revision;
            }
            None => {
                records.insert(path, Arc::new(Mutex::new(record)));
            }
        }
        drop(records);
        self.emit(RegistryEvent::Updated(snapshot));
    }

    pub async fn read(&self, path: &Path) -> Option<AppRecord> {
        let entry = self.entry(path).await?;
        let record = entry.lock().await;
        Some(record.clone())
    }

    pub async fn contains(&self, path: &Path) -> bool {
        self.records.read().await.contains_key(path)
    }

    /// Ordered copy of every record.
    pub async fn snapshot(&self) -> Vec<AppRecord> {
        let entries: Vec<Entry> = self.records.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(entry.lock().await.clone());
        }
        out
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Apply only the provided fields. Returns whether anything changed.
    pub async fn update(&self, path: &Path, update: RecordUpdate) -> bool {
        self.update_if(path, |_| true, update).await
    }

    /// Apply `update` only if `predicate` holds for the current record.
    ///
    /// Check and write happen under the same record lock.
    pub async fn update_if<P>(&self, path: &Path, predicate: P, update: RecordUpdate) -> bool
    where
        P: FnOnce(&AppRecord) -> bool,
    {
        let Some(entry) = self.entry(path).await else {
            debug!("Ignoring update for unknown path {}", path.display());
            return false;
        };

        let mut record = entry.lock().await;
        if !predicate(&*record) {
            return false;
        }

        let changed = update.apply(&mut record);
        if changed {
            let snapshot = record.clone();
            drop(record);
            self.emit(RegistryEvent::Updated(snapshot));
        }
        changed
    }

    /// Atomic check-and-set used to gate lifecycle actions.
    ///
    /// `decide` sees the current record and either rejects the action or
    /// returns the update to apply plus a value handed back to the caller.
    /// Returns the record as it stands after the update.
    pub async fn transition<T, F>(
        &self,
        path: &Path,
        decide: F,
    ) -> Result<(AppRecord, T), ActionRejected>
    where
        F: FnOnce(&AppRecord) -> Result<(RecordUpdate, T), ActionRejected>,
    {
        let entry = self
            .entry(path)
            .await
            .ok_or_else(|| ActionRejected::UnknownProject {
                path: path.to_path_buf(),
            })?;

        let mut record = entry.lock().await;
        let (update, value) = decide(&*record)?;
        let changed = update.apply(&mut record);
        let snapshot = record.clone();
        drop(record);

        if changed {
            self.emit(RegistryEvent::Updated(snapshot.clone()));
        }
        Ok((snapshot, value))
    }

    pub async fn remove(&self, path: &Path) -> Option<AppRecord> {
        let entry = self.records.write().await.remove(path)?;
        let record = entry.lock().await.clone();
        self.emit(RegistryEvent::Removed(path.to_path_buf()));
        Some(record)
    }

    /// Install the result of a reconciliation scan.
    ///
    /// A scanned record replaces the live one only if the live record has not
    /// changed since the snapshot the scan started from. Otherwise the live
    /// record wins and only the disk metadata (name, installed, manifest, VCS)
    /// is overlaid. Records missing from the scan are dropped unless they are
    /// busy or own a process.
    pub async fn apply_scan(&self, scanned: Vec<AppRecord>) -> usize {
        let mut events = Vec::new();
        let mut records = self.records.write().await;
        let seen: HashSet<PathBuf> = scanned.iter().map(|r| r.path.clone()).collect();

        for incoming in scanned {
            match records.get(&incoming.path) {
                Some(entry) => {
                    let mut current = entry.lock().await;
                    if current.revision == incoming.revision {
                        let revision = current.revision;
                        let changed = differs(&*current, &incoming);
                        *current = incoming;
                        current.revision = if changed { revision + 1 } else { revision };
                        if changed {
                            events.push(RegistryEvent::Updated(current.clone()));
                        }
                    } else {
                        debug!(
                            "Record {} changed during scan; keeping live state",
                            current.path.display()
                        );
                        let overlay = RecordUpdate::new()
                            .name(incoming.name)
                            .installed(incoming.installed)
                            .manifest(incoming.manifest)
                            .vcs(incoming.vcs);
                        if overlay.apply(&mut current) {
                            events.push(RegistryEvent::Updated(current.clone()));
                        }
                    }
                }
                None => {
                    events.push(RegistryEvent::Updated(incoming.clone()));
                    records.insert(incoming.path.clone(), Arc::new(Mutex::new(incoming)));
                }
            }
        }

        let mut dropped = Vec::new();
        for (path, entry) in records.iter() {
            if seen.contains(path) {
                continue;
            }
            let record = entry.lock().await;
            if record.is_busy() || record.is_owned() {
                continue;
            }
            dropped.push(path.clone());
        }
        for path in dropped {
            records.remove(&path);
            events.push(RegistryEvent::Removed(path));
        }

        let count = records.len();
        drop(records);

        for event in events {
            self.emit(event);
        }
        self.emit(RegistryEvent::Rescanned(count));
        count
    }
}

fn differs(a: &AppRecord, b: &AppRecord) -> bool {
    a.name != b.name
        || a.status != b.status
        || a.port != b.port
        || a.pid != b.pid
        || a.owned_handle != b.owned_handle
        || a.installed != b.installed
        || a.manifest != b.manifest
        || a.vcs != b.vcs
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodefleet_core::AppStatus;
    use pretty_assertions::assert_eq;

    fn record(path: &str, status: AppStatus) -> AppRecord {
        let mut record = AppRecord::new(path, path.trim_start_matches('/'));
        record.status = status;
        record
    }

    #[tokio::test]
    async fn test_update_reports_change_and_broadcasts() {
        let registry = Registry::new();
        let mut events = registry.subscribe();
        registry.insert(record("/a", AppStatus::Installed)).await;
        assert!(matches!(events.recv().await, Ok(RegistryEvent::Updated(_))));

        let path = Path::new("/a");
        assert!(
            registry
                .update(path, RecordUpdate::new().status(AppStatus::Stopped))
                .await
        );
        match events.recv().await {
            Ok(RegistryEvent::Updated(r)) => assert_eq!(r.status, AppStatus::Stopped),
            other => panic!("unexpected event {:?}", other),
        }

        assert!(
            !registry
                .update(path, RecordUpdate::new().status(AppStatus::Stopped))
                .await
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_unknown_path_is_noop() {
        let registry = Registry::new();
        assert!(
            !registry
                .update(Path::new("/nope"), RecordUpdate::new().installed(true))
                .await
        );
    }

    #[tokio::test]
    async fn test_transition_rejects_without_writing() {
        let registry = Registry::new();
        registry.insert(record("/a", AppStatus::Installing)).await;

        let result: Result<(AppRecord, ()), _> = registry
            .transition(Path::new("/a"), |r| {
                if r.is_busy() {
                    Err(ActionRejected::Busy {
                        name: r.name.clone(),
                        status: r.status.clone(),
                    })
                } else {
                    Ok((RecordUpdate::new().status(AppStatus::Starting), ()))
                }
            })
            .await;
        assert!(matches!(result, Err(ActionRejected::Busy { .. })));
        assert_eq!(
            registry.read(Path::new("/a")).await.unwrap().status,
            AppStatus::Installing
        );
    }

    #[tokio::test]
    async fn test_snapshot_is_ordered() {
        let registry = Registry::new();
        registry.insert(record("/c", AppStatus::Installed)).await;
        registry.insert(record("/a", AppStatus::Installed)).await;
        registry.insert(record("/b", AppStatus::Installed)).await;

        let paths: Vec<PathBuf> = registry.snapshot().await.into_iter().map(|r| r.path).collect();
        assert_eq!(
            paths,
            vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]
        );
    }

    #[tokio::test]
    async fn test_apply_scan_keeps_concurrent_changes() {
        let registry = Registry::new();
        registry.insert(record("/a", AppStatus::Installed)).await;
        let before = registry.snapshot().await;

        // Something changes the record after the scan took its snapshot
        registry
            .update(Path::new("/a"), RecordUpdate::new().status(AppStatus::Starting))
            .await;

        let mut scanned = before[0].clone();
        scanned.status = AppStatus::Installed;
        scanned.installed = true;
        registry.apply_scan(vec![scanned]).await;

        let live = registry.read(Path::new("/a")).await.unwrap();
        assert_eq!(live.status, AppStatus::Starting);
        assert!(live.installed);
    }

    #[tokio::test]
    async fn test_apply_scan_drops_idle_missing_and_keeps_busy() {
        let registry = Registry::new();
        registry.insert(record("/idle", AppStatus::Installed)).await;
        registry.insert(record("/busy", AppStatus::Cleaning)).await;

        let count = registry.apply_scan(vec![record("/new", AppStatus::NotInstalled)]).await;
        assert_eq!(count, 2);
        assert!(registry.contains(Path::new("/busy")).await);
        assert!(registry.contains(Path::new("/new")).await);
        assert!(!registry.contains(Path::new("/idle")).await);
    }

    #[tokio::test]
    async fn test_remove_broadcasts() {
        let registry = Registry::new();
        registry.insert(record("/a", AppStatus::Installed)).await;
        let mut events = registry.subscribe();

        assert!(registry.remove(Path::new("/a")).await.is_some());
        assert!(matches!(events.recv().await, Ok(RegistryEvent::Removed(p)) if p == Path::new("/a")));
        assert!(registry.remove(Path::new("/a")).await.is_none());
    }
}
