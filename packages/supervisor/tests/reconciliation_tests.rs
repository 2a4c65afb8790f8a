// ABOUTME: Reconciliation and adoption tests against an in-memory process table
// ABOUTME: Covers adopting external processes, stale PIDs, and stop/restart of unowned processes

use nodefleet_core::canonical_path;
use nodefleet_supervisor::{
    ActionRejected, ActivityLog, AppStatus, ErrorKind, OutputPortHeuristic, ProcessInfo,
    ProcessInspector, RegistryEvent, RestartOutcome, StopTimeouts, Supervisor, SupervisorConfig,
};
use pretty_assertions::assert_eq;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Process table the tests control directly
#[derive(Default)]
struct FakeOs {
    processes: Mutex<Vec<ProcessInfo>>,
    alive: Mutex<HashSet<u32>>,
    ports: Mutex<HashMap<u32, u16>>,
    unkillable: bool,
}

impl FakeOs {
    fn spawn_external(&self, pid: u32, cwd: &Path, port: Option<u16>) {
        self.processes.lock().unwrap().push(ProcessInfo {
            pid,
            name: "node".to_string(),
            cwd: Some(cwd.to_path_buf()),
        });
        self.alive.lock().unwrap().insert(pid);
        if let Some(port) = port {
            self.ports.lock().unwrap().insert(pid, port);
        }
    }

    fn crash(&self, pid: u32) {
        self.alive.lock().unwrap().remove(&pid);
    }
}

impl ProcessInspector for FakeOs {
    fn runtime_processes(&self, exe_names: &[String]) -> Vec<ProcessInfo> {
        let alive = self.alive.lock().unwrap();
        self.processes
            .lock()
            .unwrap()
            .iter()
            .filter(|p| alive.contains(&p.pid))
            .filter(|p| exe_names.contains(&p.name))
            .cloned()
            .collect()
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn descendants(&self, _pid: u32) -> Vec<u32> {
        Vec::new()
    }

    fn listening_port(&self, pid: u32) -> Option<u16> {
        self.ports.lock().unwrap().get(&pid).copied()
    }

    fn terminate(&self, pid: u32) -> bool {
        if !self.unkillable {
            self.crash(pid);
        }
        true
    }

    fn kill(&self, pid: u32) -> bool {
        self.terminate(pid)
    }
}

fn write_project(root: &Path, dir: &str, manifest: &str, installed: bool) -> PathBuf {
    let path = root.join(dir);
    fs::create_dir_all(&path).unwrap();
    fs::write(path.join("package.json"), manifest).unwrap();
    if installed {
        fs::create_dir_all(path.join("node_modules")).unwrap();
    }
    canonical_path(&path)
}

fn supervisor_with(root: &Path, os: Arc<FakeOs>) -> Supervisor {
    let timeouts = StopTimeouts {
        graceful: Duration::from_millis(200),
        forced: Duration::from_millis(200),
        descendants: Duration::from_millis(200),
        pid_graceful: Duration::from_millis(200),
        pid_forced: Duration::from_millis(200),
    };
    let config = SupervisorConfig::new(root)
        .with_commands("sh", "sh")
        .with_stop_timeouts(timeouts);
    Supervisor::with_parts(
        config,
        Arc::new(ActivityLog::new()),
        os,
        Arc::new(OutputPortHeuristic),
    )
}

#[tokio::test]
async fn test_scan_adopts_external_process() {
    let temp = TempDir::new().unwrap();
    let path = write_project(temp.path(), "web", r#"{"name": "web"}"#, true);

    let os = Arc::new(FakeOs::default());
    os.spawn_external(5000, &path.join("src"), Some(3000));
    os.spawn_external(5001, &path, Some(3001));
    let supervisor = supervisor_with(temp.path(), os.clone());

    supervisor.rescan().await;

    let record = supervisor.registry().read(&path).await.unwrap();
    assert_eq!(record.status, AppStatus::Running);
    assert_eq!(record.pid, Some(5000));
    assert_eq!(record.port, Some(3000));
    assert!(!record.is_owned());

    // A second scan keeps the adoption stable
    supervisor.rescan().await;
    assert_eq!(supervisor.registry().read(&path).await.unwrap().pid, Some(5000));
}

#[tokio::test]
async fn test_processes_outside_projects_are_ignored() {
    let temp = TempDir::new().unwrap();
    let path = write_project(temp.path(), "web", "{}", true);
    let elsewhere = TempDir::new().unwrap();

    let os = Arc::new(FakeOs::default());
    os.spawn_external(6000, elsewhere.path(), Some(3000));
    let supervisor = supervisor_with(temp.path(), os);

    supervisor.rescan().await;
    let record = supervisor.registry().read(&path).await.unwrap();
    assert_eq!(record.status, AppStatus::Installed);
    assert_eq!(record.pid, None);
}

#[tokio::test]
async fn test_crashed_adopted_process_returns_to_idle() {
    let temp = TempDir::new().unwrap();
    let path = write_project(temp.path(), "web", "{}", true);

    let os = Arc::new(FakeOs::default());
    os.spawn_external(5000, &path, None);
    let supervisor = supervisor_with(temp.path(), os.clone());

    supervisor.rescan().await;
    assert_eq!(
        supervisor.registry().read(&path).await.unwrap().status,
        AppStatus::Running
    );

    os.crash(5000);
    supervisor.rescan().await;

    let record = supervisor.registry().read(&path).await.unwrap();
    assert_eq!(record.status, AppStatus::Installed);
    assert_eq!(record.pid, None);
}

#[tokio::test]
async fn test_stop_adopted_process_by_pid() {
    let temp = TempDir::new().unwrap();
    let path = write_project(temp.path(), "web", "{}", true);

    let os = Arc::new(FakeOs::default());
    os.spawn_external(5000, &path, Some(8080));
    let supervisor = supervisor_with(temp.path(), os.clone());
    supervisor.rescan().await;

    let settled = supervisor.stop_project(&path).await.unwrap().wait().await;
    assert_eq!(settled, AppStatus::Stopped);
    assert!(!os.is_alive(5000));

    let record = supervisor.registry().read(&path).await.unwrap();
    assert_eq!(record.pid, None);
    assert_eq!(record.port, None);
}

#[tokio::test]
async fn test_restart_aborts_when_stop_fails() {
    let temp = TempDir::new().unwrap();
    let path = write_project(temp.path(), "web", "{}", true);

    let os = Arc::new(FakeOs {
        unkillable: true,
        ..Default::default()
    });
    os.spawn_external(5000, &path, None);
    let supervisor = supervisor_with(temp.path(), os);
    supervisor.rescan().await;

    let outcome = supervisor.restart_project(&path).await.unwrap();
    assert!(matches!(
        outcome,
        RestartOutcome::StopFailed(AppStatus::Error(ErrorKind::Stop))
    ));

    let record = supervisor.registry().read(&path).await.unwrap();
    assert_eq!(record.status, AppStatus::Error(ErrorKind::Stop));
    assert_eq!(record.pid, Some(5000));
    assert!(!record.is_owned());
}

#[tokio::test]
async fn test_start_after_failed_stop_keeps_the_survivor() {
    let temp = TempDir::new().unwrap();
    let path = write_project(temp.path(), "web", r#"{"main": "server.js"}"#, true);

    let os = Arc::new(FakeOs {
        unkillable: true,
        ..Default::default()
    });
    os.spawn_external(5000, &path, None);
    let supervisor = supervisor_with(temp.path(), os.clone());
    supervisor.rescan().await;

    let settled = supervisor.stop_project(&path).await.unwrap().wait().await;
    assert_eq!(settled, AppStatus::Error(ErrorKind::Stop));
    assert!(os.is_alive(5000));

    assert!(matches!(
        supervisor.start_project(&path).await,
        Err(ActionRejected::AlreadyRunning { pid: 5000, .. })
    ));
    assert!(matches!(
        supervisor.restart_project(&path).await,
        Err(ActionRejected::AlreadyRunning { pid: 5000, .. })
    ));

    let record = supervisor.registry().read(&path).await.unwrap();
    assert_eq!(record.status, AppStatus::Error(ErrorKind::Stop));
    assert_eq!(record.pid, Some(5000));
    assert!(!record.is_owned());
}

#[tokio::test]
async fn test_start_refuses_live_adopted_process() {
    let temp = TempDir::new().unwrap();
    let path = write_project(temp.path(), "web", r#"{"main": "server.js"}"#, true);

    let os = Arc::new(FakeOs::default());
    os.spawn_external(5000, &path, None);
    let supervisor = supervisor_with(temp.path(), os);
    supervisor.rescan().await;

    assert!(matches!(
        supervisor.start_project(&path).await,
        Err(ActionRejected::AlreadyRunning { pid: 5000, .. })
    ));
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_recovers_from_stale_running_record() {
    let temp = TempDir::new().unwrap();
    let path = write_project(temp.path(), "web", r#"{"main": "server.sh"}"#, true);
    fs::write(path.join("server.sh"), "echo \"port 4200\"\nexec sleep 30\n").unwrap();

    let os = Arc::new(FakeOs::default());
    os.spawn_external(5000, &path, None);
    let supervisor = supervisor_with(temp.path(), os.clone());
    supervisor.rescan().await;

    // The adopted process died without a rescan noticing
    os.crash(5000);
    supervisor.start_project(&path).await.unwrap();

    let record = supervisor.registry().read(&path).await.unwrap();
    assert!(matches!(record.status, AppStatus::Starting | AppStatus::Running));
    assert_ne!(record.pid, Some(5000));

    let settled = supervisor.stop_project(&path).await.unwrap().wait().await;
    assert_eq!(settled, AppStatus::Stopped);
}

#[tokio::test]
async fn test_scan_drops_deleted_idle_projects() {
    let temp = TempDir::new().unwrap();
    let keep = write_project(temp.path(), "keep", "{}", false);
    let gone = write_project(temp.path(), "gone", "{}", false);

    let supervisor = supervisor_with(temp.path(), Arc::new(FakeOs::default()));
    assert_eq!(supervisor.rescan().await, 2);

    fs::remove_dir_all(&gone).unwrap();
    let mut events = supervisor.subscribe();
    assert_eq!(supervisor.rescan().await, 1);

    assert!(supervisor.registry().read(&keep).await.is_some());
    assert!(supervisor.registry().read(&gone).await.is_none());

    let mut saw_removed = false;
    let mut saw_rescanned = false;
    while let Ok(event) = events.try_recv() {
        match event {
            RegistryEvent::Removed(path) if path == gone => saw_removed = true,
            RegistryEvent::Rescanned(1) => saw_rescanned = true,
            _ => {}
        }
    }
    assert!(saw_removed);
    assert!(saw_rescanned);
}

#[tokio::test]
async fn test_find_by_name_directory_or_path() {
    let temp = TempDir::new().unwrap();
    let path = write_project(temp.path(), "web-dir", r#"{"name": "storefront"}"#, true);
    let supervisor = supervisor_with(temp.path(), Arc::new(FakeOs::default()));
    supervisor.rescan().await;

    for query in ["storefront", "web-dir", path.to_str().unwrap()] {
        let found = supervisor.find(query).await.unwrap();
        assert_eq!(found.path, path);
    }
    assert!(supervisor.find("nope").await.is_none());
}

#[tokio::test]
async fn test_drain_owned_leaves_adopted_processes_alone() {
    let temp = TempDir::new().unwrap();
    let path = write_project(temp.path(), "web", "{}", true);

    let os = Arc::new(FakeOs::default());
    os.spawn_external(5000, &path, Some(3000));
    let supervisor = supervisor_with(temp.path(), os.clone());
    supervisor.rescan().await;

    let report = supervisor.drain_owned().await;
    assert!(report.confirmed.is_empty());
    assert!(report.is_clean());
    assert!(os.is_alive(5000));
    assert_eq!(
        supervisor.registry().read(&path).await.unwrap().status,
        AppStatus::Running
    );

    let report = supervisor.shutdown_drain().await;
    assert_eq!(report.confirmed, vec![path]);
    assert!(!os.is_alive(5000));
}
