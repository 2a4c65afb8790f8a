// ABOUTME: Supervisor facade: the intents the presentation layer calls (start, stop, restart, install, ...)
// ABOUTME: Composes the executor, termination protocol and scanner around one shared registry

use futures::future::join_all;
use nodefleet_core::{
    canonical_path, is_long_running_script, resolve_run_target, Action, AppStatus, ErrorKind,
    Manifest, RunTarget, INSTALLED_MARKER_DIR,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::activity::LogSink;
use crate::config::SupervisorConfig;
use crate::detector::{OutputPortHeuristic, PortDetector};
use crate::executor::{CommandExecutor, CommandSpec};
use crate::inspect::{ProcessInspector, SystemProcesses};
use crate::registry::Registry;
use crate::scaffold;
use crate::scanner::Scanner;
use crate::termination::{StopSignal, Terminator};
use crate::types::{ActionRejected, AppRecord, RecordUpdate, RegistryEvent};

/// Result of a restart request that passed its preconditions
#[derive(Debug)]
pub enum RestartOutcome {
    /// The start command was accepted; the handle supervises it
    Started(JoinHandle<()>),
    /// The stop did not settle in `Stopped`, so no start was issued
    StopFailed(AppStatus),
}

/// Outcome of [`Supervisor::shutdown_drain`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub confirmed: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Process lifecycle and reconciliation engine for a projects folder.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct Supervisor {
    config: Arc<SupervisorConfig>,
    registry: Registry,
    log: Arc<dyn LogSink>,
    executor: CommandExecutor,
    terminator: Terminator,
    scanner: Scanner,
    inspector: Arc<dyn ProcessInspector>,
}

fn reject_busy(record: &AppRecord) -> Result<(), ActionRejected> {
    if record.is_busy() {
        return Err(ActionRejected::Busy {
            name: record.name.clone(),
            status: record.status.clone(),
        });
    }
    Ok(())
}

fn reject_live(record: &AppRecord) -> Result<(), ActionRejected> {
    if record.status.is_live() {
        return Err(ActionRejected::StillRunning {
            name: record.name.clone(),
        });
    }
    Ok(())
}

impl Supervisor {
    /// Supervisor backed by the real process table and the default port heuristic.
    pub fn new(config: SupervisorConfig, log: Arc<dyn LogSink>) -> Self {
        Self::with_parts(
            config,
            log,
            Arc::new(SystemProcesses),
            Arc::new(OutputPortHeuristic),
        )
    }

    pub fn with_parts(
        config: SupervisorConfig,
        log: Arc<dyn LogSink>,
        inspector: Arc<dyn ProcessInspector>,
        detector: Arc<dyn PortDetector>,
    ) -> Self {
        let registry = Registry::new();
        let executor = CommandExecutor::new(registry.clone(), log.clone(), detector);
        let terminator = Terminator::new(
            registry.clone(),
            log.clone(),
            inspector.clone(),
            config.stop_timeouts,
        );
        let scanner = Scanner::new(
            inspector.clone(),
            config.runtime_exe_names.clone(),
            log.clone(),
        );

        Self {
            config: Arc::new(config),
            registry,
            log,
            executor,
            terminator,
            scanner,
            inspector,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    /// Run a reconciliation scan and install its result. Returns the record count.
    pub async fn rescan(&self) -> usize {
        let previous = self.registry.snapshot().await;
        let scanner = self.scanner.clone();
        let root = self.config.projects_root.clone();

        match tokio::task::spawn_blocking(move || scanner.scan(&root, &previous)).await {
            Ok(records) => {
                let count = self.registry.apply_scan(records).await;
                debug!("Registry holds {} projects after scan", count);
                count
            }
            Err(e) => {
                self.log
                    .error(None, &format!("Project scan failed unexpectedly: {}", e));
                self.registry.len().await
            }
        }
    }

    /// Look a project up by manifest name, directory name, or path.
    pub async fn find(&self, query: &str) -> Option<AppRecord> {
        let records = self.registry.snapshot().await;
        let as_path = canonical_path(query);

        records
            .iter()
            .find(|r| r.path == as_path)
            .or_else(|| records.iter().find(|r| r.name == query))
            .or_else(|| records.iter().find(|r| r.dir_name() == query))
            .cloned()
    }

    async fn require(&self, path: &Path) -> Result<AppRecord, ActionRejected> {
        self.registry
            .read(path)
            .await
            .ok_or_else(|| ActionRejected::UnknownProject {
                path: path.to_path_buf(),
            })
    }

    async fn pid_alive(&self, pid: u32) -> bool {
        let inspector = self.inspector.clone();
        tokio::task::spawn_blocking(move || inspector.is_alive(pid))
            .await
            .unwrap_or(false)
    }

    /// Start the project's run target as a long-running owned process.
    ///
    /// A record that claims to be running but whose PID is gone is normalized
    /// first and then started. A live handle or PID refuses the start in any
    /// status, including `Error (Stop)`.
    ///
    /// # Errors
    ///
    /// * `ActionRejected::Busy` - Another action is in flight
    /// * `ActionRejected::AlreadyRunning` - The recorded handle or PID is alive
    /// * `ActionRejected::NotInstalled` - No `node_modules`
    /// * `ActionRejected::NoManifest` / `NoStartTarget` - Nothing to launch; the
    ///   record is moved to the matching error status
    pub async fn start_project(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<JoinHandle<()>, ActionRejected> {
        let path = canonical_path(path);
        let record = self.require(&path).await?;
        reject_busy(&record)?;

        // A failed stop leaves its survivor on the record whatever the status says
        if let Some(handle) = &record.owned_handle {
            if !handle.has_exited().await {
                return Err(ActionRejected::AlreadyRunning {
                    name: record.name.clone(),
                    pid: handle.pid(),
                });
            }
        }
        if let Some(pid) = record.pid {
            if self.pid_alive(pid).await {
                return Err(ActionRejected::AlreadyRunning {
                    name: record.name.clone(),
                    pid,
                });
            }
        }
        let checked_handle = record.owned_handle.clone();
        let checked_pid = record.pid;

        if record.status.is_live() {
            self.log.warning(
                Some(&record.name),
                &format!(
                    "'{}' was marked {} but its process is gone; resetting",
                    record.name, record.status
                ),
            );
            let observed = record.status.clone();
            self.registry
                .update_if(
                    &path,
                    |r| r.status == observed,
                    RecordUpdate::new()
                        .status(AppStatus::idle(record.installed))
                        .process_cleared(),
                )
                .await;
        }

        if !record.installed {
            return Err(ActionRejected::NotInstalled { name: record.name });
        }

        let Some(manifest) = record.manifest.as_ref() else {
            self.settle_error(&path, ErrorKind::Manifest).await;
            self.log.error(
                Some(&record.name),
                &format!("Cannot start '{}': package.json is missing or invalid", record.name),
            );
            return Err(ActionRejected::NoManifest { name: record.name });
        };

        let Some(target) = resolve_run_target(&path, manifest, &self.config.entry_files) else {
            self.settle_error(&path, ErrorKind::NoStartTarget).await;
            self.log.error(
                Some(&record.name),
                &format!(
                    "Cannot start '{}': no start script, main field, or entry file ({})",
                    record.name,
                    self.config.entry_files.join(", ")
                ),
            );
            return Err(ActionRejected::NoStartTarget { name: record.name });
        };

        debug!("Starting {} via {}", path.display(), target.describe());
        let (program, args) = match target {
            RunTarget::StartScript => (self.config.npm_command.clone(), vec!["start".to_string()]),
            RunTarget::MainEntry(file) | RunTarget::EntryFile(file) => {
                (self.config.node_command.clone(), vec![file])
            }
        };

        let spec = CommandSpec::new(&path, program, args, Action::Start)
            .success(AppStatus::Running)
            .long_running(true);

        self.executor
            .run(spec, |r| {
                // Anything attached since the liveness check above is presumed alive
                if let Some(handle) = r
                    .owned_handle
                    .as_ref()
                    .filter(|h| Some(*h) != checked_handle.as_ref())
                {
                    return Err(ActionRejected::AlreadyRunning {
                        name: r.name.clone(),
                        pid: handle.pid(),
                    });
                }
                if let Some(pid) = r.pid.filter(|pid| Some(*pid) != checked_pid) {
                    return Err(ActionRejected::AlreadyRunning {
                        name: r.name.clone(),
                        pid,
                    });
                }
                reject_live(r)?;
                if !r.installed {
                    return Err(ActionRejected::NotInstalled {
                        name: r.name.clone(),
                    });
                }
                Ok(())
            })
            .await
    }

    async fn settle_error(&self, path: &Path, kind: ErrorKind) {
        self.registry
            .update_if(
                path,
                |r| !r.is_busy(),
                RecordUpdate::new().status(AppStatus::Error(kind)),
            )
            .await;
    }

    /// Stop the project. The returned signal resolves once the status settled.
    pub async fn stop_project(&self, path: impl AsRef<Path>) -> Result<StopSignal, ActionRejected> {
        let path = canonical_path(path);
        self.terminator.stop(&path).await
    }

    /// Stop, then start once the stop settled in `Stopped`.
    ///
    /// An idle installed project is started directly.
    pub async fn restart_project(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<RestartOutcome, ActionRejected> {
        let path = canonical_path(path);
        let record = self.require(&path).await?;
        reject_busy(&record)?;

        if record.status.is_live() {
            self.log
                .info(Some(&record.name), &format!("Restarting '{}'...", record.name));
            let settled = self.terminator.stop(&path).await?.wait().await;
            if settled != AppStatus::Stopped {
                self.log.error(
                    Some(&record.name),
                    &format!(
                        "Restart of '{}' aborted: stop ended in {}",
                        record.name, settled
                    ),
                );
                return Ok(RestartOutcome::StopFailed(settled));
            }
            return self.start_project(&path).await.map(RestartOutcome::Started);
        }

        if record.installed {
            return self.start_project(&path).await.map(RestartOutcome::Started);
        }

        self.log.warning(
            Some(&record.name),
            &format!(
                "Cannot restart '{}': it is neither running nor installed",
                record.name
            ),
        );
        Err(ActionRejected::NotInstalled { name: record.name })
    }

    async fn run_npm(
        &self,
        path: PathBuf,
        args: &[&str],
        action: Action,
        require_installed: bool,
        success_patch: RecordUpdate,
    ) -> Result<JoinHandle<()>, ActionRejected> {
        let spec = CommandSpec::new(
            path,
            self.config.npm_command.clone(),
            args.iter().map(|a| a.to_string()).collect(),
            action,
        )
        .success(AppStatus::Installed)
        .on_success(success_patch);

        self.executor
            .run(spec, |r| {
                reject_live(r)?;
                if require_installed && !r.installed {
                    return Err(ActionRejected::NotInstalled {
                        name: r.name.clone(),
                    });
                }
                Ok(())
            })
            .await
    }

    /// `npm install`; on success the project is marked installed.
    pub async fn install_deps(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<JoinHandle<()>, ActionRejected> {
        let path = canonical_path(path);
        self.run_npm(
            path,
            &["install"],
            Action::Install,
            false,
            RecordUpdate::new().installed(true),
        )
        .await
    }

    pub async fn update_deps(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<JoinHandle<()>, ActionRejected> {
        let path = canonical_path(path);
        self.run_npm(path, &["update"], Action::Update, true, RecordUpdate::new())
            .await
    }

    pub async fn audit_deps(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<JoinHandle<()>, ActionRejected> {
        let path = canonical_path(path);
        self.run_npm(path, &["audit"], Action::Audit, true, RecordUpdate::new())
            .await
    }

    /// `npm run <script>`.
    ///
    /// Scripts named like servers or watchers (`start`, `dev`, `serve`,
    /// `watch`, or containing "dev"/"watch") stay tracked as
    /// `RunningScript(name)`; anything else returns to `Installed`.
    pub async fn run_script(
        &self,
        path: impl AsRef<Path>,
        script: &str,
    ) -> Result<JoinHandle<()>, ActionRejected> {
        let path = canonical_path(path);
        let record = self.require(&path).await?;

        match record.manifest.as_ref() {
            None => return Err(ActionRejected::NoManifest { name: record.name }),
            Some(manifest) if !manifest.has_script(script) => {
                return Err(ActionRejected::UnknownScript {
                    name: record.name,
                    script: script.to_string(),
                })
            }
            Some(_) => {}
        }

        let long_running = is_long_running_script(script);
        let success = if long_running {
            AppStatus::RunningScript(script.to_string())
        } else {
            AppStatus::Installed
        };

        let spec = CommandSpec::new(
            &path,
            self.config.npm_command.clone(),
            vec!["run".to_string(), script.to_string()],
            Action::RunScript(script.to_string()),
        )
        .success(success)
        .long_running(long_running);

        self.executor.run(spec, reject_live).await
    }

    /// Remove `node_modules`. Refused while the project runs.
    pub async fn clean_deps(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<JoinHandle<()>, ActionRejected> {
        let path = canonical_path(path);
        self.require_folder(&path).await?;

        let (record, ()) = self
            .registry
            .transition(&path, |r| {
                reject_busy(r)?;
                reject_live(r)?;
                Ok((RecordUpdate::new().status(AppStatus::Cleaning), ()))
            })
            .await?;

        let supervisor = self.clone();
        Ok(tokio::spawn(async move {
            supervisor.remove_dependencies(&path, &record.name).await;
        }))
    }

    async fn remove_dependencies(&self, path: &Path, name: &str) {
        let marker = path.join(INSTALLED_MARKER_DIR);

        let update = if !fs::metadata(&marker).await.map(|m| m.is_dir()).unwrap_or(false) {
            self.log.warning(
                Some(name),
                &format!("'{}' has no node_modules folder to remove", name),
            );
            RecordUpdate::new()
                .status(AppStatus::NotInstalled)
                .installed(false)
        } else {
            match fs::remove_dir_all(&marker).await {
                Ok(()) => {
                    self.log
                        .info(Some(name), &format!("Removed node_modules for '{}'", name));
                    RecordUpdate::new()
                        .status(AppStatus::NotInstalled)
                        .installed(false)
                }
                Err(e) => {
                    self.log.error(
                        Some(name),
                        &format!("Failed to clean dependencies for '{}': {}", name, e),
                    );
                    RecordUpdate::new()
                        .status(AppStatus::Error(ErrorKind::Clean))
                        .installed(fs::metadata(&marker).await.is_ok())
                }
            }
        };

        self.registry
            .update_if(path, |r| r.status == AppStatus::Cleaning, update)
            .await;
    }

    /// Delete the project folder.
    ///
    /// An active project is refused unless `stop_first` is set, in which case
    /// deletion waits for the stop and only proceeds if it settled in `Stopped`.
    pub async fn delete_project(
        &self,
        path: impl AsRef<Path>,
        stop_first: bool,
    ) -> Result<JoinHandle<()>, ActionRejected> {
        let path = canonical_path(path);
        self.require_folder(&path).await?;
        let record = self.require(&path).await?;

        if record.status.is_stoppable() {
            if !stop_first {
                return Err(ActionRejected::StillRunning { name: record.name });
            }

            self.log.info(
                Some(&record.name),
                &format!("'{}' is active; stopping it before deleting", record.name),
            );
            let signal = self.terminator.stop(&path).await?;
            let supervisor = self.clone();
            return Ok(tokio::spawn(async move {
                let settled = signal.wait().await;
                if settled != AppStatus::Stopped {
                    supervisor.log.error(
                        Some(&record.name),
                        &format!(
                            "Not deleting '{}': it could not be stopped ({})",
                            record.name, settled
                        ),
                    );
                    return;
                }
                if let Err(e) = supervisor.begin_delete(&path).await {
                    supervisor
                        .log
                        .error(Some(&record.name), &format!("Not deleting: {}", e));
                    return;
                }
                supervisor.remove_folder(&path, &record.name).await;
            }));
        }

        let name = self.begin_delete(&path).await?;
        let supervisor = self.clone();
        Ok(tokio::spawn(async move {
            supervisor.remove_folder(&path, &name).await;
        }))
    }

    async fn begin_delete(&self, path: &Path) -> Result<String, ActionRejected> {
        let (record, ()) = self
            .registry
            .transition(path, |r| {
                reject_busy(r)?;
                reject_live(r)?;
                Ok((RecordUpdate::new().status(AppStatus::Deleting), ()))
            })
            .await?;
        Ok(record.name)
    }

    async fn remove_folder(&self, path: &Path, name: &str) {
        self.log.info(
            Some(name),
            &format!("Deleting '{}' at {}...", name, path.display()),
        );

        match fs::remove_dir_all(path).await {
            Ok(()) => {
                self.registry.remove(path).await;
                self.log.info(Some(name), &format!("Deleted '{}'", name));
            }
            Err(e) => {
                self.log.error(
                    Some(name),
                    &format!("Failed to delete '{}': {}", name, e),
                );
                if fs::metadata(path).await.is_ok() {
                    self.registry
                        .update(
                            path,
                            RecordUpdate::new().status(AppStatus::Error(ErrorKind::Delete)),
                        )
                        .await;
                } else {
                    self.registry.remove(path).await;
                }
            }
        }
    }

    async fn require_folder(&self, path: &Path) -> Result<(), ActionRejected> {
        if fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Ok(());
        }
        self.log.error(
            None,
            &format!("Project folder not found: {}", path.display()),
        );
        self.rescan().await;
        Err(ActionRejected::FolderMissing {
            path: path.to_path_buf(),
        })
    }

    /// Re-read package.json and refresh the record's manifest and name.
    pub async fn reload_manifest(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<AppRecord, ActionRejected> {
        let path = canonical_path(path);
        let loaded = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || Manifest::load(&path))
                .await
                .map_err(|e| ActionRejected::Io(std::io::Error::other(e)))?
        };

        let (record, ()) = self
            .registry
            .transition(&path, |r| {
                reject_busy(r)?;
                let update = match &loaded {
                    Ok(manifest) => {
                        let name = manifest
                            .declared_name()
                            .map(str::to_string)
                            .unwrap_or_else(|| r.dir_name());
                        let mut update = RecordUpdate::new().manifest(Some(manifest.clone())).name(name);
                        if r.status == AppStatus::Error(ErrorKind::Manifest) {
                            update = update.status(AppStatus::idle(r.installed));
                        }
                        update
                    }
                    Err(_) => RecordUpdate::new()
                        .manifest(None)
                        .status(AppStatus::Error(ErrorKind::Manifest)),
                };
                Ok((update, ()))
            })
            .await?;

        match loaded {
            Ok(_) => {
                self.log
                    .info(Some(&record.name), &format!("Reloaded package.json for '{}'", record.name));
                Ok(record)
            }
            Err(e) => {
                self.log.error(Some(&record.name), &e.to_string());
                Err(ActionRejected::NoManifest { name: record.name })
            }
        }
    }

    /// Scaffold `<projects root>/<name>` with a runnable server and rescan.
    pub async fn create_basic_project(&self, name: &str) -> Result<PathBuf, ActionRejected> {
        let dir = match scaffold::create_basic_project(&self.config.projects_root, name).await {
            Ok(dir) => dir,
            Err(e) => {
                self.log
                    .error(None, &format!("Could not create project '{}': {}", name, e));
                return Err(e);
            }
        };

        let path = canonical_path(&dir);
        self.log
            .info(None, &format!("Created basic project at {}", path.display()));
        self.rescan().await;
        Ok(path)
    }

    /// Records currently running or starting
    async fn active_paths(&self) -> Vec<PathBuf> {
        self.registry
            .snapshot()
            .await
            .into_iter()
            .filter(|r| r.status.is_stoppable())
            .map(|r| r.path)
            .collect()
    }

    /// Issue stops for every running or starting project concurrently.
    ///
    /// Returns the targeted paths with their completion signals; an empty list
    /// means there was nothing to stop.
    pub async fn stop_all(&self) -> Vec<(PathBuf, StopSignal)> {
        let targets = self.active_paths().await;
        if targets.is_empty() {
            self.log.info(None, "No running projects to stop");
            return Vec::new();
        }

        self.log
            .info(None, &format!("Stopping {} running project(s)...", targets.len()));
        self.issue_stops(targets).await
    }

    async fn issue_stops(&self, targets: Vec<PathBuf>) -> Vec<(PathBuf, StopSignal)> {
        let results = join_all(targets.iter().map(|path| self.terminator.stop(path))).await;

        targets
            .into_iter()
            .zip(results)
            .filter_map(|(path, result)| match result {
                Ok(signal) => Some((path, signal)),
                Err(e) => {
                    self.log.warning(None, &format!("Skipping stop: {}", e));
                    None
                }
            })
            .collect()
    }

    /// Stop everything before exit, waiting a bounded time for each project.
    ///
    /// All stops are issued in parallel; completion signals are then awaited
    /// one after another with the configured per-project timeout.
    pub async fn shutdown_drain(&self) -> DrainReport {
        let targets = self.active_paths().await;
        self.drain(targets).await
    }

    /// Like [`shutdown_drain`](Self::shutdown_drain), limited to processes
    /// this supervisor spawned. Adopted processes keep running.
    pub async fn drain_owned(&self) -> DrainReport {
        let targets = self
            .registry
            .snapshot()
            .await
            .into_iter()
            // Starting records have no handle yet but are ours all the same
            .filter(|r| r.status.is_stoppable() && (r.is_owned() || r.is_busy()))
            .map(|r| r.path)
            .collect();
        self.drain(targets).await
    }

    async fn drain(&self, targets: Vec<PathBuf>) -> DrainReport {
        let mut report = DrainReport::default();
        if targets.is_empty() {
            return report;
        }

        info!("Draining {} active project(s) before shutdown", targets.len());
        for (path, signal) in self.issue_stops(targets).await {
            match signal.wait_timeout(self.config.drain_timeout).await {
                Some(AppStatus::Stopped) => report.confirmed.push(path),
                other => {
                    let outcome = other
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "timed out".to_string());
                    self.log.warning(
                        None,
                        &format!(
                            "Shutdown: {} did not confirm stop ({})",
                            path.display(),
                            outcome
                        ),
                    );
                    report.failed.push(path);
                }
            }
        }

        report
    }
}
