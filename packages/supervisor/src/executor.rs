// ABOUTME: Runs external commands for a project on their own task and folds outcomes into the registry
// ABOUTME: Long-running commands are tracked with an owned handle; one-shot commands are awaited to completion

use nodefleet_core::{Action, AppStatus, ErrorKind};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::activity::LogSink;
use crate::detector::PortDetector;
use crate::process::OwnedProcess;
use crate::registry::Registry;
use crate::types::{ActionRejected, AppRecord, RecordUpdate};

/// How long to wait for a stderr reader after the process exited.
/// Grandchildren can keep the pipe open indefinitely.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded wait after each signal when a start is abandoned
const ABANDON_GRACE: Duration = Duration::from_secs(3);

/// Everything the executor needs to run one command for one project
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub path: PathBuf,
    pub program: String,
    pub args: Vec<String>,
    pub action: Action,
    pub success_status: AppStatus,
    pub failure_status: AppStatus,
    pub long_running: bool,
    /// Extra fields applied together with `success_status` (e.g. `installed = true`)
    pub success_patch: RecordUpdate,
}

impl CommandSpec {
    pub fn new(
        path: impl Into<PathBuf>,
        program: impl Into<String>,
        args: Vec<String>,
        action: Action,
    ) -> Self {
        let failure_status = action.failure_status();
        Self {
            path: path.into(),
            program: program.into(),
            args,
            action,
            success_status: AppStatus::Installed,
            failure_status,
            long_running: false,
            success_patch: RecordUpdate::new(),
        }
    }

    pub fn success(mut self, status: AppStatus) -> Self {
        self.success_status = status;
        self
    }

    pub fn long_running(mut self, long_running: bool) -> Self {
        self.long_running = long_running;
        self
    }

    pub fn on_success(mut self, patch: RecordUpdate) -> Self {
        self.success_patch = patch;
        self
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Concurrent command executor.
///
/// Each accepted command runs on its own task. Outcomes reach the rest of the
/// system only through the [`Registry`] and the log sink.
#[derive(Clone)]
pub struct CommandExecutor {
    registry: Registry,
    log: Arc<dyn LogSink>,
    detector: Arc<dyn PortDetector>,
}

impl CommandExecutor {
    pub fn new(registry: Registry, log: Arc<dyn LogSink>, detector: Arc<dyn PortDetector>) -> Self {
        Self {
            registry,
            log,
            detector,
        }
    }

    /// Accept and launch a command.
    ///
    /// The busy check, `precondition` and the switch to the interim status
    /// happen atomically, so a second action racing this one is rejected here
    /// rather than queued.
    ///
    /// # Arguments
    ///
    /// * `spec` - Command, working directory and status mapping
    /// * `precondition` - Extra checks against the current record
    ///
    /// # Returns
    ///
    /// The handle of the supervising task. Awaiting it waits for one-shot
    /// commands to finish, or for a long-running process to exit.
    ///
    /// # Errors
    ///
    /// * `ActionRejected::UnknownProject` - No record at `spec.path`
    /// * `ActionRejected::Busy` - Another lifecycle action is in flight
    /// * whatever `precondition` returns
    pub async fn run<P>(
        &self,
        spec: CommandSpec,
        precondition: P,
    ) -> Result<JoinHandle<()>, ActionRejected>
    where
        P: FnOnce(&AppRecord) -> Result<(), ActionRejected>,
    {
        let interim = spec.action.interim_status();
        let (record, ()) = self
            .registry
            .transition(&spec.path, |record| {
                if record.is_busy() {
                    return Err(ActionRejected::Busy {
                        name: record.name.clone(),
                        status: record.status.clone(),
                    });
                }
                precondition(record)?;
                Ok((RecordUpdate::new().status(interim), ()))
            })
            .await?;

        let name = record.name.clone();
        self.log.info(
            Some(&name),
            &format!("{} '{}': {}", spec.action.label(), name, spec.command_line()),
        );

        let executor = self.clone();
        Ok(tokio::spawn(async move {
            executor.supervise(spec, name).await;
        }))
    }

    /// Task boundary: runs the command on an inner task so a panic is caught
    /// and mapped to `Error(Exception)`, then always runs the finalizer.
    async fn supervise(self, spec: CommandSpec, name: String) {
        let spawned_pid = Arc::new(AtomicU32::new(0));
        let path = spec.path.clone();

        let inner = tokio::spawn({
            let executor = self.clone();
            let spawned_pid = spawned_pid.clone();
            let name = name.clone();
            async move { executor.execute(spec, name, spawned_pid).await }
        });

        if let Err(e) = inner.await {
            error!("Command task for {} failed: {}", path.display(), e);
            self.log.error(
                Some(&name),
                &format!("Unexpected error while running command for '{}': {}", name, e),
            );
            self.registry
                .update(
                    &path,
                    RecordUpdate::new()
                        .status(AppStatus::Error(ErrorKind::Exception))
                        .handle(None),
                )
                .await;
        }

        let pid = spawned_pid.load(Ordering::SeqCst);
        if pid != 0 {
            self.finalize(&path, pid).await;
        }
    }

    /// Clear the handle once the process is gone, and the PID if the record
    /// settled while still pointing at the process that just exited.
    async fn finalize(&self, path: &Path, pid: u32) {
        let Some(record) = self.registry.read(path).await else {
            return;
        };

        if let Some(handle) = record.owned_handle.filter(|h| h.pid() == pid) {
            if handle.has_exited().await {
                self.registry
                    .update_if(
                        path,
                        |r| r.owned_handle.as_ref() == Some(&handle),
                        RecordUpdate::new().handle(None),
                    )
                    .await;
            }
        }

        self.registry
            .update_if(
                path,
                |r| r.pid == Some(pid) && r.owned_handle.is_none() && !r.status.is_stoppable(),
                RecordUpdate::new().pid(None),
            )
            .await;
    }

    async fn execute(self, spec: CommandSpec, name: String, spawned_pid: Arc<AtomicU32>) {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                self.log.error(
                    Some(&name),
                    &format!(
                        "Command not found: '{}'. Is it installed and on PATH? ({})",
                        spec.program, e
                    ),
                );
                self.registry
                    .update(
                        &spec.path,
                        RecordUpdate::new()
                            .status(AppStatus::Error(ErrorKind::Command))
                            .handle(None),
                    )
                    .await;
                return;
            }
            Err(e) => {
                self.log.error(
                    Some(&name),
                    &format!("Failed to run '{}' for '{}': {}", spec.command_line(), name, e),
                );
                self.registry
                    .update(
                        &spec.path,
                        RecordUpdate::new()
                            .status(AppStatus::Error(ErrorKind::Exception))
                            .handle(None),
                    )
                    .await;
                return;
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        if spec.long_running {
            let Some(handle) = OwnedProcess::new(child) else {
                self.log.error(
                    Some(&name),
                    &format!("'{}' exited before its PID could be read", name),
                );
                let interim = spec.action.interim_status();
                self.registry
                    .update_if(
                        &spec.path,
                        |r| r.status == interim || r.status == AppStatus::Stopping,
                        RecordUpdate::new().status(spec.failure_status.clone()),
                    )
                    .await;
                return;
            };
            spawned_pid.store(handle.pid(), Ordering::SeqCst);
            self.run_long(spec, name, handle, stdout, stderr).await;
        } else {
            if let Some(pid) = child.id() {
                spawned_pid.store(pid, Ordering::SeqCst);
                let interim = spec.action.interim_status();
                self.registry
                    .update_if(
                        &spec.path,
                        |r| r.status == interim || r.status == AppStatus::Stopping,
                        RecordUpdate::new().pid(Some(pid)),
                    )
                    .await;
            }
            self.run_once(spec, name, child).await;
        }
    }

    async fn run_long(
        &self,
        spec: CommandSpec,
        name: String,
        handle: OwnedProcess,
        stdout: Option<tokio::process::ChildStdout>,
        stderr: Option<tokio::process::ChildStderr>,
    ) {
        let path = &spec.path;
        let label = spec.action.label();
        let interim = spec.action.interim_status();

        // A stop issued while starting waits for this handle; any other move means abandon
        let attached = self
            .registry
            .update_if(
                path,
                |r| r.status == interim || r.status == AppStatus::Stopping,
                RecordUpdate::new()
                    .pid(Some(handle.pid()))
                    .handle(Some(handle.clone())),
            )
            .await;
        if !attached {
            self.abandon(path, &name, &handle).await;
            return;
        }

        if let Some(status) = handle.exit_status().await {
            self.log.error(
                Some(&name),
                &format!("'{}' exited immediately ({})", name, status),
            );
            self.registry
                .update_if(
                    path,
                    |r| r.status == interim,
                    RecordUpdate::new().status(spec.failure_status.clone()),
                )
                .await;
            self.registry
                .update_if(
                    path,
                    |r| r.owned_handle.as_ref() == Some(&handle),
                    RecordUpdate::new().handle(None),
                )
                .await;
            return;
        }

        if self
            .registry
            .update_if(
                path,
                |r| r.status == interim,
                RecordUpdate::new().status(spec.success_status.clone()),
            )
            .await
        {
            self.log.info(
                Some(&name),
                &format!("'{}' is {} (PID: {})", name, spec.success_status, handle.pid()),
            );
        } else {
            let stopping = self.registry.read(path).await.is_some_and(|r| {
                r.status == AppStatus::Stopping && r.owned_handle.as_ref() == Some(&handle)
            });
            if stopping {
                debug!("Stop in flight for {}; leaving the child to it", path.display());
                let _ = handle.wait().await;
            } else {
                self.abandon(path, &name, &handle).await;
            }
            return;
        }

        // Drain stderr concurrently so a chatty process never blocks on a full pipe
        let stderr_task = stderr.map(|stderr| tokio::spawn(read_all(stderr)));

        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            let mut port_found = false;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        match self.registry.read(path).await {
                            None => {
                                debug!("Record {} removed; terminating child", path.display());
                                let _ = handle.terminate().await;
                                break;
                            }
                            Some(record) if record.status == AppStatus::Stopping => {
                                debug!("Record {} is stopping; terminating child", path.display());
                                let _ = handle.terminate().await;
                                break;
                            }
                            Some(record) if record.owned_handle.as_ref() != Some(&handle) => {
                                // Termination already confirmed and released the handle
                                break;
                            }
                            Some(_) => {}
                        }

                        self.log.info(Some(&name), &format!("[{}] {}", label, line));

                        if spec.action.is_start() && !port_found {
                            if let Some(port) = self.detector.detect(&line) {
                                port_found = true;
                                let stored = self
                                    .registry
                                    .update_if(
                                        path,
                                        |r| r.owned_handle.as_ref() == Some(&handle),
                                        RecordUpdate::new().port(Some(port)),
                                    )
                                    .await;
                                if stored {
                                    self.log.info(
                                        Some(&name),
                                        &format!("Detected port {} for '{}'", port, name),
                                    );
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.log.warning(
                            Some(&name),
                            &format!("Error reading output of '{}': {}", name, e),
                        );
                        break;
                    }
                }
            }
        }

        let exit = handle.wait().await;

        if let Some(task) = stderr_task {
            match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await {
                Ok(Ok(text)) if !text.trim().is_empty() => {
                    self.log
                        .warning(Some(&name), &format!("[{} stderr] {}", label, text.trim_end()));
                }
                Ok(_) => {}
                Err(_) => debug!("stderr of {} still open after exit", path.display()),
            }
        }

        let exit = match exit {
            Ok(exit) => exit,
            Err(e) => {
                self.log.error(
                    Some(&name),
                    &format!("Failed to wait for '{}': {}", name, e),
                );
                self.registry
                    .update_if(
                        path,
                        |r| r.status == spec.success_status,
                        RecordUpdate::new()
                            .status(AppStatus::Error(ErrorKind::Exception))
                            .handle(None),
                    )
                    .await;
                return;
            }
        };

        // Only settle if nobody intervened since we set the success status
        let update = if exit.success() {
            RecordUpdate::new()
                .status(AppStatus::Stopped)
                .process_cleared()
        } else {
            RecordUpdate::new()
                .status(spec.failure_status.clone())
                .handle(None)
        };
        if self
            .registry
            .update_if(path, |r| r.status == spec.success_status, update)
            .await
        {
            if exit.success() {
                self.log
                    .info(Some(&name), &format!("'{}' exited cleanly", name));
            } else {
                self.log.error(
                    Some(&name),
                    &format!("'{}' exited with {}", name, exit),
                );
            }
        }
    }

    /// Terminate a child whose record moved on while it was starting.
    async fn abandon(&self, path: &Path, name: &str, handle: &OwnedProcess) {
        self.log.info(
            Some(name),
            &format!("'{}' moved on while starting; terminating its process", name),
        );
        let _ = handle.terminate().await;
        if handle.wait_timeout(ABANDON_GRACE).await.is_none() {
            let _ = handle.kill().await;
            if handle.wait_timeout(ABANDON_GRACE).await.is_none() {
                self.log.error(
                    Some(name),
                    &format!("'{}' (PID: {}) did not exit after kill", name, handle.pid()),
                );
                return;
            }
        }
        self.registry
            .update_if(
                path,
                |r| r.owned_handle.as_ref() == Some(handle),
                RecordUpdate::new().pid(None).handle(None),
            )
            .await;
    }

    async fn run_once(&self, spec: CommandSpec, name: String, child: tokio::process::Child) {
        let path = &spec.path;
        let label = spec.action.label();
        let interim = spec.action.interim_status();

        let output = match child.wait_with_output().await {
            Ok(output) => output,
            Err(e) => {
                self.log.error(
                    Some(&name),
                    &format!("Failed while running '{}': {}", spec.command_line(), e),
                );
                self.registry
                    .update_if(
                        path,
                        |r| r.status == interim,
                        RecordUpdate::new()
                            .status(AppStatus::Error(ErrorKind::Exception)),
                    )
                    .await;
                return;
            }
        };

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if !line.trim().is_empty() {
                self.log.info(Some(&name), &format!("[{}] {}", label, line));
            }
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            let message = format!("[{} stderr] {}", label, stderr.trim_end());
            if output.status.success() {
                self.log.warning(Some(&name), &message);
            } else {
                self.log.error(Some(&name), &message);
            }
        }

        let update = if output.status.success() {
            self.log.info(
                Some(&name),
                &format!("{} for '{}' finished successfully", label, name),
            );
            spec.success_patch.clone().status(spec.success_status.clone())
        } else {
            self.log.error(
                Some(&name),
                &format!("{} for '{}' failed ({})", label, name, output.status),
            );
            RecordUpdate::new().status(spec.failure_status.clone())
        };

        self.registry
            .update_if(path, |r| r.status == interim, update)
            .await;
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).to_string()
}
