// ABOUTME: Termination protocol: graceful-then-forceful stop of an owned or adopted process tree
// ABOUTME: Every accepted stop settles the record and fires its completion signal exactly once

use nodefleet_core::{AppStatus, ErrorKind};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tracing::{debug, error};

use crate::activity::LogSink;
use crate::config::StopTimeouts;
use crate::inspect::ProcessInspector;
use crate::process::OwnedProcess;
use crate::registry::Registry;
use crate::types::{ActionRejected, RecordUpdate};

const ALIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Completion signal of a stop request. Resolves to the settled status.
#[derive(Debug)]
pub struct StopSignal {
    rx: oneshot::Receiver<AppStatus>,
}

impl StopSignal {
    fn pending() -> (oneshot::Sender<AppStatus>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A signal that has already fired.
    pub fn completed(status: AppStatus) -> Self {
        let (tx, signal) = Self::pending();
        let _ = tx.send(status);
        signal
    }

    /// Wait for the stop to settle. A lost sender counts as a failed stop.
    pub async fn wait(self) -> AppStatus {
        self.rx
            .await
            .unwrap_or(AppStatus::Error(ErrorKind::Stop))
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    pub async fn wait_timeout(self, timeout: Duration) -> Option<AppStatus> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

/// What a stop request resolved to while holding the record lock
enum Plan {
    Settled(AppStatus),
    Escalate {
        handle: Option<OwnedProcess>,
        pid: Option<u32>,
        /// Stopped mid-launch; the executor may not have attached its process yet
        launching: bool,
    },
    /// Idle record still pointing at a process; liveness is checked outside the lock
    Reclaim {
        status: AppStatus,
        handle: Option<OwnedProcess>,
        pid: Option<u32>,
    },
}

#[derive(Clone)]
pub struct Terminator {
    registry: Registry,
    log: Arc<dyn LogSink>,
    inspector: Arc<dyn ProcessInspector>,
    timeouts: StopTimeouts,
}

impl Terminator {
    pub fn new(
        registry: Registry,
        log: Arc<dyn LogSink>,
        inspector: Arc<dyn ProcessInspector>,
        timeouts: StopTimeouts,
    ) -> Self {
        Self {
            registry,
            log,
            inspector,
            timeouts,
        }
    }

    /// Stop whatever process the record at `path` points at.
    ///
    /// Already `Stopping` completes immediately. A record that is idle but
    /// still references a live PID is reclaimed; one with nothing alive is
    /// normalized to `Stopped`.
    ///
    /// # Errors
    ///
    /// * `ActionRejected::UnknownProject` - No record at `path`
    /// * `ActionRejected::Busy` - Busy with a non-stoppable action (install, clean, ...)
    pub async fn stop(&self, path: &Path) -> Result<StopSignal, ActionRejected> {
        let (record, plan) = self
            .registry
            .transition(path, |record| {
                if record.status == AppStatus::Stopping {
                    return Ok((RecordUpdate::new(), Plan::Settled(AppStatus::Stopping)));
                }
                if record.status.is_stoppable() {
                    return Ok((
                        RecordUpdate::new().status(AppStatus::Stopping),
                        Plan::Escalate {
                            handle: record.owned_handle.clone(),
                            pid: record.pid,
                            launching: record.is_busy(),
                        },
                    ));
                }
                if record.is_busy() {
                    return Err(ActionRejected::Busy {
                        name: record.name.clone(),
                        status: record.status.clone(),
                    });
                }
                if record.owned_handle.is_some() || record.pid.is_some() {
                    return Ok((
                        RecordUpdate::new(),
                        Plan::Reclaim {
                            status: record.status.clone(),
                            handle: record.owned_handle.clone(),
                            pid: record.pid,
                        },
                    ));
                }
                Ok((
                    RecordUpdate::new()
                        .status(AppStatus::Stopped)
                        .process_cleared(),
                    Plan::Settled(AppStatus::Stopped),
                ))
            })
            .await?;

        let name = record.name.clone();
        let (handle, pid, launching) = match plan {
            Plan::Settled(status) => {
                debug!("Stop for {} settled immediately as {}", path.display(), status);
                return Ok(StopSignal::completed(status));
            }
            Plan::Escalate {
                handle,
                pid,
                launching,
            } => (handle, pid, launching),
            Plan::Reclaim {
                status,
                handle,
                pid,
            } => {
                if !self.is_running(handle.as_ref(), pid).await {
                    self.registry
                        .update(
                            path,
                            RecordUpdate::new()
                                .status(AppStatus::Stopped)
                                .process_cleared(),
                        )
                        .await;
                    return Ok(StopSignal::completed(AppStatus::Stopped));
                }

                let claimed = self
                    .registry
                    .update_if(
                        path,
                        |r| r.status == status,
                        RecordUpdate::new().status(AppStatus::Stopping),
                    )
                    .await;
                if !claimed {
                    // Someone else moved the record on while we checked liveness
                    let current = self
                        .registry
                        .read(path)
                        .await
                        .map(|r| r.status)
                        .unwrap_or_default();
                    return Ok(StopSignal::completed(current));
                }
                self.log.info(
                    Some(&name),
                    &format!("Reclaiming untracked process for '{}'", name),
                );
                (handle, pid, false)
            }
        };

        self.log.info(Some(&name), &format!("Stopping '{}'...", name));

        let (tx, signal) = StopSignal::pending();
        let terminator = self.clone();
        let path = path.to_path_buf();
        tokio::spawn(async move {
            let inner = tokio::spawn({
                let terminator = terminator.clone();
                let name = name.clone();
                let path = path.clone();
                async move {
                    let target = if launching && handle.is_none() && pid.is_none() {
                        terminator.await_launch(&path).await
                    } else {
                        Some((handle, pid))
                    };
                    match target {
                        Some((handle, pid)) => terminator.escalate(&name, handle, pid).await,
                        None => {
                            terminator.log.error(
                                Some(&name),
                                &format!("'{}' never finished launching; cannot stop it", name),
                            );
                            false
                        }
                    }
                }
            });

            let confirmed = match inner.await {
                Ok(confirmed) => confirmed,
                Err(e) => {
                    error!("Stop task for {} failed: {}", path.display(), e);
                    false
                }
            };

            let status = terminator.settle(&path, &name, confirmed).await;
            let _ = tx.send(status);
        });

        Ok(signal)
    }

    /// Wait for an in-flight launch to attach its process.
    ///
    /// Resolves to `(None, None)` when the record is gone or the launch failed
    /// on its own, and to `None` when nothing attached within the graceful timeout.
    async fn await_launch(&self, path: &Path) -> Option<(Option<OwnedProcess>, Option<u32>)> {
        let deadline = Instant::now() + self.timeouts.graceful;
        loop {
            match self.registry.read(path).await {
                None => return Some((None, None)),
                Some(r) if r.owned_handle.is_some() || r.pid.is_some() => {
                    return Some((r.owned_handle, r.pid));
                }
                Some(r) if r.status != AppStatus::Stopping => return Some((None, None)),
                Some(_) => {}
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(ALIVE_POLL_INTERVAL).await;
        }
    }

    async fn settle(&self, path: &Path, name: &str, confirmed: bool) -> AppStatus {
        if confirmed {
            let settled = self
                .registry
                .update_if(
                    path,
                    |r| r.status == AppStatus::Stopping,
                    RecordUpdate::new()
                        .status(AppStatus::Stopped)
                        .process_cleared(),
                )
                .await;
            if !settled {
                // A launch that failed by itself already recorded why
                let current = self.registry.read(path).await.map(|r| r.status);
                return current.unwrap_or(AppStatus::Stopped);
            }
            self.log.info(Some(name), &format!("Stopped '{}'", name));
            AppStatus::Stopped
        } else {
            // Handle and PID stay so a later stop can retry
            let status = AppStatus::Error(ErrorKind::Stop);
            self.registry
                .update(path, RecordUpdate::new().status(status.clone()))
                .await;
            self.log.error(
                Some(name),
                &format!("Could not confirm that '{}' stopped", name),
            );
            status
        }
    }

    async fn is_running(&self, handle: Option<&OwnedProcess>, pid: Option<u32>) -> bool {
        if let Some(handle) = handle {
            if !handle.has_exited().await {
                return true;
            }
        }
        match pid {
            Some(pid) => self.alive(pid).await,
            None => false,
        }
    }

    /// Returns true once death is confirmed.
    async fn escalate(&self, name: &str, handle: Option<OwnedProcess>, pid: Option<u32>) -> bool {
        if let Some(handle) = handle {
            if !handle.has_exited().await {
                return self.stop_owned(name, &handle).await;
            }
            if pid.map_or(true, |pid| pid == handle.pid()) {
                return true;
            }
        }

        match pid {
            Some(pid) => self.stop_by_pid(name, pid).await,
            None => {
                debug!("Nothing attached to '{}'; nothing to stop", name);
                true
            }
        }
    }

    async fn stop_owned(&self, name: &str, handle: &OwnedProcess) -> bool {
        let children = self.descendants(handle.pid()).await;

        if let Err(e) = handle.terminate().await {
            self.log.warning(
                Some(name),
                &format!("Failed to signal '{}' (PID: {}): {}", name, handle.pid(), e),
            );
        }

        let mut stopped = handle.wait_timeout(self.timeouts.graceful).await.is_some();
        if !stopped {
            self.log.warning(
                Some(name),
                &format!(
                    "'{}' did not exit within {:.1}s; force-killing",
                    name,
                    self.timeouts.graceful.as_secs_f64()
                ),
            );
            if let Err(e) = handle.kill().await {
                self.log.warning(
                    Some(name),
                    &format!("Failed to kill '{}' (PID: {}): {}", name, handle.pid(), e),
                );
            }
            stopped = handle.wait_timeout(self.timeouts.forced).await.is_some();
        }

        if stopped {
            // The runtime may have been started through a wrapper; don't leave its workers behind
            self.reap(name, children).await;
        }
        stopped
    }

    async fn stop_by_pid(&self, name: &str, pid: u32) -> bool {
        if !self.alive(pid).await {
            debug!("PID {} for '{}' is already gone", pid, name);
            return true;
        }

        let children = self.descendants(pid).await;
        self.reap(name, children).await;

        self.signal(pid, false).await;
        if self.wait_gone(&[pid], self.timeouts.pid_graceful).await {
            return true;
        }

        self.log.warning(
            Some(name),
            &format!("PID {} for '{}' ignored termination; force-killing", pid, name),
        );
        self.signal(pid, true).await;
        self.wait_gone(&[pid], self.timeouts.pid_forced).await
    }

    /// Terminate `pids`, wait briefly, then force-kill survivors.
    async fn reap(&self, name: &str, pids: Vec<u32>) {
        if pids.is_empty() {
            return;
        }
        debug!("Terminating {} descendant(s) of '{}'", pids.len(), name);

        for &pid in &pids {
            self.signal(pid, false).await;
        }
        if self.wait_gone(&pids, self.timeouts.descendants).await {
            return;
        }

        for &pid in &pids {
            if self.alive(pid).await {
                self.signal(pid, true).await;
            }
        }
    }

    async fn wait_gone(&self, pids: &[u32], timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let mut any_alive = false;
            for &pid in pids {
                if self.alive(pid).await {
                    any_alive = true;
                    break;
                }
            }
            if !any_alive {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(ALIVE_POLL_INTERVAL).await;
        }
    }

    async fn alive(&self, pid: u32) -> bool {
        let inspector = self.inspector.clone();
        tokio::task::spawn_blocking(move || inspector.is_alive(pid))
            .await
            .unwrap_or(false)
    }

    async fn descendants(&self, pid: u32) -> Vec<u32> {
        let inspector = self.inspector.clone();
        tokio::task::spawn_blocking(move || inspector.descendants(pid))
            .await
            .unwrap_or_default()
    }

    async fn signal(&self, pid: u32, force: bool) {
        let inspector = self.inspector.clone();
        let sent = tokio::task::spawn_blocking(move || {
            if force {
                inspector.kill(pid)
            } else {
                inspector.terminate(pid)
            }
        })
        .await
        .unwrap_or(false);
        if !sent {
            debug!("Signal to PID {} was not delivered", pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityLog;
    use crate::inspect::ProcessInfo;
    use crate::types::AppRecord;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Processes that die on the first signal of the configured kind
    #[derive(Default)]
    struct FakeProcesses {
        alive: Mutex<HashSet<u32>>,
        ignores_term: HashSet<u32>,
        signals: Mutex<Vec<(u32, bool)>>,
    }

    impl ProcessInspector for FakeProcesses {
        fn runtime_processes(&self, _exe_names: &[String]) -> Vec<ProcessInfo> {
            Vec::new()
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }

        fn descendants(&self, _pid: u32) -> Vec<u32> {
            Vec::new()
        }

        fn listening_port(&self, _pid: u32) -> Option<u16> {
            None
        }

        fn terminate(&self, pid: u32) -> bool {
            self.signals.lock().unwrap().push((pid, false));
            if !self.ignores_term.contains(&pid) {
                self.alive.lock().unwrap().remove(&pid);
            }
            true
        }

        fn kill(&self, pid: u32) -> bool {
            self.signals.lock().unwrap().push((pid, true));
            self.alive.lock().unwrap().remove(&pid);
            true
        }
    }

    fn short_timeouts() -> StopTimeouts {
        StopTimeouts {
            graceful: Duration::from_millis(200),
            forced: Duration::from_millis(200),
            descendants: Duration::from_millis(200),
            pid_graceful: Duration::from_millis(200),
            pid_forced: Duration::from_millis(200),
        }
    }

    async fn setup(
        status: AppStatus,
        pid: Option<u32>,
        processes: FakeProcesses,
    ) -> (Terminator, Registry, Arc<FakeProcesses>) {
        let registry = Registry::new();
        let mut record = AppRecord::new("/apps/web", "web");
        record.status = status;
        record.pid = pid;
        record.port = pid.map(|_| 3000);
        registry.insert(record).await;

        let processes = Arc::new(processes);
        let terminator = Terminator::new(
            registry.clone(),
            Arc::new(ActivityLog::new()),
            processes.clone(),
            short_timeouts(),
        );
        (terminator, registry, processes)
    }

    #[tokio::test]
    async fn test_adopted_pid_is_terminated() {
        let processes = FakeProcesses {
            alive: Mutex::new(HashSet::from([4242])),
            ..Default::default()
        };
        let (terminator, registry, processes) =
            setup(AppStatus::Running, Some(4242), processes).await;

        let signal = terminator.stop(Path::new("/apps/web")).await.unwrap();
        assert_eq!(signal.wait().await, AppStatus::Stopped);

        let record = registry.read(Path::new("/apps/web")).await.unwrap();
        assert_eq!(record.status, AppStatus::Stopped);
        assert_eq!(record.pid, None);
        assert_eq!(record.port, None);
        assert_eq!(*processes.signals.lock().unwrap(), vec![(4242, false)]);
    }

    #[tokio::test]
    async fn test_ignored_term_escalates_to_kill() {
        let processes = FakeProcesses {
            alive: Mutex::new(HashSet::from([4242])),
            ignores_term: HashSet::from([4242]),
            ..Default::default()
        };
        let (terminator, _registry, processes) =
            setup(AppStatus::Running, Some(4242), processes).await;

        let status = terminator
            .stop(Path::new("/apps/web"))
            .await
            .unwrap()
            .wait()
            .await;
        assert_eq!(status, AppStatus::Stopped);
        assert_eq!(
            *processes.signals.lock().unwrap(),
            vec![(4242, false), (4242, true)]
        );
    }

    #[tokio::test]
    async fn test_idle_record_is_normalized() {
        let (terminator, registry, processes) =
            setup(AppStatus::Installed, None, FakeProcesses::default()).await;

        let status = terminator
            .stop(Path::new("/apps/web"))
            .await
            .unwrap()
            .wait()
            .await;
        assert_eq!(status, AppStatus::Stopped);
        assert_eq!(
            registry.read(Path::new("/apps/web")).await.unwrap().status,
            AppStatus::Stopped
        );
        assert!(processes.signals.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_pid_is_cleared_without_signals() {
        let (terminator, registry, processes) =
            setup(AppStatus::Error(ErrorKind::Start), Some(999), FakeProcesses::default()).await;

        let status = terminator
            .stop(Path::new("/apps/web"))
            .await
            .unwrap()
            .wait()
            .await;
        assert_eq!(status, AppStatus::Stopped);
        assert_eq!(registry.read(Path::new("/apps/web")).await.unwrap().pid, None);
        assert!(processes.signals.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_stop_is_noop() {
        let processes = FakeProcesses {
            alive: Mutex::new(HashSet::from([4242])),
            ignores_term: HashSet::from([4242]),
            ..Default::default()
        };
        let (terminator, _registry, processes) =
            setup(AppStatus::Running, Some(4242), processes).await;

        let first = terminator.stop(Path::new("/apps/web")).await.unwrap();
        let second = terminator.stop(Path::new("/apps/web")).await.unwrap();

        assert_eq!(second.wait().await, AppStatus::Stopping);
        assert_eq!(first.wait().await, AppStatus::Stopped);
        // One graceful request and one kill: a single escalation
        assert_eq!(processes.signals.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_while_starting_waits_for_the_launch() {
        let processes = FakeProcesses {
            alive: Mutex::new(HashSet::from([4242])),
            ..Default::default()
        };
        let (terminator, registry, processes) =
            setup(AppStatus::Starting, None, processes).await;

        let signal = terminator.stop(Path::new("/apps/web")).await.unwrap();

        // The executor attaches its process after the stop was accepted
        tokio::time::sleep(Duration::from_millis(50)).await;
        let attached = registry
            .update_if(
                Path::new("/apps/web"),
                |r| r.status == AppStatus::Stopping,
                RecordUpdate::new().pid(Some(4242)),
            )
            .await;
        assert!(attached);

        assert_eq!(signal.wait().await, AppStatus::Stopped);
        assert_eq!(*processes.signals.lock().unwrap(), vec![(4242, false)]);
        assert_eq!(registry.read(Path::new("/apps/web")).await.unwrap().pid, None);
    }

    #[tokio::test]
    async fn test_stop_while_starting_keeps_launch_failure() {
        let (terminator, registry, processes) =
            setup(AppStatus::Starting, None, FakeProcesses::default()).await;

        let signal = terminator.stop(Path::new("/apps/web")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry
            .update(
                Path::new("/apps/web"),
                RecordUpdate::new().status(AppStatus::Error(ErrorKind::Command)),
            )
            .await;

        assert_eq!(signal.wait().await, AppStatus::Error(ErrorKind::Command));
        assert_eq!(
            registry.read(Path::new("/apps/web")).await.unwrap().status,
            AppStatus::Error(ErrorKind::Command)
        );
        assert!(processes.signals.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_launch_that_never_attaches_is_not_reported_stopped() {
        let (terminator, _registry, _processes) =
            setup(AppStatus::Starting, None, FakeProcesses::default()).await;

        let status = terminator
            .stop(Path::new("/apps/web"))
            .await
            .unwrap()
            .wait()
            .await;
        assert_eq!(status, AppStatus::Error(ErrorKind::Stop));
    }

    #[tokio::test]
    async fn test_busy_install_is_rejected() {
        let (terminator, _registry, _processes) =
            setup(AppStatus::Installing, None, FakeProcesses::default()).await;

        let result = terminator.stop(Path::new("/apps/web")).await;
        assert!(matches!(result, Err(ActionRejected::Busy { .. })));
    }

    #[tokio::test]
    async fn test_unkillable_process_settles_in_error() {
        struct Unkillable;
        impl ProcessInspector for Unkillable {
            fn runtime_processes(&self, _exe_names: &[String]) -> Vec<ProcessInfo> {
                Vec::new()
            }
            fn is_alive(&self, _pid: u32) -> bool {
                true
            }
            fn descendants(&self, _pid: u32) -> Vec<u32> {
                Vec::new()
            }
            fn listening_port(&self, _pid: u32) -> Option<u16> {
                None
            }
            fn terminate(&self, _pid: u32) -> bool {
                true
            }
            fn kill(&self, _pid: u32) -> bool {
                true
            }
        }

        let registry = Registry::new();
        let mut record = AppRecord::new("/apps/web", "web");
        record.status = AppStatus::Running;
        record.pid = Some(7);
        registry.insert(record).await;

        let terminator = Terminator::new(
            registry.clone(),
            Arc::new(ActivityLog::new()),
            Arc::new(Unkillable),
            short_timeouts(),
        );

        let status = terminator
            .stop(Path::new("/apps/web"))
            .await
            .unwrap()
            .wait()
            .await;
        assert_eq!(status, AppStatus::Error(ErrorKind::Stop));

        // PID kept so the stop can be retried
        let record = registry.read(Path::new("/apps/web")).await.unwrap();
        assert_eq!(record.pid, Some(7));
    }
}
