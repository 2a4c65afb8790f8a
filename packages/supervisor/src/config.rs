// ABOUTME: Runtime configuration for the supervisor: projects root, runtime commands and timeouts
// ABOUTME: Defaults follow the platform; environment variables override individual values

use nodefleet_config::constants::{
    NODEFLEET_DRAIN_TIMEOUT_SECS, NODEFLEET_NODE_CMD, NODEFLEET_NPM_CMD,
    NODEFLEET_STOP_GRACE_SECS, NODEFLEET_STOP_KILL_SECS,
};
use nodefleet_core::COMMON_ENTRY_FILES;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[cfg(windows)]
const DEFAULT_NPM_CMD: &str = "npm.cmd";
#[cfg(not(windows))]
const DEFAULT_NPM_CMD: &str = "npm";

#[cfg(windows)]
const DEFAULT_NODE_CMD: &str = "node.exe";
#[cfg(not(windows))]
const DEFAULT_NODE_CMD: &str = "node";

/// Executable names recognized as the runtime during adoption
const RUNTIME_EXE_NAMES: &[&str] = &["node", "node.exe"];

/// Bounded waits used by the termination protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopTimeouts {
    /// Owned handle: wait after graceful termination
    pub graceful: Duration,
    /// Owned handle: wait after force-kill
    pub forced: Duration,
    /// By PID: wait for descendants after graceful termination
    pub descendants: Duration,
    /// By PID: wait for the parent after graceful termination
    pub pid_graceful: Duration,
    /// By PID: wait for the parent after force-kill
    pub pid_forced: Duration,
}

impl Default for StopTimeouts {
    fn default() -> Self {
        Self {
            graceful: Duration::from_secs(5),
            forced: Duration::from_secs(3),
            descendants: Duration::from_secs(2),
            pid_graceful: Duration::from_secs(3),
            pid_forced: Duration::from_secs(2),
        }
    }
}

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub projects_root: PathBuf,
    /// Package manager command (`npm start`, `npm install`, ...)
    pub npm_command: String,
    /// Runtime command used for `main` and conventional entry files
    pub node_command: String,
    /// Process names adopted by the reconciliation scan
    pub runtime_exe_names: Vec<String>,
    pub entry_files: Vec<String>,
    pub stop_timeouts: StopTimeouts,
    /// Per-project wait during shutdown drain
    pub drain_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(projects_root: impl Into<PathBuf>) -> Self {
        Self {
            projects_root: projects_root.into(),
            npm_command: DEFAULT_NPM_CMD.to_string(),
            node_command: DEFAULT_NODE_CMD.to_string(),
            runtime_exe_names: RUNTIME_EXE_NAMES.iter().map(|s| s.to_string()).collect(),
            entry_files: COMMON_ENTRY_FILES.iter().map(|s| s.to_string()).collect(),
            stop_timeouts: StopTimeouts::default(),
            drain_timeout: Duration::from_secs(7),
        }
    }

    /// Build the configuration and apply `NODEFLEET_*` overrides.
    pub fn from_env(projects_root: impl Into<PathBuf>) -> Self {
        let mut config = Self::new(projects_root);

        if let Some(npm) = non_empty_var(NODEFLEET_NPM_CMD) {
            config.npm_command = npm;
        }
        if let Some(node) = non_empty_var(NODEFLEET_NODE_CMD) {
            config.node_command = node;
        }
        if let Some(secs) = secs_var(NODEFLEET_STOP_GRACE_SECS) {
            config.stop_timeouts.graceful = secs;
        }
        if let Some(secs) = secs_var(NODEFLEET_STOP_KILL_SECS) {
            config.stop_timeouts.forced = secs;
        }
        if let Some(secs) = secs_var(NODEFLEET_DRAIN_TIMEOUT_SECS) {
            config.drain_timeout = secs;
        }

        config
    }

    pub fn with_stop_timeouts(mut self, timeouts: StopTimeouts) -> Self {
        self.stop_timeouts = timeouts;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_commands(mut self, npm: impl Into<String>, node: impl Into<String>) -> Self {
        self.npm_command = npm.into();
        self.node_command = node.into();
        self
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn secs_var(name: &str) -> Option<Duration> {
    let raw = non_empty_var(name)?;
    match raw.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs >= 0.0 => Some(Duration::from_secs_f64(secs)),
        _ => {
            warn!("Ignoring invalid {}={:?}, expected seconds", name, raw);
            None
        }
    }
}
