// ABOUTME: OS process table access: runtime process enumeration, liveness, descendants, signals
// ABOUTME: Listening-port lookup reads /proc on Linux and shells out to lsof on macOS

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System};
use tracing::debug;

/// A process as seen in the OS process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cwd: Option<PathBuf>,
}

/// Everything the supervisor needs from the OS process table.
///
/// Implementations must be cheap enough to call from async code between
/// polls; the reconciliation scan calls them from a blocking task.
pub trait ProcessInspector: Send + Sync {
    /// Processes whose executable name matches one of `exe_names` (case-insensitive)
    fn runtime_processes(&self, exe_names: &[String]) -> Vec<ProcessInfo>;

    /// Exists and is not a zombie
    fn is_alive(&self, pid: u32) -> bool;

    /// All transitive children of `pid`
    fn descendants(&self, pid: u32) -> Vec<u32>;

    /// First TCP port `pid` is listening on
    fn listening_port(&self, pid: u32) -> Option<u16>;

    /// Request graceful termination. Returns false if the signal could not be sent.
    fn terminate(&self, pid: u32) -> bool;

    /// Force-kill. Returns false if the signal could not be sent.
    fn kill(&self, pid: u32) -> bool;
}

/// [`ProcessInspector`] backed by `sysinfo` and platform socket tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

impl SystemProcesses {
    fn all_processes() -> System {
        let mut system = System::new();
        system.refresh_processes_specifics(ProcessRefreshKind::everything());
        system
    }
}

impl ProcessInspector for SystemProcesses {
    fn runtime_processes(&self, exe_names: &[String]) -> Vec<ProcessInfo> {
        let wanted: HashSet<String> = exe_names.iter().map(|n| n.to_lowercase()).collect();
        let system = Self::all_processes();

        let mut found: Vec<ProcessInfo> = system
            .processes()
            .iter()
            .filter(|(_, process)| process.status() != ProcessStatus::Zombie)
            .filter(|(_, process)| wanted.contains(&process.name().to_lowercase()))
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                name: process.name().to_string(),
                cwd: process.cwd().map(|p| p.to_path_buf()),
            })
            .collect();

        // Oldest first so "first match wins" prefers the parent of a worker pool
        found.sort_by_key(|p| p.pid);
        debug!("Found {} runtime processes", found.len());
        found
    }

    fn is_alive(&self, pid: u32) -> bool {
        let sys_pid = Pid::from_u32(pid);
        let mut system = System::new();
        if !system.refresh_process(sys_pid) {
            return false;
        }
        system
            .process(sys_pid)
            .is_some_and(|process| process.status() != ProcessStatus::Zombie)
    }

    fn descendants(&self, pid: u32) -> Vec<u32> {
        let mut system = System::new();
        system.refresh_processes();

        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (child_pid, process) in system.processes() {
            if let Some(parent) = process.parent() {
                children
                    .entry(parent.as_u32())
                    .or_default()
                    .push(child_pid.as_u32());
            }
        }

        let mut out = Vec::new();
        let mut stack = vec![pid];
        let mut visited = HashSet::from([pid]);
        while let Some(current) = stack.pop() {
            for &child in children.get(&current).map(Vec::as_slice).unwrap_or(&[]) {
                if visited.insert(child) {
                    out.push(child);
                    stack.push(child);
                }
            }
        }
        out
    }

    fn listening_port(&self, pid: u32) -> Option<u16> {
        find_listening_port(pid)
    }

    fn terminate(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            send_signal(pid, nix::sys::signal::Signal::SIGTERM)
        }

        #[cfg(not(unix))]
        {
            let mut system = System::new();
            let sys_pid = Pid::from_u32(pid);
            system.refresh_process(sys_pid);
            system
                .process(sys_pid)
                .and_then(|p| p.kill_with(sysinfo::Signal::Term))
                .unwrap_or_else(|| self.kill(pid))
        }
    }

    fn kill(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            send_signal(pid, nix::sys::signal::Signal::SIGKILL)
        }

        #[cfg(not(unix))]
        {
            let mut system = System::new();
            let sys_pid = Pid::from_u32(pid);
            system.refresh_process(sys_pid);
            system.process(sys_pid).is_some_and(|p| p.kill())
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid as NixPid;

    match kill(NixPid::from_raw(pid as i32), signal) {
        Ok(()) => true,
        Err(e) => {
            debug!("Failed to send {} to PID {}: {}", signal, pid, e);
            false
        }
    }
}

/// Find the first listening TCP port owned by `pid` (Linux)
#[cfg(target_os = "linux")]
fn find_listening_port(pid: u32) -> Option<u16> {
    use std::fs;

    // Socket inodes held by the process
    let mut inodes = HashSet::new();
    for fd_entry in fs::read_dir(format!("/proc/{}/fd", pid)).ok()?.flatten() {
        if let Ok(link) = fs::read_link(fd_entry.path()) {
            if let Some(inode) = link
                .to_str()
                .and_then(|l| l.strip_prefix("socket:["))
                .and_then(|l| l.strip_suffix(']'))
                .and_then(|l| l.parse::<u64>().ok())
            {
                inodes.insert(inode);
            }
        }
    }

    if inodes.is_empty() {
        return None;
    }

    ["/proc/net/tcp", "/proc/net/tcp6"]
        .iter()
        .filter_map(|table| fs::read_to_string(table).ok())
        .find_map(|content| listening_port_in_table(&content, &inodes))
}

/// Parse a /proc/net/tcp table and return the local port of the first
/// LISTEN row whose inode is in `inodes`.
#[cfg(any(target_os = "linux", test))]
fn listening_port_in_table(content: &str, inodes: &HashSet<u64>) -> Option<u16> {
    const TCP_LISTEN: &str = "0A";

    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 || parts[3] != TCP_LISTEN {
            continue;
        }

        let Ok(inode) = parts[9].parse::<u64>() else {
            continue;
        };
        if !inodes.contains(&inode) {
            continue;
        }

        // Local address is in format IP:PORT (hex)
        if let Some((_ip, port_hex)) = parts[1].rsplit_once(':') {
            if let Ok(port) = u16::from_str_radix(port_hex, 16) {
                return Some(port);
            }
        }
    }
    None
}

/// Find the first listening TCP port owned by `pid` (macOS)
#[cfg(target_os = "macos")]
fn find_listening_port(pid: u32) -> Option<u16> {
    use std::process::{Command, Stdio};

    // Use lsof on macOS
    let output = Command::new("lsof")
        .args(["-Pan", "-p", &pid.to_string(), "-iTCP", "-sTCP:LISTEN", "-Fn"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8(output.stdout).ok()?;
    stdout
        .lines()
        .filter_map(|line| line.strip_prefix('n'))
        .find_map(|addr| addr.rsplit_once(':').and_then(|(_, port)| port.parse().ok()))
}

/// Fallback for unsupported platforms
#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn find_listening_port(_pid: u32) -> Option<u16> {
    debug!("Listening port lookup not supported on this platform");
    None
}
