// ABOUTME: Handle to a child process spawned by the supervisor itself
// ABOUTME: Waits poll `try_wait` so the handle is never locked across a blocking wait

use std::fmt;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A live-process handle obtained from our own spawn call.
///
/// Clones share the same child. Equality is identity of the underlying child.
#[derive(Clone)]
pub struct OwnedProcess {
    pid: u32,
    child: Arc<Mutex<Child>>,
}

impl fmt::Debug for OwnedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedProcess").field("pid", &self.pid).finish()
    }
}

impl PartialEq for OwnedProcess {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.child, &other.child)
    }
}

impl Eq for OwnedProcess {}

impl OwnedProcess {
    /// Wrap a spawned child. Returns `None` if the child was already reaped.
    pub fn new(child: Child) -> Option<Self> {
        let pid = child.id()?;
        Some(Self {
            pid,
            child: Arc::new(Mutex::new(child)),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking exit check. Errors querying the child count as exited.
    pub async fn exit_status(&self) -> Option<ExitStatus> {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                debug!("try_wait failed for PID {}: {}", self.pid, e);
                None
            }
        }
    }

    pub async fn has_exited(&self) -> bool {
        let mut child = self.child.lock().await;
        !matches!(child.try_wait(), Ok(None))
    }

    /// Request graceful termination (SIGTERM on unix).
    pub async fn terminate(&self) -> io::Result<()> {
        let mut child = self.child.lock().await;
        if !matches!(child.try_wait(), Ok(None)) {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM)
                .map_err(|e| io::Error::from_raw_os_error(e as i32))
        }

        #[cfg(not(unix))]
        {
            child.start_kill()
        }
    }

    /// Force-kill without waiting.
    pub async fn kill(&self) -> io::Result<()> {
        let mut child = self.child.lock().await;
        if !matches!(child.try_wait(), Ok(None)) {
            return Ok(());
        }
        child.start_kill()
    }

    /// Wait for exit up to `timeout`. `None` means the process is still alive.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut child = self.child.lock().await;
                match child.try_wait() {
                    Ok(Some(status)) => return Some(status),
                    Ok(None) => {}
                    Err(e) => {
                        debug!("try_wait failed for PID {}: {}", self.pid, e);
                        return None;
                    }
                }
            }

            if Instant::now() >= deadline {
                return None;
            }
            sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Wait for exit without a deadline.
    pub async fn wait(&self) -> io::Result<ExitStatus> {
        loop {
            {
                let mut child = self.child.lock().await;
                if let Some(status) = child.try_wait()? {
                    return Ok(status);
                }
            }
            sleep(EXIT_POLL_INTERVAL).await;
        }
    }
}
