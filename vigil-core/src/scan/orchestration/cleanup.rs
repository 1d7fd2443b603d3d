//! Lifecycle of the per-job ephemeral chain process.
//!
//! The DEPLOY stage attaches the spawned process to a [`ChainScope`]. The
//! orchestrator releases the scope through a [`ResourceCleanup`] exactly once
//! on pipeline exit (and early when DEPLOY fails), so kill logic lives in one
//! place instead of every error branch.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{process::Child, sync::Mutex, time::timeout};
use tracing::{debug, info, warn};

/// Handle to a running local chain simulator.
pub struct ChainProcess {
    child: Child,
    port: u16,
}

impl fmt::Debug for ChainProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainProcess")
            .field("pid", &self.child.id())
            .field("port", &self.port)
            .finish()
    }
}

impl ChainProcess {
    pub fn new(child: Child, port: u16) -> Self {
        Self { child, port }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// Job-scoped slot holding at most one chain process.
#[derive(Clone, Default)]
pub struct ChainScope {
    inner: Arc<Mutex<Option<ChainProcess>>>,
}

impl fmt::Debug for ChainScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attached = self
            .inner
            .try_lock()
            .map(|guard| guard.is_some())
            .unwrap_or(true);
        f.debug_struct("ChainScope")
            .field("attached", &attached)
            .finish()
    }
}

impl ChainScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a freshly spawned process. Any previously attached process is
    /// returned so the caller can hand it to cleanup.
    pub async fn attach(&self, process: ChainProcess) -> Option<ChainProcess> {
        self.inner.lock().await.replace(process)
    }

    pub async fn take(&self) -> Option<ChainProcess> {
        self.inner.lock().await.take()
    }

    pub async fn is_attached(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Take whatever is attached and tear it down. Safe to call repeatedly.
    pub async fn release(&self, cleanup: &dyn ResourceCleanup) {
        let process = self.take().await;
        cleanup.cleanup(process).await;
    }
}

/// Terminates chain processes. Implementations must never fail: errors are
/// logged and swallowed.
#[async_trait]
pub trait ResourceCleanup: Send + Sync {
    async fn cleanup(&self, process: Option<ChainProcess>);
}

/// SIGTERM, bounded wait, then SIGKILL.
#[derive(Clone, Copy, Debug)]
pub struct ProcessCleanupManager {
    grace_period: Duration,
}

impl Default for ProcessCleanupManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ProcessCleanupManager {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    fn request_termination(process: &mut ChainProcess) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = process.pid() {
                if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!(pid, error = %err, "failed to signal chain process");
                }
                return;
            }
        }

        if let Err(err) = process.child.start_kill() {
            warn!(error = %err, "failed to kill chain process");
        }
    }
}

#[async_trait]
impl ResourceCleanup for ProcessCleanupManager {
    async fn cleanup(&self, process: Option<ChainProcess>) {
        let Some(mut process) = process else {
            return;
        };
        let pid = process.pid();
        let port = process.port();

        if !process.is_alive() {
            debug!(?pid, port, "chain process already exited");
            return;
        }

        Self::request_termination(&mut process);
        match timeout(self.grace_period, process.child.wait()).await {
            Ok(Ok(status)) => {
                info!(?pid, port, %status, "chain process stopped");
                return;
            }
            Ok(Err(err)) => {
                warn!(?pid, port, error = %err, "waiting on chain process failed");
            }
            Err(_) => {
                warn!(?pid, port, grace = ?self.grace_period, "chain process ignored SIGTERM; killing");
            }
        }

        if let Err(err) = process.child.start_kill() {
            warn!(?pid, port, error = %err, "force kill failed");
            return;
        }
        match timeout(self.grace_period, process.child.wait()).await {
            Ok(Ok(status)) => info!(?pid, port, %status, "chain process killed"),
            Ok(Err(err)) => warn!(?pid, port, error = %err, "reaping killed chain process failed"),
            Err(_) => warn!(?pid, port, "chain process still running after SIGKILL"),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::process::Command;

    fn spawn(script: &str) -> ChainProcess {
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sh");
        ChainProcess::new(child, 18545)
    }

    #[tokio::test]
    async fn cleanup_without_process_is_a_noop() {
        ProcessCleanupManager::default().cleanup(None).await;
    }

    #[tokio::test]
    async fn graceful_termination() {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let mut process = spawn("sleep 30");
        assert!(process.is_alive());
        let pid = process.pid().expect("running child has a pid");

        ProcessCleanupManager::new(Duration::from_secs(5))
            .cleanup(Some(process))
            .await;

        // Reaped by cleanup, so the pid no longer exists.
        assert!(kill(Pid::from_raw(pid as i32), None).is_err());
    }

    #[tokio::test]
    async fn force_kills_processes_ignoring_sigterm() {
        let process = spawn("trap '' TERM; sleep 30");
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let scope = ChainScope::new();
        scope.attach(process).await;

        let manager = ProcessCleanupManager::new(Duration::from_millis(200));
        scope.release(&manager).await;
        // Second release finds nothing attached.
        scope.release(&manager).await;
        assert!(!scope.is_attached().await);
    }
}
