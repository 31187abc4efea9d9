use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::channel::PluginChannel;
use crate::error::PluginError;

/// Env var carrying the plugin's source directory into the worker process.
/// Set once at spawn; immutable for the instance's lifetime.
pub const PLUGIN_DIR_ENV: &str = "QUIVER_PLUGIN_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Terminated,
}

/// Out-of-band notification to whoever owns the instance. Faults are not
/// terminal; exactly one `Exit` is emitted per worker.
#[derive(Debug, Clone)]
pub enum LifecycleReport {
    Fault {
        plugin_dir: PathBuf,
        message: String,
        at: DateTime<Utc>,
    },
    Exit {
        plugin_dir: PathBuf,
        code: Option<i32>,
        clean: bool,
        at: DateTime<Utc>,
    },
}

/// Owns one worker process: spawn, observe faults and termination, report
/// both upward. Other instances are never affected by this worker dying.
///
/// The terminal transition happens in a single wait task, so a kill racing
/// a natural exit still produces exactly one `Terminated` state change and
/// one `Exit` report. Dropping the supervisor kills the worker.
pub struct WorkerSupervisor {
    plugin_dir: PathBuf,
    state: watch::Receiver<WorkerState>,
    kill: watch::Sender<bool>,
}

impl WorkerSupervisor {
    /// Spawn `program` with stdio piped for the hook protocol and stderr
    /// inherited, and wire the channel over it. Lifecycle reports flow to
    /// `reports` for as long as the worker lives.
    pub fn spawn(
        program: &Path,
        plugin_dir: &Path,
        reports: mpsc::UnboundedSender<LifecycleReport>,
    ) -> Result<(Self, PluginChannel), PluginError> {
        let mut child = Command::new(program)
            .env(PLUGIN_DIR_ENV, plugin_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PluginError::Spawn(io::Error::other("worker stdin unavailable")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::Spawn(io::Error::other("worker stdout unavailable")))?;

        let (fault_tx, mut fault_rx) = mpsc::unbounded_channel::<String>();
        let channel = PluginChannel::from_child_io(stdin, stdout, fault_tx);

        let (state_tx, state_rx) = watch::channel(WorkerState::Starting);
        let (kill_tx, mut kill_rx) = watch::channel(false);

        // protocol-level faults are reported but never kill the worker
        let fault_dir = plugin_dir.to_path_buf();
        let fault_reports = reports.clone();
        tokio::spawn(async move {
            while let Some(message) = fault_rx.recv().await {
                warn!(plugin = %fault_dir.display(), "worker fault: {message}");
                let _ = fault_reports.send(LifecycleReport::Fault {
                    plugin_dir: fault_dir.clone(),
                    message,
                    at: Utc::now(),
                });
            }
        });

        // wait task: the only writer of the terminal transition
        let exit_dir = plugin_dir.to_path_buf();
        let closer = channel.closer();
        tokio::spawn(async move {
            let _ = state_tx.send(WorkerState::Running);
            let status = tokio::select! {
                status = child.wait() => status,
                // fires on kill() and on supervisor drop
                _ = kill_rx.changed() => {
                    info!(plugin = %exit_dir.display(), "killing plugin worker");
                    let _ = child.kill().await;
                    child.wait().await
                }
            };
            closer.close();
            let _ = state_tx.send(WorkerState::Terminated);

            let (code, clean) = match &status {
                Ok(st) => (st.code(), st.success()),
                Err(_) => (None, false),
            };
            if clean {
                info!(plugin = %exit_dir.display(), "worker exited cleanly");
            } else {
                warn!(plugin = %exit_dir.display(), code = ?code, "worker exited abnormally");
            }
            let _ = reports.send(LifecycleReport::Exit {
                plugin_dir: exit_dir,
                code,
                clean,
                at: Utc::now(),
            });
        });

        let supervisor = Self {
            plugin_dir: plugin_dir.to_path_buf(),
            state: state_rx,
            kill: kill_tx,
        };
        Ok((supervisor, channel))
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Request termination. Idempotent; a second call after the worker is
    /// gone has no effect.
    pub fn kill(&self) {
        let _ = self.kill.send(true);
    }

    /// Resolves once the worker has reached `Terminated`.
    pub async fn terminated(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == WorkerState::Terminated).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_of_missing_program_fails() {
        let (reports, _rx) = mpsc::unbounded_channel();
        let err = WorkerSupervisor::spawn(
            Path::new("/nonexistent/quiver-worker"),
            Path::new("/tmp/some-plugin"),
            reports,
        )
        .err()
        .expect("spawn should fail");
        assert!(matches!(err, PluginError::Spawn(_)));
    }
}
