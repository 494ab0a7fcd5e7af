//! Keeps one sandbox worker attached to the bridge, relaunching it when it
//! exits or when a restart is requested.

use std::sync::Arc;
use std::time::Duration;

use bridge::PdpBridge;
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, ChildStdout};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::SandboxLauncher;
use crate::client::SandboxClient;

const RESTART_QUEUE: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// Consecutive failed launches (or crashes before `Ready`) tolerated
    /// before the bridge is torn down.
    pub max_restarts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl SupervisorConfig {
    fn backoff(&self, failures: usize) -> Duration {
        let exponent = failures.saturating_sub(1).min(16) as u32;
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Closed,
    Restart,
    Shutdown,
}

pub struct SupervisorHandle {
    restart: mpsc::Sender<()>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn request_restart(&self) -> Result<(), String> {
        self.restart.try_send(()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => "restart already pending".to_owned(),
            mpsc::error::TrySendError::Closed(_) => "supervisor stopped".to_owned(),
        })
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            error!(error = %err, "supervisor task failed");
        }
    }
}

pub fn spawn_supervisor(
    bridge: PdpBridge,
    client: Arc<SandboxClient>,
    launcher: Arc<dyn SandboxLauncher>,
    config: SupervisorConfig,
) -> SupervisorHandle {
    let (restart, restart_rx) = mpsc::channel(RESTART_QUEUE);
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(supervise(
        bridge,
        client,
        launcher,
        config,
        restart_rx,
        shutdown_rx,
    ));
    SupervisorHandle {
        restart,
        shutdown,
        task,
    }
}

async fn supervise(
    bridge: PdpBridge,
    client: Arc<SandboxClient>,
    launcher: Arc<dyn SandboxLauncher>,
    config: SupervisorConfig,
    mut restart_rx: mpsc::Receiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut failures = 0usize;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let process = match launcher.launch() {
            Ok(process) => process,
            Err(err) => {
                failures += 1;
                warn!(error = %err, failures, "sandbox launch failed");
                if failures > config.max_restarts {
                    error!(failures, "giving up on the sandbox");
                    break;
                }
                if wait_or_shutdown(config.backoff(failures), &mut shutdown_rx).await {
                    break;
                }
                continue;
            }
        };
        let identifier = process.identifier();
        let (mut child, stdin, stdout) = process.into_parts();
        client.attach(stdin).await;
        info!(sandbox = %identifier, "sandbox worker attached");

        let exit = tokio::select! {
            _ = pump_frames(stdout, &bridge) => Exit::Closed,
            Some(()) = restart_rx.recv() => Exit::Restart,
            _ = shutdown_rx.changed() => Exit::Shutdown,
        };

        let reached_ready = bridge.is_ready();
        client.detach().await;
        stop(&mut child, &identifier).await;
        if exit == Exit::Shutdown {
            break;
        }

        bridge.notify_sandbox_restarted();
        if exit == Exit::Restart || reached_ready {
            failures = 0;
        } else {
            failures += 1;
        }
        warn!(sandbox = %identifier, ?exit, failures, "sandbox worker gone; relaunching");
        if failures > config.max_restarts {
            error!(failures, "sandbox keeps failing before ready; giving up");
            break;
        }
        if failures > 0 && wait_or_shutdown(config.backoff(failures), &mut shutdown_rx).await {
            break;
        }
    }
    bridge.shutdown();
    info!("supervisor stopped");
}

async fn pump_frames(stdout: tokio::io::BufReader<ChildStdout>, bridge: &PdpBridge) {
    let mut lines = stdout.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if !line.trim().is_empty() {
                    bridge.handle_message(&line);
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "sandbox stdout read failed");
                break;
            }
        }
    }
}

async fn stop(child: &mut Child, identifier: &str) {
    if let Err(err) = child.kill().await {
        warn!(sandbox = %identifier, error = %err, "failed to kill sandbox worker");
    }
}

/// Sleeps for `delay`. Returns true when shutdown was requested meanwhile.
async fn wait_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown_rx.borrow(),
        _ = shutdown_rx.changed() => true,
    }
}
