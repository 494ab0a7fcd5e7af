use std::env;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;

use crate::client::SandboxProcess;
use crate::{SandboxLaunchConfig, SandboxLauncher, SandboxRuntime};

pub fn build_launcher(config: SandboxLaunchConfig) -> Arc<dyn SandboxLauncher> {
    match config.runtime {
        SandboxRuntime::Local => Arc::new(LocalProcessLauncher { config }),
        SandboxRuntime::Docker => Arc::new(DockerRunscLauncher { config }),
    }
}

struct LocalProcessLauncher {
    config: SandboxLaunchConfig,
}

impl SandboxLauncher for LocalProcessLauncher {
    fn launch(&self) -> Result<SandboxProcess, String> {
        let worker_bin = resolve_worker_bin()?;
        let mut command = Command::new(worker_bin);
        for (key, value) in worker_env(&self.config) {
            command.env(key, value);
        }
        spawn(command, "sandbox worker")
    }
}

struct DockerRunscLauncher {
    config: SandboxLaunchConfig,
}

impl SandboxLauncher for DockerRunscLauncher {
    fn launch(&self) -> Result<SandboxProcess, String> {
        let worker_bin = resolve_worker_bin()?;
        let worker_mount = format!("{}:/sandbox_worker:ro", worker_bin.display());
        let mut command = Command::new("docker");
        command
            .arg("run")
            .arg("--rm")
            .arg("-i")
            .arg("--runtime=runsc")
            .arg("--network=none")
            .arg("-v")
            .arg(worker_mount);
        for (key, value) in worker_env(&self.config) {
            command.arg("-e").arg(format!("{key}={value}"));
        }
        command.arg("rust:latest").arg("/sandbox_worker");
        spawn(command, "sandbox docker container")
    }
}

fn spawn(mut command: Command, what: &str) -> Result<SandboxProcess, String> {
    let child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| format!("failed to spawn {what}: {err}"))?;
    SandboxProcess::new(child)
}

fn resolve_worker_bin() -> Result<PathBuf, String> {
    let current =
        env::current_exe().map_err(|err| format!("failed to resolve current executable: {err}"))?;
    let mut worker = current
        .parent()
        .ok_or_else(|| "failed to resolve executable directory".to_owned())?
        .to_path_buf();
    worker.push("sandbox_worker");
    if let Some(ext) = current.extension() {
        worker.set_extension(ext);
    }
    if !worker.exists() {
        return Err(format!(
            "sandbox worker binary not found at {}. Build it with `cargo build -p app --bin sandbox_worker`",
            worker.display()
        ));
    }
    Ok(worker)
}

fn worker_env(config: &SandboxLaunchConfig) -> Vec<(&'static str, String)> {
    vec![
        ("PDP_STATIC_EFFECT", config.worker.static_effect.clone()),
        ("PDP_LOG", config.worker.log_filter.clone()),
        (
            "PDP_CALLBACK_TIMEOUT_MS",
            config.worker.callback_timeout_ms.to_string(),
        ),
    ]
}
