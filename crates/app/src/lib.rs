pub mod client;
pub mod launcher;
pub mod supervisor;

use std::str::FromStr;

use client::SandboxProcess;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxRuntime {
    /// `sandbox_worker` as a plain child process.
    Local,
    /// `sandbox_worker` inside a Docker container on the gVisor runtime.
    Docker,
}

impl FromStr for SandboxRuntime {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "docker" | "runsc" => Ok(Self::Docker),
            other => Err(format!("unknown sandbox runtime {other:?} (expected local or docker)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxWorkerConfig {
    pub static_effect: String,
    pub log_filter: String,
    pub callback_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SandboxLaunchConfig {
    pub runtime: SandboxRuntime,
    pub worker: SandboxWorkerConfig,
}

pub trait SandboxLauncher: Send + Sync {
    fn launch(&self) -> Result<SandboxProcess, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_parses_known_names() {
        assert_eq!("local".parse::<SandboxRuntime>(), Ok(SandboxRuntime::Local));
        assert_eq!(" Docker ".parse::<SandboxRuntime>(), Ok(SandboxRuntime::Docker));
        assert!("podman".parse::<SandboxRuntime>().is_err());
    }
}
