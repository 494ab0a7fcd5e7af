use async_trait::async_trait;
use bridge::{BridgeError, Transport};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tracing::debug;

/// A launched sandbox worker with its stdio taken.
pub struct SandboxProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl SandboxProcess {
    pub fn new(mut child: Child) -> Result<Self, String> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| "sandbox worker missing stdin".to_owned())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "sandbox worker missing stdout".to_owned())?;
        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }

    pub fn identifier(&self) -> String {
        match self.child.id() {
            Some(pid) => format!("pid:{pid}"),
            None => "pid:exited".to_owned(),
        }
    }

    pub fn into_parts(self) -> (Child, ChildStdin, BufReader<ChildStdout>) {
        (self.child, self.stdin, BufReader::new(self.stdout))
    }
}

/// Transport over the stdin of whichever worker is currently attached.
/// Frames are newline-delimited JSON.
#[derive(Default)]
pub struct SandboxClient {
    stdin: Mutex<Option<BufWriter<ChildStdin>>>,
}

impl SandboxClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, stdin: ChildStdin) {
        *self.stdin.lock().await = Some(BufWriter::new(stdin));
    }

    pub async fn detach(&self) {
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
    }

    pub async fn is_attached(&self) -> bool {
        self.stdin.lock().await.is_some()
    }
}

#[async_trait]
impl Transport for SandboxClient {
    async fn post(&self, frame: String) -> Result<(), BridgeError> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(BridgeError::unavailable("no sandbox worker attached"));
        };
        let written = async {
            stdin.write_all(frame.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(err) = written {
            debug!(error = %err, "sandbox worker stdin closed; detaching");
            *guard = None;
            return Err(BridgeError::unavailable(format!("sandbox worker write failed: {err}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn post_without_worker_is_unavailable() {
        let client = SandboxClient::new();
        assert!(!client.is_attached().await);
        assert!(matches!(
            client.post("{}".to_owned()).await,
            Err(BridgeError::SandboxUnavailable(_))
        ));
    }
}
