use std::env;
use std::sync::Arc;

use bridge::config::BridgeConfig;
use bridge::engine::{Effect, StaticEngine};
use bridge::logger::{LogConfig, init_logging};
use bridge::sandbox::{SandboxHost, SandboxHostConfig};
use bridge::transport;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{info, warn};

/// Frames arrive on stdin and leave on stdout, one JSON object per line.
/// Logs go to stderr.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging(&LogConfig::from_env())?;

    let effect = match env::var("PDP_STATIC_EFFECT") {
        Ok(value) => value.parse::<Effect>().map_err(anyhow::Error::msg)?,
        Err(_) => Effect::Allow,
    };
    let config = SandboxHostConfig {
        callback_timeout: BridgeConfig::from_env()?.callback_timeout,
    };
    let (outbound, mut outbox) = transport::channel();
    let host = SandboxHost::new(
        Arc::new(StaticEngine::new(effect)),
        Arc::new(outbound),
        config,
    );

    let writer = tokio::spawn(async move {
        let mut stdout = BufWriter::new(tokio::io::stdout());
        while let Some(frame) = outbox.recv().await {
            stdout.write_all(frame.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    });

    host.start().await?;
    info!(%effect, "sandbox worker started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if !line.trim().is_empty() {
                    host.handle_message(&line);
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "stdin read failed");
                break;
            }
        }
    }
    info!("stdin closed; sandbox worker exiting");
    writer.abort();
    Ok(())
}
