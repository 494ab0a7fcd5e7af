//! A bridge and a sandbox host wired together in one process over channels.
//! Used by the demo binary and the integration tests.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::info;

use crate::bridge::PdpBridge;
use crate::config::BridgeConfig;
use crate::engine::PolicyEngine;
use crate::error::BridgeError;
use crate::sandbox::{SandboxHost, SandboxHostConfig};
use crate::transport::{self, ChannelTransport};

pub struct Loopback {
    bridge: PdpBridge,
    host: Arc<RwLock<SandboxHost>>,
    engine: Arc<dyn PolicyEngine>,
    host_transport: ChannelTransport,
    host_config: SandboxHostConfig,
    pumps: Vec<JoinHandle<()>>,
}

impl Loopback {
    /// Wires both sides without announcing readiness.
    pub fn new(config: BridgeConfig, engine: Arc<dyn PolicyEngine>) -> Self {
        let host_config = SandboxHostConfig {
            callback_timeout: config.callback_timeout,
        };
        let (to_sandbox, sandbox_inbox) = transport::channel();
        let (to_native, native_inbox) = transport::channel();
        let bridge = PdpBridge::new(config, Arc::new(to_sandbox));
        let host = Arc::new(RwLock::new(SandboxHost::new(
            engine.clone(),
            Arc::new(to_native.clone()),
            host_config,
        )));

        let pumps = vec![
            tokio::spawn(pump_to_host(sandbox_inbox, host.clone())),
            tokio::spawn(pump_to_bridge(native_inbox, bridge.clone())),
        ];
        Self {
            bridge,
            host,
            engine,
            host_transport: to_native,
            host_config,
            pumps,
        }
    }

    pub async fn start(config: BridgeConfig, engine: Arc<dyn PolicyEngine>) -> Result<Self, BridgeError> {
        let loopback = Self::new(config, engine);
        loopback.announce().await?;
        Ok(loopback)
    }

    /// Has the current host post its `Ready` signal.
    pub async fn announce(&self) -> Result<(), BridgeError> {
        let host = self.host();
        host.start().await
    }

    pub fn bridge(&self) -> &PdpBridge {
        &self.bridge
    }

    pub fn host(&self) -> SandboxHost {
        self.host.read().clone()
    }

    /// Replaces the sandbox with a fresh one, as a crashed and relaunched
    /// process would be.
    pub async fn restart(&self) -> Result<(), BridgeError> {
        let fresh = SandboxHost::new(
            self.engine.clone(),
            Arc::new(self.host_transport.clone()),
            self.host_config,
        );
        *self.host.write() = fresh;
        self.bridge.notify_sandbox_restarted();
        info!("loopback sandbox replaced");
        self.announce().await
    }

    pub fn shutdown(&self) {
        self.bridge.shutdown();
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

async fn pump_to_host(mut inbox: UnboundedReceiver<String>, host: Arc<RwLock<SandboxHost>>) {
    while let Some(frame) = inbox.recv().await {
        let host = host.read().clone();
        host.handle_message(&frame);
    }
}

async fn pump_to_bridge(mut inbox: UnboundedReceiver<String>, bridge: PdpBridge) {
    while let Some(frame) = inbox.recv().await {
        bridge.handle_message(&frame);
    }
}
