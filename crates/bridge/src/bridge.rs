//! Native-side controller for one sandbox.
//!
//! [`PdpBridge`] is a cheap handle; clones share the same registries. All
//! inbound traffic enters through [`PdpBridge::handle_message`], which must
//! be called from inside a Tokio runtime.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::batch::BatchScheduler;
use crate::callbacks::{self, CallbackHandlers, CallbackRegistry};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::jwt::DECODE_JWT_PAYLOAD;
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::pending::{PendingSnapshot, PendingTable};
use crate::protocol::{
    BatchParams, CallbackRequest, InitParams, JwtToken, Message, Method, RpcRequest, UploadAck,
    UploadChunk, next_request_id,
};
use crate::transport::Transport;
use crate::upload;

/// Arguments of `init`: opaque engine options plus the native handlers the
/// engine may call back into.
#[derive(Clone, Debug, Default)]
pub struct InitOptions {
    pub engine: Value,
    pub handlers: CallbackHandlers,
}

impl InitOptions {
    pub fn new(engine: Value) -> Self {
        Self {
            engine,
            handlers: CallbackHandlers::default(),
        }
    }

    pub fn with_handlers(mut self, handlers: CallbackHandlers) -> Self {
        self.handlers = handlers;
        self
    }
}

#[derive(Debug, Default)]
struct SessionFlags {
    epoch: u64,
    uploaded: bool,
    initialized: bool,
}

struct BridgeInner {
    config: BridgeConfig,
    transport: Arc<dyn Transport>,
    lifecycle: Lifecycle,
    rpc: PendingTable,
    callback_calls: PendingTable,
    callbacks: CallbackRegistry,
    batch: BatchScheduler,
    image: Mutex<Option<Arc<Vec<u8>>>>,
    init_options: Mutex<Option<InitOptions>>,
    flags: Mutex<SessionFlags>,
    setup: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct PdpBridge {
    inner: Arc<BridgeInner>,
}

impl fmt::Debug for PdpBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdpBridge")
            .field("state", &self.state())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

impl PdpBridge {
    pub fn new(config: BridgeConfig, transport: Arc<dyn Transport>) -> Self {
        let batch = BatchScheduler::new(config.batch);
        Self {
            inner: Arc::new(BridgeInner {
                config,
                transport,
                lifecycle: Lifecycle::new(),
                rpc: PendingTable::new("rpc"),
                callback_calls: PendingTable::new("callback"),
                callbacks: CallbackRegistry::new(),
                batch,
                image: Mutex::new(None),
                init_options: Mutex::new(None),
                flags: Mutex::new(SessionFlags::default()),
                setup: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lifecycle.is_ready()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.rpc.len()
    }

    pub fn ready_waiters(&self) -> usize {
        self.inner.lifecycle.waiter_count()
    }

    pub fn queued_batch_requests(&self) -> usize {
        self.inner.batch.len()
    }

    pub fn pending_callback_calls(&self) -> usize {
        self.inner.callback_calls.len()
    }

    pub fn rpc_stats(&self) -> PendingSnapshot {
        self.inner.rpc.stats()
    }

    pub fn registered_callbacks(&self) -> usize {
        self.inner.callbacks.len()
    }

    /// Single entry point for frames arriving from the sandbox.
    pub fn handle_message(&self, frame: &str) {
        let Some(message) = Message::decode(frame) else {
            return;
        };
        match message {
            Message::Ready => {
                if !self.inner.lifecycle.mark_ready() {
                    debug!(state = %self.state(), "ready signal ignored");
                }
            }
            Message::RpcResponse(reply) => {
                let id = reply.id.clone();
                self.inner
                    .rpc
                    .complete(&id, reply.into_result().map_err(BridgeError::from));
            }
            Message::CallbackResponse(reply) => {
                let id = reply.id.clone();
                self.inner
                    .callback_calls
                    .complete(&id, reply.into_result().map_err(BridgeError::from));
            }
            Message::CallbackRequest(request) => {
                tokio::spawn(self.inner.clone().answer_callback(request));
            }
            Message::RpcRequest(request) => {
                debug!(id = %request.id, method = %request.method, "native side serves no rpc methods");
            }
        }
    }

    /// Called by whatever embeds the sandbox when it starts over. Everything
    /// outstanding is rejected with [`BridgeError::Reloaded`] and the next
    /// call re-uploads the image and re-runs `init`.
    pub fn notify_sandbox_restarted(&self) {
        let Some(waiters) = self.inner.lifecycle.begin_reload() else {
            debug!("restart notification after teardown ignored");
            return;
        };
        let rpcs = self.inner.rpc.reject_all(&BridgeError::Reloaded);
        let callbacks = self.inner.callback_calls.reject_all(&BridgeError::Reloaded);
        let queued = self.inner.batch.clear();
        self.inner.reset_flags();
        info!(waiters, rpcs, callbacks, queued, "sandbox restarted; outstanding work rejected");
    }

    /// Permanent disposal. Outstanding work is rejected and later calls fail
    /// with [`BridgeError::SandboxUnavailable`].
    pub fn shutdown(&self) {
        let error = BridgeError::unavailable("bridge torn down");
        let waiters = self.inner.lifecycle.tear_down();
        let rpcs = self.inner.rpc.reject_all(&error);
        let callbacks = self.inner.callback_calls.reject_all(&error);
        let queued = self.inner.batch.clear();
        self.inner.callbacks.clear();
        info!(waiters, rpcs, callbacks, queued, "bridge torn down");
    }

    /// Remembers the engine image; it is uploaded lazily before the first
    /// call of each sandbox lifetime.
    pub fn set_engine_image(&self, image: Vec<u8>) {
        *self.inner.image.lock() = Some(Arc::new(image));
        self.inner.flags.lock().uploaded = false;
    }

    /// Uploads the engine image right away. Unlike every other call this does
    /// not wait for readiness; the sandbox only needs its script loaded.
    pub async fn upload_wasm(&self, image: Vec<u8>) -> Result<(), BridgeError> {
        self.inner.ensure_live()?;
        let image = Arc::new(image);
        *self.inner.image.lock() = Some(image.clone());
        let epoch = self.inner.lifecycle.epoch();
        self.inner.upload_image(&image).await?;
        self.inner.mark(epoch, |flags| flags.uploaded = true);
        Ok(())
    }

    pub async fn init(&self, options: InitOptions) -> Result<Value, BridgeError> {
        self.inner.ensure_live()?;
        self.inner.await_ready(Method::Init.as_str()).await?;
        let _setup = self.inner.setup.lock().await;
        let epoch = self.inner.lifecycle.epoch();
        self.inner.ensure_uploaded(epoch).await?;
        let result = self.inner.send_init(&options, epoch).await?;
        *self.inner.init_options.lock() = Some(options);
        Ok(result)
    }

    pub async fn check_resource(&self, request: Value) -> Result<Value, BridgeError> {
        self.inner.ensure_session(Method::CheckResource).await?;
        self.inner
            .rpc_call(Method::CheckResource, request, self.inner.config.rpc_timeout)
            .await
    }

    /// Batched: the request waits for the next batch window before it is
    /// forwarded, but resolves and times out on its own.
    pub async fn check_resources(&self, request: Value) -> Result<Value, BridgeError> {
        self.inner.ensure_session(Method::CheckResources).await?;
        let label = Method::CheckResources.as_str();
        let id = next_request_id();
        let receiver = self.inner.rpc.register(&id, label)?;
        let _slot = QueueSlot {
            inner: &self.inner,
            id: &id,
        };
        if self.inner.batch.enqueue(&id, request) {
            arm_batch_timer(self.inner.clone());
        }
        self.inner
            .rpc
            .wait(&id, label, receiver, self.inner.config.rpc_timeout)
            .await
    }

    pub async fn plan_resources(&self, request: Value) -> Result<Value, BridgeError> {
        self.inner.ensure_session(Method::PlanResources).await?;
        self.inner
            .rpc_call(Method::PlanResources, request, self.inner.config.rpc_timeout)
            .await
    }

    /// Invokes a function exposed by the sandbox and awaits its result.
    pub async fn call_sandbox(&self, callback_id: &str, payload: Value) -> Result<Value, BridgeError> {
        self.inner.ensure_live()?;
        self.inner.await_ready(callback_id).await?;
        let message = Message::CallbackRequest(CallbackRequest {
            id: next_request_id(),
            callback_id: callback_id.to_owned(),
            payload,
            expects_response: true,
        });
        self.inner
            .callback_calls
            .send(
                self.inner.transport.as_ref(),
                message,
                self.inner.config.callback_timeout,
            )
            .await
    }

    /// Decodes a JWT payload with the sandbox's own decoder.
    pub async fn decode_jwt(&self, token: JwtToken) -> Result<Value, BridgeError> {
        self.call_sandbox(DECODE_JWT_PAYLOAD, serde_json::to_value(token)?)
            .await
    }
}

impl BridgeInner {
    fn ensure_live(&self) -> Result<(), BridgeError> {
        if self.lifecycle.state() == LifecycleState::TornDown {
            return Err(BridgeError::unavailable("bridge torn down"));
        }
        Ok(())
    }

    async fn await_ready(&self, label: &str) -> Result<(), BridgeError> {
        let timeout = self.config.rpc_timeout;
        match tokio::time::timeout(timeout, self.lifecycle.wait_ready()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::Timeout {
                method: format!("{label} (awaiting sandbox ready)"),
                elapsed_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn reset_flags(&self) {
        *self.flags.lock() = SessionFlags {
            epoch: self.lifecycle.epoch(),
            uploaded: false,
            initialized: false,
        };
    }

    /// Applies `update` only if no restart happened since `epoch`.
    fn mark(&self, epoch: u64, update: impl FnOnce(&mut SessionFlags)) {
        let mut flags = self.flags.lock();
        if flags.epoch == epoch {
            update(&mut flags);
        }
    }

    fn needs_setup(&self, epoch: u64) -> bool {
        let has_image = self.image.lock().is_some();
        let has_options = self.init_options.lock().is_some();
        let flags = self.flags.lock();
        flags.epoch != epoch
            || (has_image && !flags.uploaded)
            || (has_options && !flags.initialized)
    }

    async fn ensure_session(&self, method: Method) -> Result<(), BridgeError> {
        self.ensure_live()?;
        self.await_ready(method.as_str()).await?;
        if !self.needs_setup(self.lifecycle.epoch()) {
            return Ok(());
        }
        let _setup = self.setup.lock().await;
        let epoch = self.lifecycle.epoch();
        self.ensure_uploaded(epoch).await?;
        let options = self.init_options.lock().clone();
        let initialized = {
            let flags = self.flags.lock();
            flags.epoch == epoch && flags.initialized
        };
        if let Some(options) = options
            && !initialized
        {
            debug!(epoch, "re-running init for the current sandbox");
            self.send_init(&options, epoch).await?;
        }
        Ok(())
    }

    async fn ensure_uploaded(&self, epoch: u64) -> Result<(), BridgeError> {
        let uploaded = {
            let flags = self.flags.lock();
            flags.epoch == epoch && flags.uploaded
        };
        if uploaded {
            return Ok(());
        }
        let image = self.image.lock().clone();
        let Some(image) = image else {
            return Ok(());
        };
        self.upload_image(&image).await?;
        self.mark(epoch, |flags| flags.uploaded = true);
        Ok(())
    }

    async fn upload_image(&self, image: &[u8]) -> Result<(), BridgeError> {
        let encoded = upload::encode_image(image);
        let chunks = upload::split_chunks(&encoded, self.config.chunk_size);
        let upload_id = uuid::Uuid::new_v4().to_string();
        let total = chunks.len();
        debug!(upload_id = %upload_id, total, bytes = image.len(), "uploading engine image");
        for (index, chunk) in chunks.into_iter().enumerate() {
            let params = serde_json::to_value(UploadChunk {
                upload_id: upload_id.clone(),
                index,
                total,
                chunk: chunk.to_owned(),
            })?;
            let ack: UploadAck = serde_json::from_value(
                self.rpc_call(Method::WasmUpload, params, self.config.upload_timeout)
                    .await?,
            )?;
            let last = index + 1 == total;
            if ack.done != last {
                return Err(BridgeError::protocol(format!(
                    "upload {upload_id} acknowledged chunk {index}/{total} with done={}",
                    ack.done
                )));
            }
        }
        info!(upload_id = %upload_id, total, bytes = image.len(), "engine image uploaded");
        Ok(())
    }

    async fn send_init(&self, options: &InitOptions, epoch: u64) -> Result<Value, BridgeError> {
        let callbacks = self.callbacks.replace(&options.handlers);
        let params = serde_json::to_value(InitParams {
            options: options.engine.clone(),
            callbacks,
        })?;
        let result = self
            .rpc_call(Method::Init, params, self.config.rpc_timeout)
            .await?;
        self.mark(epoch, |flags| flags.initialized = true);
        Ok(result)
    }

    async fn rpc_call(
        &self,
        method: Method,
        params: Value,
        timeout: std::time::Duration,
    ) -> Result<Value, BridgeError> {
        let message = Message::RpcRequest(RpcRequest::new(next_request_id(), method, params));
        self.rpc.send(self.transport.as_ref(), message, timeout).await
    }

    /// Native handlers are synchronous and may block, so they run on the
    /// blocking pool, off the receive path.
    async fn answer_callback(self: Arc<Self>, request: CallbackRequest) {
        let inner = self.clone();
        let reply = match tokio::task::spawn_blocking(move || callbacks::dispatch(&inner.callbacks, request)).await {
            Ok(Some(reply)) => reply,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "callback handler panicked");
                return;
            }
        };
        let frame = match Message::CallbackResponse(reply).encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to encode callback response");
                return;
            }
        };
        if let Err(err) = self.transport.post(frame).await {
            warn!(error = %err, "failed to post callback response");
        }
    }

    async fn flush_batch(self: Arc<Self>) {
        let Some(items) = self.batch.take_batch() else {
            return;
        };
        let ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
        let envelope = serde_json::to_value(BatchParams { batch: items })
            .map_err(BridgeError::from)
            .and_then(|params| {
                Message::RpcRequest(RpcRequest::new(
                    next_request_id(),
                    Method::CheckResources,
                    params,
                ))
                .encode()
            });
        let posted = match envelope {
            Ok(frame) => self.transport.post(frame).await,
            Err(err) => Err(err),
        };
        match posted {
            Ok(()) => debug!(size = ids.len(), "forwarded checkResources batch"),
            Err(err) => {
                warn!(size = ids.len(), error = %err, "failed to forward batch");
                for id in &ids {
                    self.rpc.reject(id, err.clone());
                }
            }
        }
        if self.batch.finish_batch() {
            arm_batch_timer(self.clone());
        }
    }
}

fn arm_batch_timer(inner: Arc<BridgeInner>) {
    let interval = inner.batch.config().interval;
    tokio::spawn(async move {
        tokio::time::sleep(interval).await;
        inner.flush_batch().await;
    });
}

/// Keeps a batched request's queue entry and correlation entry alive until
/// its caller stops waiting.
struct QueueSlot<'a> {
    inner: &'a BridgeInner,
    id: &'a str,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.inner.rpc.forget(self.id);
        if let Some(age) = self.inner.batch.remove(self.id) {
            tracing::trace!(id = self.id, age_ms = age.as_millis() as u64, "batched request settled");
        }
    }
}
