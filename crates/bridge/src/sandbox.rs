//! The sandbox side of the protocol: reassembles the engine image, runs
//! `init`, serves the check verbs against a [`PolicyEngine`] and calls back
//! into native handlers by id.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::callbacks::{self, FunctionTable};
use crate::config::DEFAULT_CALLBACK_TIMEOUT;
use crate::engine::PolicyEngine;
use crate::error::{BridgeError, WireError};
use crate::jwt::{self, DECODE_JWT_PAYLOAD};
use crate::pending::PendingTable;
use crate::protocol::{
    BatchParams, CallbackIds, CallbackRequest, InitParams, JwtToken, Message, Method, Reply,
    RpcRequest, UploadChunk, next_request_id,
};
use crate::transport::Transport;
use crate::upload::{self, UploadAssembler, UploadProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxHostConfig {
    pub callback_timeout: Duration,
}

impl Default for SandboxHostConfig {
    fn default() -> Self {
        Self {
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
        }
    }
}

/// Handles the engine uses to reach native handlers registered at `init`.
#[derive(Clone)]
pub struct NativeHooks {
    ids: CallbackIds,
    transport: Arc<dyn Transport>,
    calls: Arc<PendingTable>,
    timeout: Duration,
}

impl NativeHooks {
    fn new(ids: CallbackIds, transport: Arc<dyn Transport>, calls: Arc<PendingTable>, timeout: Duration) -> Self {
        Self {
            ids,
            transport,
            calls,
            timeout,
        }
    }

    /// Hooks with their own reply table, for driving an engine outside a
    /// [`SandboxHost`].
    pub fn detached(ids: CallbackIds, transport: Arc<dyn Transport>) -> Self {
        Self::new(
            ids,
            transport,
            Arc::new(PendingTable::new("native")),
            DEFAULT_CALLBACK_TIMEOUT,
        )
    }

    pub fn ids(&self) -> &CallbackIds {
        &self.ids
    }

    pub fn decision_log(&self, entry: Value) {
        self.notify(self.ids.decision_log.as_deref(), entry);
    }

    pub fn validation_errors(&self, errors: Vec<Value>) {
        self.notify(self.ids.validation_error.as_deref(), Value::Array(errors));
    }

    pub fn policy_updated(&self, update: Value) {
        self.notify(self.ids.policy_update.as_deref(), update);
    }

    /// Asks the native decoder when one was registered; otherwise the
    /// payload is decoded locally without verification.
    pub async fn decode_jwt(&self, token: JwtToken) -> Result<Value, BridgeError> {
        let Some(callback_id) = self.ids.decode_jwt.as_deref() else {
            return jwt::decode_payload(&token.token).map_err(|err| BridgeError::protocol(err.to_string()));
        };
        let message = Message::CallbackRequest(CallbackRequest {
            id: next_request_id(),
            callback_id: callback_id.to_owned(),
            payload: serde_json::to_value(token)?,
            expects_response: true,
        });
        self.calls
            .send(self.transport.as_ref(), message, self.timeout)
            .await
    }

    fn notify(&self, callback_id: Option<&str>, payload: Value) {
        let Some(callback_id) = callback_id else {
            return;
        };
        let message = Message::CallbackRequest(CallbackRequest {
            id: next_request_id(),
            callback_id: callback_id.to_owned(),
            payload,
            expects_response: false,
        });
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to encode notification");
                return;
            }
        };
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(err) = transport.post(frame).await {
                debug!(error = %err, "notification dropped");
            }
        });
    }
}

struct HostInner {
    engine: Arc<dyn PolicyEngine>,
    transport: Arc<dyn Transport>,
    config: SandboxHostConfig,
    uploads: Mutex<UploadAssembler>,
    image: RwLock<Option<Arc<Vec<u8>>>>,
    session: RwLock<Option<NativeHooks>>,
    native_calls: Arc<PendingTable>,
    functions: FunctionTable,
}

#[derive(Clone)]
pub struct SandboxHost {
    inner: Arc<HostInner>,
}

impl SandboxHost {
    pub fn new(engine: Arc<dyn PolicyEngine>, transport: Arc<dyn Transport>, config: SandboxHostConfig) -> Self {
        let functions = FunctionTable::new();
        functions.register(DECODE_JWT_PAYLOAD, |payload| {
            let token: JwtToken = serde_json::from_value(payload)?;
            Ok(jwt::decode_payload(&token.token)?)
        });
        Self {
            inner: Arc::new(HostInner {
                engine,
                transport,
                config,
                uploads: Mutex::new(UploadAssembler::new()),
                image: RwLock::new(None),
                session: RwLock::new(None),
                native_calls: Arc::new(PendingTable::new("native")),
                functions,
            }),
        }
    }

    /// Extra functions native code may call by name.
    pub fn functions(&self) -> &FunctionTable {
        &self.inner.functions
    }

    pub fn has_image(&self) -> bool {
        self.inner.image.read().is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.session.read().is_some()
    }

    /// Announces readiness to the native side.
    pub async fn start(&self) -> Result<(), BridgeError> {
        self.inner.transport.post(Message::Ready.encode()?).await?;
        info!("sandbox host ready");
        Ok(())
    }

    /// Entry point for frames from the native side. Requests are served on
    /// spawned tasks so slow engine calls never block the reader.
    pub fn handle_message(&self, frame: &str) {
        let Some(message) = Message::decode(frame) else {
            return;
        };
        match message {
            Message::RpcRequest(request) => {
                tokio::spawn(self.inner.clone().serve(request));
            }
            Message::CallbackResponse(reply) => {
                let id = reply.id.clone();
                self.inner
                    .native_calls
                    .complete(&id, reply.into_result().map_err(BridgeError::from));
            }
            Message::CallbackRequest(request) => {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    let functions = inner.clone();
                    match tokio::task::spawn_blocking(move || callbacks::dispatch(&functions.functions, request)).await {
                        Ok(Some(reply)) => inner.post(Message::CallbackResponse(reply)).await,
                        Ok(None) => {}
                        Err(err) => warn!(error = %err, "sandbox function panicked"),
                    }
                });
            }
            Message::Ready => debug!("ignoring ready signal on the sandbox side"),
            Message::RpcResponse(reply) => {
                debug!(id = %reply.id, "ignoring rpc response on the sandbox side");
            }
        }
    }
}

impl HostInner {
    async fn serve(self: Arc<Self>, request: RpcRequest) {
        let RpcRequest { id, method, params } = request;
        let method = match method.parse::<Method>() {
            Ok(method) => method,
            Err(err) => {
                self.post(Message::RpcResponse(Reply::failure(id, WireError::from(&err))))
                    .await;
                return;
            }
        };
        if method == Method::CheckResources && params.get("batch").is_some() {
            self.serve_batch(id, params).await;
            return;
        }
        let outcome = self.call(method, params).await;
        self.post(Message::RpcResponse(Reply::from_result(id, outcome)))
            .await;
    }

    /// Each inner request is answered under its own id; the envelope id
    /// is answered only when the envelope itself is malformed.
    async fn serve_batch(self: Arc<Self>, id: String, params: Value) {
        let batch = match serde_json::from_value::<BatchParams>(params) {
            Ok(params) => params.batch,
            Err(err) => {
                let error = WireError::protocol(format!("malformed batch: {err}"));
                self.post(Message::RpcResponse(Reply::failure(id, error))).await;
                return;
            }
        };
        debug!(envelope = %id, size = batch.len(), "serving checkResources batch");
        for item in batch {
            let host = self.clone();
            tokio::spawn(async move {
                let outcome = host.call(Method::CheckResources, item.request).await;
                host.post(Message::RpcResponse(Reply::from_result(item.id, outcome)))
                    .await;
            });
        }
    }

    async fn call(&self, method: Method, params: Value) -> Result<Value, WireError> {
        match method {
            Method::WasmUpload => self.receive_chunk(params),
            Method::Init => self.init(params).await,
            Method::CheckResource => {
                let hooks = self.hooks()?;
                self.engine.check_resource(params, &hooks).await
            }
            Method::CheckResources => {
                let hooks = self.hooks()?;
                self.engine.check_resources(params, &hooks).await
            }
            Method::PlanResources => {
                let hooks = self.hooks()?;
                self.engine.plan_resources(params, &hooks).await
            }
        }
    }

    fn receive_chunk(&self, params: Value) -> Result<Value, WireError> {
        let chunk: UploadChunk =
            serde_json::from_value(params).map_err(|err| WireError::protocol(err.to_string()))?;
        let progress = self
            .uploads
            .lock()
            .accept(chunk)
            .map_err(|err| WireError::from(&err))?;
        if let UploadProgress::Complete(encoded) = &progress {
            let image = upload::decode_image(encoded).map_err(|err| WireError::from(&err))?;
            info!(bytes = image.len(), "engine image assembled");
            *self.image.write() = Some(Arc::new(image));
        }
        Ok(progress.ack_value())
    }

    async fn init(&self, params: Value) -> Result<Value, WireError> {
        let image = self
            .image
            .read()
            .clone()
            .ok_or_else(|| WireError::protocol("engine image not uploaded"))?;
        let params: InitParams =
            serde_json::from_value(params).map_err(|err| WireError::protocol(err.to_string()))?;
        let hooks = NativeHooks::new(
            params.callbacks,
            self.transport.clone(),
            self.native_calls.clone(),
            self.config.callback_timeout,
        );
        let result = self.engine.init(&image, params.options, &hooks).await?;
        *self.session.write() = Some(hooks);
        info!("engine initialized");
        Ok(result)
    }

    fn hooks(&self) -> Result<NativeHooks, WireError> {
        self.session
            .read()
            .clone()
            .ok_or_else(|| WireError::protocol("engine not initialized"))
    }

    async fn post(self: Arc<Self>, message: Message) {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to encode reply");
                return;
            }
        };
        if let Err(err) = self.transport.post(frame).await {
            warn!(error = %err, "failed to post reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::engine::{Effect, StaticEngine};
    use crate::error::PROTOCOL_ERROR;
    use crate::transport;

    fn host() -> (SandboxHost, UnboundedReceiver<String>) {
        let (transport, outbox) = transport::channel();
        let host = SandboxHost::new(
            Arc::new(StaticEngine::new(Effect::Allow)),
            Arc::new(transport),
            SandboxHostConfig::default(),
        );
        (host, outbox)
    }

    fn rpc(id: &str, method: Method, params: Value) -> String {
        Message::RpcRequest(RpcRequest::new(id, method, params))
            .encode()
            .unwrap()
    }

    async fn reply(outbox: &mut UnboundedReceiver<String>) -> Reply {
        loop {
            let frame = outbox.recv().await.unwrap();
            if let Some(Message::RpcResponse(reply)) = Message::decode(&frame) {
                return reply;
            }
        }
    }

    fn chunk(index: usize, total: usize, chunk: &str) -> Value {
        json!({"uploadId": "u1", "index": index, "total": total, "chunk": chunk})
    }

    #[tokio::test]
    async fn start_announces_ready() {
        let (host, mut outbox) = host();
        host.start().await.unwrap();
        assert_eq!(Message::decode(&outbox.recv().await.unwrap()), Some(Message::Ready));
    }

    #[tokio::test]
    async fn checks_before_init_are_protocol_errors() {
        let (host, mut outbox) = host();
        host.handle_message(&rpc("c1", Method::CheckResource, json!({})));
        let first = reply(&mut outbox).await;
        assert_eq!(first.id, "c1");
        assert_eq!(first.error.unwrap().name, PROTOCOL_ERROR);

        host.handle_message(&rpc("i1", Method::Init, json!({"options": {}, "callbacks": {}})));
        let second = reply(&mut outbox).await;
        assert!(second.error.unwrap().message.contains("not uploaded"));
    }

    #[tokio::test]
    async fn upload_then_init_then_check() {
        let (host, mut outbox) = host();
        let encoded = upload::encode_image(b"wasm-bytes");
        let (head, tail) = encoded.split_at(4);

        host.handle_message(&rpc("u-1", Method::WasmUpload, chunk(1, 2, tail)));
        let ack = reply(&mut outbox).await.into_result().unwrap();
        assert_eq!(ack, json!({"done": false, "received": 1, "total": 2}));
        host.handle_message(&rpc("u-0", Method::WasmUpload, chunk(0, 2, head)));
        let ack = reply(&mut outbox).await.into_result().unwrap();
        assert_eq!(ack, json!({"done": true}));
        assert!(host.has_image());

        host.handle_message(&rpc("i", Method::Init, json!({"options": {"policies": [1, 2]}, "callbacks": {}})));
        let init = reply(&mut outbox).await.into_result().unwrap();
        assert_eq!(init["imageBytes"], 10);
        assert_eq!(init["policies"], 2);
        assert!(host.is_initialized());

        let request = json!({
            "principal": {"id": "alice", "attr": {}},
            "resource": {"kind": "doc", "id": "d1"},
            "actions": ["view"],
        });
        host.handle_message(&rpc("c", Method::CheckResource, request));
        let result = reply(&mut outbox).await.into_result().unwrap();
        assert_eq!(result["actions"]["view"]["effect"], "EFFECT_ALLOW");
    }

    #[tokio::test]
    async fn oversized_upload_total_is_answered_without_allocating() {
        let (host, mut outbox) = host();
        host.handle_message(&format!(
            r#"{{"type":"rpcRequest","id":"big","method":"wasmUpload","params":{{"uploadId":"u9","index":0,"total":{},"chunk":"AAAA"}}}}"#,
            u64::MAX
        ));
        let ack = reply(&mut outbox).await;
        assert_eq!(ack.id, "big");
        let ack = ack.into_result().unwrap();
        assert_eq!(ack["done"], false);
        assert_eq!(ack["received"], 1);

        host.handle_message(&format!(
            r#"{{"type":"rpcRequest","id":"bad","method":"wasmUpload","params":{{"uploadId":"u9","index":{},"total":3,"chunk":"AAAA"}}}}"#,
            u64::MAX
        ));
        let rejected = reply(&mut outbox).await;
        assert_eq!(rejected.id, "bad");
        assert_eq!(rejected.error.unwrap().name, PROTOCOL_ERROR);
    }

    #[tokio::test]
    async fn unanswered_native_jwt_decode_times_out() {
        let (transport, mut outbox) = transport::channel();
        let calls = Arc::new(PendingTable::new("native"));
        let ids = CallbackIds {
            decode_jwt: Some("cb-jwt".to_owned()),
            ..CallbackIds::default()
        };
        let hooks = NativeHooks::new(ids, Arc::new(transport), calls.clone(), Duration::from_millis(40));
        let outcome = hooks
            .decode_jwt(JwtToken {
                token: "a.b.c".to_owned(),
                key_set_id: None,
            })
            .await;
        assert!(matches!(outcome, Err(BridgeError::Timeout { .. })));
        assert!(calls.is_empty());
        let Some(Message::CallbackRequest(request)) = Message::decode(&outbox.recv().await.unwrap()) else {
            panic!("expected callback request");
        };
        assert_eq!(request.callback_id, "cb-jwt");
        assert!(request.expects_response);
    }

    #[tokio::test]
    async fn unknown_method_is_answered() {
        let (host, mut outbox) = host();
        host.handle_message(r#"{"type":"rpcRequest","id":"x","method":"explode","params":null}"#);
        let reply = reply(&mut outbox).await;
        assert_eq!(reply.id, "x");
        assert_eq!(reply.error.unwrap().name, PROTOCOL_ERROR);
    }

    #[tokio::test]
    async fn builtin_jwt_decoder_is_callable() {
        use base64::Engine as _;
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;

        let (host, mut outbox) = host();
        let token = format!("h.{}.s", URL_SAFE_NO_PAD.encode(r#"{"sub":"carol"}"#));
        let frame = Message::CallbackRequest(CallbackRequest {
            id: "j1".to_owned(),
            callback_id: DECODE_JWT_PAYLOAD.to_owned(),
            payload: json!({"token": token}),
            expects_response: true,
        })
        .encode()
        .unwrap();
        host.handle_message(&frame);
        let Some(Message::CallbackResponse(reply)) = Message::decode(&outbox.recv().await.unwrap()) else {
            panic!("expected callback response");
        };
        assert_eq!(reply.into_result().unwrap(), json!({"sub": "carol"}));
    }
}
