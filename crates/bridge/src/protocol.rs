//! Wire messages exchanged with the sandbox.
//!
//! The boundary only carries strings, so every [`Message`] travels as one
//! JSON object tagged by `type`. Frames that are not JSON, or JSON without
//! a recognized `type`, decode to `None`; the channel may be shared with
//! unrelated traffic.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BridgeError, WireError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    Ready,
    RpcRequest(RpcRequest),
    RpcResponse(Reply),
    CallbackRequest(CallbackRequest),
    CallbackResponse(Reply),
}

impl Message {
    pub fn decode(frame: &str) -> Option<Self> {
        match serde_json::from_str(frame) {
            Ok(message) => Some(message),
            Err(err) => {
                tracing::trace!(error = %err, len = frame.len(), "ignoring non-bridge frame");
                None
            }
        }
    }

    pub fn encode(&self) -> Result<String, BridgeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Correlation id carried by the message, if any.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Ready => None,
            Self::RpcRequest(request) => Some(&request.id),
            Self::CallbackRequest(request) => Some(&request.id),
            Self::RpcResponse(reply) | Self::CallbackResponse(reply) => Some(&reply.id),
        }
    }

    /// Short label used in logs and timeout errors.
    pub fn label(&self) -> &str {
        match self {
            Self::Ready => "ready",
            Self::RpcRequest(request) => &request.method,
            Self::CallbackRequest(request) => &request.callback_id,
            Self::RpcResponse(_) => "rpcResponse",
            Self::CallbackResponse(_) => "callbackResponse",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Init,
    CheckResource,
    CheckResources,
    PlanResources,
    WasmUpload,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::CheckResource => "checkResource",
            Self::CheckResources => "checkResources",
            Self::PlanResources => "planResources",
            Self::WasmUpload => "wasmUpload",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = BridgeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "init" => Ok(Self::Init),
            "checkResource" => Ok(Self::CheckResource),
            "checkResources" => Ok(Self::CheckResources),
            "planResources" => Ok(Self::PlanResources),
            "wasmUpload" => Ok(Self::WasmUpload),
            other => Err(BridgeError::protocol(format!("unknown method {other}"))),
        }
    }
}

/// The method stays a plain string on the wire so an unknown verb can be
/// answered with a `ProtocolError` instead of being dropped as noise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: impl Into<String>, method: Method, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.as_str().to_owned(),
            params,
        }
    }

    pub fn method(&self) -> Result<Method, BridgeError> {
        self.method.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRequest {
    pub id: String,
    pub callback_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub expects_response: bool,
}

/// Response body shared by `rpcResponse` and `callbackResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Reply {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: WireError) -> Self {
        Self {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }

    pub fn from_result(id: impl Into<String>, result: Result<Value, WireError>) -> Self {
        match result {
            Ok(value) => Self::success(id, value),
            Err(err) => Self::failure(id, err),
        }
    }

    pub fn into_result(self) -> Result<Value, WireError> {
        if self.ok {
            return Ok(self.result.unwrap_or(Value::Null));
        }
        Err(self
            .error
            .unwrap_or_else(|| WireError::new("Error", "response carried no error detail")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunk {
    pub upload_id: String,
    pub index: usize,
    pub total: usize,
    pub chunk: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAck {
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
}

/// Callback ids minted at `init`, one per configured native handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decode_jwt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_update: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitParams {
    #[serde(default)]
    pub options: Value,
    #[serde(default)]
    pub callbacks: CallbackIds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: String,
    pub request: Value,
}

/// Params of a batched `checkResources`. The sandbox answers every inner
/// id on its own; the envelope id is never answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchParams {
    pub batch: Vec<BatchItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwtToken {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_set_id: Option<String>,
}

/// Millisecond timestamp plus a random suffix. Only uniqueness among
/// outstanding requests matters.
pub fn next_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis());
    format!("{millis}-{:016x}", rand::random::<u64>())
}
