//! The policy engine seen from inside the sandbox.
//!
//! Payloads are opaque JSON. [`StaticEngine`] answers every action with a
//! single configured effect; it exists so the whole path (upload, init,
//! callbacks, batching) can run without a real engine image.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::error::WireError;
use crate::protocol::JwtToken;
use crate::sandbox::NativeHooks;

pub const INVALID_REQUEST: &str = "InvalidRequest";
pub const INVALID_JWT: &str = "InvalidJwt";

#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn init(&self, image: &[u8], options: Value, hooks: &NativeHooks) -> Result<Value, WireError>;
    async fn check_resource(&self, request: Value, hooks: &NativeHooks) -> Result<Value, WireError>;
    async fn check_resources(&self, request: Value, hooks: &NativeHooks) -> Result<Value, WireError>;
    async fn plan_resources(&self, request: Value, hooks: &NativeHooks) -> Result<Value, WireError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "EFFECT_ALLOW",
            Self::Deny => "EFFECT_DENY",
        }
    }

    fn plan_kind(self) -> &'static str {
        match self {
            Self::Allow => "KIND_ALWAYS_ALLOWED",
            Self::Deny => "KIND_ALWAYS_DENIED",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Effect {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "allow" | "effect_allow" => Ok(Self::Allow),
            "deny" | "effect_deny" => Ok(Self::Deny),
            other => Err(format!("unknown effect {other:?} (expected allow or deny)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StaticEngine {
    effect: Effect,
}

impl StaticEngine {
    pub fn new(effect: Effect) -> Self {
        Self { effect }
    }

    pub fn effect(&self) -> Effect {
        self.effect
    }

    fn decide(&self, principal_id: &str, resource: &Value, actions: &[String]) -> Value {
        let effects: Map<String, Value> = actions
            .iter()
            .map(|action| {
                (
                    action.clone(),
                    json!({"effect": self.effect.as_str(), "policy": "static"}),
                )
            })
            .collect();
        json!({
            "resource": {
                "id": resource.get("id").cloned().unwrap_or(Value::Null),
                "kind": resource.get("kind").cloned().unwrap_or(Value::Null),
            },
            "principalId": principal_id,
            "actions": effects,
        })
    }
}

#[async_trait]
impl PolicyEngine for StaticEngine {
    async fn init(&self, image: &[u8], options: Value, hooks: &NativeHooks) -> Result<Value, WireError> {
        if !(options.is_object() || options.is_null()) {
            return Err(WireError::new(INVALID_REQUEST, "engine options must be an object"));
        }
        let policies = options
            .get("policies")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        hooks.policy_updated(json!({
            "source": "init",
            "policies": policies,
            "imageBytes": image.len(),
        }));
        Ok(json!({
            "engine": "static",
            "effect": self.effect.as_str(),
            "policies": policies,
            "imageBytes": image.len(),
        }))
    }

    async fn check_resource(&self, request: Value, hooks: &NativeHooks) -> Result<Value, WireError> {
        let principal_id = principal_id(&request, hooks)?;
        let resource = field(&request, "resource")?;
        let actions = actions(&request, "actions")?;
        let claims = jwt_claims(&request, hooks).await?;
        let result = self.decide(&principal_id, resource, &actions);
        log_decision(hooks, "checkResource", &request, &result, claims);
        Ok(result)
    }

    async fn check_resources(&self, request: Value, hooks: &NativeHooks) -> Result<Value, WireError> {
        let principal_id = principal_id(&request, hooks)?;
        let entries = field(&request, "resources")?
            .as_array()
            .ok_or_else(|| invalid("resources must be an array"))?;
        let claims = jwt_claims(&request, hooks).await?;
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let resource = field(entry, "resource")?;
            let actions = actions(entry, "actions")?;
            results.push(self.decide(&principal_id, resource, &actions));
        }
        let result = json!({
            "requestId": request.get("requestId").cloned().unwrap_or(Value::Null),
            "results": results,
        });
        log_decision(hooks, "checkResources", &request, &result, claims);
        Ok(result)
    }

    async fn plan_resources(&self, request: Value, hooks: &NativeHooks) -> Result<Value, WireError> {
        principal_id(&request, hooks)?;
        let kind = field(&request, "resource")?
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("resource.kind must be a string"))?;
        let action = request
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("action must be a string"))?;
        Ok(json!({
            "resourceKind": kind,
            "action": action,
            "filter": {"kind": self.effect.plan_kind()},
        }))
    }
}

fn invalid(message: impl Into<String>) -> WireError {
    WireError::new(INVALID_REQUEST, message)
}

fn field<'a>(value: &'a Value, name: &str) -> Result<&'a Value, WireError> {
    value
        .get(name)
        .filter(|field| field.is_object() || field.is_array())
        .ok_or_else(|| invalid(format!("{name} is required")))
}

/// Missing principal attributes are reported through the validation hook
/// but do not fail the request.
fn principal_id(request: &Value, hooks: &NativeHooks) -> Result<String, WireError> {
    let principal = field(request, "principal")?;
    let id = principal
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("principal.id must be a string"))?;
    if principal.get("attr").is_none() {
        hooks.validation_errors(vec![json!({
            "path": "/principal/attr",
            "message": "principal has no attributes",
            "source": "SOURCE_PRINCIPAL",
        })]);
    }
    Ok(id.to_owned())
}

fn actions(value: &Value, name: &str) -> Result<Vec<String>, WireError> {
    let actions: Vec<String> = field(value, name)?
        .as_array()
        .map(|actions| {
            actions
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();
    if actions.is_empty() {
        return Err(invalid(format!("{name} must list at least one action")));
    }
    Ok(actions)
}

async fn jwt_claims(request: &Value, hooks: &NativeHooks) -> Result<Option<Value>, WireError> {
    let Some(jwt) = request.pointer("/auxData/jwt") else {
        return Ok(None);
    };
    let token: JwtToken = serde_json::from_value(jwt.clone())
        .map_err(|err| WireError::new(INVALID_JWT, err.to_string()))?;
    hooks
        .decode_jwt(token)
        .await
        .map(Some)
        .map_err(|err| WireError::new(INVALID_JWT, err.to_string()))
}

fn log_decision(hooks: &NativeHooks, kind: &str, request: &Value, result: &Value, claims: Option<Value>) {
    let mut input = request.clone();
    if let Some(aux) = input.get_mut("auxData").and_then(Value::as_object_mut) {
        aux.remove("jwt");
        if let Some(claims) = claims {
            aux.insert("jwt".to_owned(), claims);
        }
    }
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default();
    let mut entry = Map::new();
    entry.insert("callId".to_owned(), json!(Uuid::new_v4().to_string()));
    entry.insert("timestamp".to_owned(), json!(timestamp));
    entry.insert(kind.to_owned(), json!({"input": input, "output": result}));
    hooks.decision_log(Value::Object(entry));
}
