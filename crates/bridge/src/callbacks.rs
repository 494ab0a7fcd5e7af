//! Callback dispatch across the boundary.
//!
//! The sandbox never holds native functions. At `init` the native side
//! mints a random id per handler and sends only the ids; a
//! `callbackRequest` names the id and this module routes it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CALLBACK_UNAVAILABLE, WireError};
use crate::protocol::{CallbackIds, CallbackRequest, JwtToken, Reply};

pub type Observer<T> = Arc<dyn Fn(T) -> anyhow::Result<()> + Send + Sync>;
pub type JwtDecoder = Arc<dyn Fn(JwtToken) -> anyhow::Result<Value> + Send + Sync>;
pub type CallbackFn = Arc<dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync>;

const CALLBACK_ERROR: &str = "CallbackError";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackRole {
    DecisionLog,
    ValidationError,
    DecodeJwt,
    PolicyUpdate,
}

impl CallbackRole {
    pub const ALL: [CallbackRole; 4] = [
        CallbackRole::DecisionLog,
        CallbackRole::ValidationError,
        CallbackRole::DecodeJwt,
        CallbackRole::PolicyUpdate,
    ];

    fn slot(self) -> usize {
        match self {
            Self::DecisionLog => 0,
            Self::ValidationError => 1,
            Self::DecodeJwt => 2,
            Self::PolicyUpdate => 3,
        }
    }
}

/// A native handler together with the payload type its role expects.
#[derive(Clone)]
pub enum NativeCallback {
    DecisionLog(Observer<Value>),
    ValidationError(Observer<Vec<Value>>),
    DecodeJwt(JwtDecoder),
    PolicyUpdate(Observer<Value>),
}

impl NativeCallback {
    pub fn role(&self) -> CallbackRole {
        match self {
            Self::DecisionLog(_) => CallbackRole::DecisionLog,
            Self::ValidationError(_) => CallbackRole::ValidationError,
            Self::DecodeJwt(_) => CallbackRole::DecodeJwt,
            Self::PolicyUpdate(_) => CallbackRole::PolicyUpdate,
        }
    }

    pub fn invoke(&self, payload: Value) -> anyhow::Result<Value> {
        match self {
            Self::DecisionLog(observer) | Self::PolicyUpdate(observer) => {
                observer(payload)?;
                Ok(Value::Null)
            }
            Self::ValidationError(observer) => {
                let errors = match payload {
                    Value::Array(errors) => errors,
                    Value::Null => Vec::new(),
                    single => vec![single],
                };
                observer(errors)?;
                Ok(Value::Null)
            }
            Self::DecodeJwt(decoder) => {
                let token: JwtToken = serde_json::from_value(payload)?;
                decoder(token)
            }
        }
    }
}

impl fmt::Debug for NativeCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeCallback::{:?}", self.role())
    }
}

/// Optional handlers supplied to `init`.
#[derive(Clone, Default)]
pub struct CallbackHandlers {
    pub decision_log: Option<Observer<Value>>,
    pub validation_error: Option<Observer<Vec<Value>>>,
    pub decode_jwt: Option<JwtDecoder>,
    pub policy_update: Option<Observer<Value>>,
}

impl CallbackHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_decision(mut self, handler: impl Fn(Value) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.decision_log = Some(Arc::new(handler));
        self
    }

    pub fn on_validation_error(
        mut self,
        handler: impl Fn(Vec<Value>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.validation_error = Some(Arc::new(handler));
        self
    }

    pub fn decode_jwt(mut self, handler: impl Fn(JwtToken) -> anyhow::Result<Value> + Send + Sync + 'static) -> Self {
        self.decode_jwt = Some(Arc::new(handler));
        self
    }

    pub fn on_policy_update(mut self, handler: impl Fn(Value) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.policy_update = Some(Arc::new(handler));
        self
    }

    fn callbacks(&self) -> Vec<NativeCallback> {
        let mut callbacks = Vec::with_capacity(4);
        if let Some(handler) = &self.decision_log {
            callbacks.push(NativeCallback::DecisionLog(handler.clone()));
        }
        if let Some(handler) = &self.validation_error {
            callbacks.push(NativeCallback::ValidationError(handler.clone()));
        }
        if let Some(handler) = &self.decode_jwt {
            callbacks.push(NativeCallback::DecodeJwt(handler.clone()));
        }
        if let Some(handler) = &self.policy_update {
            callbacks.push(NativeCallback::PolicyUpdate(handler.clone()));
        }
        callbacks
    }
}

impl fmt::Debug for CallbackHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandlers")
            .field("decision_log", &self.decision_log.is_some())
            .field("validation_error", &self.validation_error.is_some())
            .field("decode_jwt", &self.decode_jwt.is_some())
            .field("policy_update", &self.policy_update.is_some())
            .finish()
    }
}

/// Anything that can answer a `callbackRequest` by id.
pub trait CallbackTarget: Send + Sync {
    /// `None` when no handler is registered under `callback_id`.
    fn invoke(&self, callback_id: &str, payload: Value) -> Option<anyhow::Result<Value>>;
}

#[derive(Debug, Clone)]
struct Registration {
    id: String,
    callback: NativeCallback,
}

/// Native handlers, one fixed slot per role.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    slots: RwLock<[Option<Registration>; 4]>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every registration and mints fresh ids for `handlers`.
    pub fn replace(&self, handlers: &CallbackHandlers) -> CallbackIds {
        let mut slots: [Option<Registration>; 4] = Default::default();
        let mut ids = CallbackIds::default();
        for callback in handlers.callbacks() {
            let id = format!("cb-{}", Uuid::new_v4().simple());
            let slot = callback.role().slot();
            match callback.role() {
                CallbackRole::DecisionLog => ids.decision_log = Some(id.clone()),
                CallbackRole::ValidationError => ids.validation_error = Some(id.clone()),
                CallbackRole::DecodeJwt => ids.decode_jwt = Some(id.clone()),
                CallbackRole::PolicyUpdate => ids.policy_update = Some(id.clone()),
            }
            slots[slot] = Some(Registration { id, callback });
        }
        *self.slots.write() = slots;
        tracing::debug!(?ids, "callback registrations replaced");
        ids
    }

    pub fn lookup(&self, callback_id: &str) -> Option<NativeCallback> {
        self.slots
            .read()
            .iter()
            .flatten()
            .find(|registration| registration.id == callback_id)
            .map(|registration| registration.callback.clone())
    }

    pub fn id_for(&self, role: CallbackRole) -> Option<String> {
        self.slots.read()[role.slot()]
            .as_ref()
            .map(|registration| registration.id.clone())
    }

    pub fn len(&self) -> usize {
        self.slots.read().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        *self.slots.write() = Default::default();
    }
}

impl CallbackTarget for CallbackRegistry {
    fn invoke(&self, callback_id: &str, payload: Value) -> Option<anyhow::Result<Value>> {
        let callback = self.lookup(callback_id)?;
        Some(callback.invoke(payload))
    }
}

/// Functions the sandbox exposes to native callers, keyed by name.
#[derive(Default)]
pub struct FunctionTable {
    functions: RwLock<HashMap<String, CallbackFn>>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, function: impl Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static) {
        self.functions.write().insert(name.into(), Arc::new(function));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }
}

impl CallbackTarget for FunctionTable {
    fn invoke(&self, callback_id: &str, payload: Value) -> Option<anyhow::Result<Value>> {
        let function = self.functions.read().get(callback_id).cloned()?;
        Some(function(payload))
    }
}

/// Routes one callback request. Unknown ids are always answered so the
/// caller's awaiter never hangs; known ids are answered only when the
/// caller asked for a response.
pub fn dispatch(target: &dyn CallbackTarget, request: CallbackRequest) -> Option<Reply> {
    let CallbackRequest {
        id,
        callback_id,
        payload,
        expects_response,
    } = request;
    let Some(outcome) = target.invoke(&callback_id, payload) else {
        tracing::warn!(id = %id, callback_id = %callback_id, "callback request for unknown callbackId");
        return Some(Reply::failure(
            id,
            WireError::new(CALLBACK_UNAVAILABLE, format!("unknown callbackId {callback_id}")),
        ));
    };
    match (outcome, expects_response) {
        (Ok(result), true) => Some(Reply::success(id, result)),
        (Err(err), true) => Some(Reply::failure(id, WireError::new(CALLBACK_ERROR, format!("{err:#}")))),
        (Ok(_), false) => None,
        (Err(err), false) => {
            tracing::debug!(id = %id, callback_id = %callback_id, error = %err, "notification callback failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    fn request(callback_id: &str, payload: Value, expects_response: bool) -> CallbackRequest {
        CallbackRequest {
            id: "req-1".to_owned(),
            callback_id: callback_id.to_owned(),
            payload,
            expects_response,
        }
    }

    #[test]
    fn replace_mints_fresh_ids_per_role() {
        let registry = CallbackRegistry::new();
        let handlers = CallbackHandlers::new()
            .on_decision(|_| Ok(()))
            .decode_jwt(|_| Ok(json!({})));
        let first = registry.replace(&handlers);
        assert!(first.decision_log.is_some());
        assert!(first.decode_jwt.is_some());
        assert!(first.validation_error.is_none());
        assert_eq!(registry.len(), 2);

        let second = registry.replace(&CallbackHandlers::new().on_policy_update(|_| Ok(())));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(first.decision_log.as_deref().unwrap()).is_none());
        assert_eq!(
            registry.id_for(CallbackRole::PolicyUpdate),
            second.policy_update
        );
    }

    #[test]
    fn unknown_id_is_answered_even_without_expected_response() {
        let registry = CallbackRegistry::new();
        let reply = dispatch(&registry, request("nope", Value::Null, false)).unwrap();
        assert!(!reply.ok);
        assert_eq!(reply.error.unwrap().name, CALLBACK_UNAVAILABLE);
    }

    #[test]
    fn notification_callbacks_are_fire_and_forget() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = CallbackRegistry::new();
        let sink = seen.clone();
        let ids = registry.replace(&CallbackHandlers::new().on_decision(move |entry| {
            sink.lock().unwrap().push(entry);
            Ok(())
        }));
        let id = ids.decision_log.unwrap();
        assert!(dispatch(&registry, request(&id, json!({"callId": "c1"}), false)).is_none());
        assert_eq!(*seen.lock().unwrap(), vec![json!({"callId": "c1"})]);

        let failing = CallbackRegistry::new();
        let ids = failing.replace(&CallbackHandlers::new().on_decision(|_| anyhow::bail!("disk full")));
        assert!(dispatch(&failing, request(&ids.decision_log.unwrap(), Value::Null, false)).is_none());
    }

    #[test]
    fn expected_responses_carry_result_or_error() {
        let registry = CallbackRegistry::new();
        let ids = registry.replace(&CallbackHandlers::new().decode_jwt(|token| {
            if token.token.is_empty() {
                anyhow::bail!("empty token");
            }
            Ok(json!({"sub": token.token}))
        }));
        let id = ids.decode_jwt.unwrap();

        let reply = dispatch(&registry, request(&id, json!({"token": "alice"}), true)).unwrap();
        assert_eq!(reply.into_result().unwrap(), json!({"sub": "alice"}));

        let reply = dispatch(&registry, request(&id, json!({"token": ""}), true)).unwrap();
        let err = reply.into_result().unwrap_err();
        assert_eq!(err.name, CALLBACK_ERROR);
        assert!(err.message.contains("empty token"));

        let reply = dispatch(&registry, request(&id, json!(42), true)).unwrap();
        assert!(!reply.ok);
    }

    #[test]
    fn validation_errors_arrive_as_a_list() {
        let count = Arc::new(Mutex::new(0));
        let registry = CallbackRegistry::new();
        let counter = count.clone();
        let ids = registry.replace(&CallbackHandlers::new().on_validation_error(move |errors| {
            *counter.lock().unwrap() += errors.len();
            Ok(())
        }));
        let id = ids.validation_error.unwrap();
        dispatch(&registry, request(&id, json!([{"path": "/a"}, {"path": "/b"}]), false));
        dispatch(&registry, request(&id, json!({"path": "/c"}), false));
        assert_eq!(*count.lock().unwrap(), 3);
    }

    #[test]
    fn function_table_serves_named_functions() {
        let table = FunctionTable::new();
        table.register("double", |value| Ok(json!(value.as_i64().unwrap_or(0) * 2)));
        let reply = dispatch(&table, request("double", json!(21), true)).unwrap();
        assert_eq!(reply.into_result().unwrap(), json!(42));
        assert!(!dispatch(&table, request("triple", json!(1), true)).unwrap().ok);
    }
}
