use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PROTOCOL_ERROR: &str = "ProtocolError";
pub const TIMEOUT_ERROR: &str = "Timeout";
pub const SANDBOX_UNAVAILABLE: &str = "SandboxUnavailable";
pub const RELOADED_ERROR: &str = "Reloaded";
pub const CALLBACK_UNAVAILABLE: &str = "CallbackUnavailable";

/// Error shape that survives the sandbox boundary. Only these three
/// strings cross; error identity does not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{name}: {message}")]
pub struct WireError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl WireError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(PROTOCOL_ERROR, message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("{method} timed out after {elapsed_ms}ms")]
    Timeout { method: String, elapsed_ms: u64 },
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),
    #[error("sandbox reloaded before the call completed")]
    Reloaded,
    #[error("engine error: {0}")]
    Upstream(WireError),
    #[error("unknown callbackId {0}")]
    CallbackUnavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BridgeError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::SandboxUnavailable(message.into())
    }

    /// Name used for this error on the wire.
    pub fn name(&self) -> &str {
        match self {
            Self::Protocol(_) | Self::Serialization(_) => PROTOCOL_ERROR,
            Self::Timeout { .. } => TIMEOUT_ERROR,
            Self::SandboxUnavailable(_) => SANDBOX_UNAVAILABLE,
            Self::Reloaded => RELOADED_ERROR,
            Self::Upstream(err) => &err.name,
            Self::CallbackUnavailable(_) => CALLBACK_UNAVAILABLE,
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<WireError> for BridgeError {
    fn from(err: WireError) -> Self {
        match err.name.as_str() {
            PROTOCOL_ERROR => Self::Protocol(err.message),
            TIMEOUT_ERROR => match parse_timeout(&err.message) {
                Some((method, elapsed_ms)) => Self::Timeout { method, elapsed_ms },
                None => Self::Upstream(err),
            },
            SANDBOX_UNAVAILABLE => Self::SandboxUnavailable(err.message),
            RELOADED_ERROR => Self::Reloaded,
            CALLBACK_UNAVAILABLE => Self::CallbackUnavailable(err.message),
            _ => Self::Upstream(err),
        }
    }
}

/// Reads back the `"{method} timed out after {elapsed_ms}ms"` form of
/// [`BridgeError::Timeout`].
fn parse_timeout(message: &str) -> Option<(String, u64)> {
    let (method, elapsed) = message.rsplit_once(" timed out after ")?;
    let elapsed_ms = elapsed.strip_suffix("ms")?.parse().ok()?;
    Some((method.to_owned(), elapsed_ms))
}

impl From<&BridgeError> for WireError {
    fn from(err: &BridgeError) -> Self {
        match err {
            BridgeError::Upstream(inner) => inner.clone(),
            BridgeError::Protocol(message)
            | BridgeError::SandboxUnavailable(message)
            | BridgeError::CallbackUnavailable(message)
            | BridgeError::Serialization(message) => WireError::new(err.name(), message.clone()),
            other => WireError::new(other.name(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_wire_names_map_back_to_variants() {
        let err = BridgeError::from(WireError::protocol("total mismatch"));
        assert_eq!(err, BridgeError::Protocol("total mismatch".to_owned()));

        let err = BridgeError::from(WireError::new(CALLBACK_UNAVAILABLE, "cb-1"));
        assert_eq!(err, BridgeError::CallbackUnavailable("cb-1".to_owned()));

        let err = BridgeError::from(WireError::new(RELOADED_ERROR, "gone"));
        assert_eq!(err, BridgeError::Reloaded);
    }

    #[test]
    fn engine_errors_keep_name_message_and_stack() {
        let wire = WireError::new("TypeError", "resource.kind missing").with_stack("at check (engine.js:1)");
        let err = BridgeError::from(wire.clone());
        assert_eq!(err, BridgeError::Upstream(wire.clone()));
        assert_eq!(WireError::from(&err), wire);
    }

    #[test]
    fn remote_timeouts_keep_method_and_elapsed() {
        let err = BridgeError::Timeout {
            method: "decodeJwtPayload (callback)".to_owned(),
            elapsed_ms: 30_000,
        };
        assert_eq!(BridgeError::from(WireError::from(&err)), err);

        let foreign = WireError::new(TIMEOUT_ERROR, "engine gave up");
        assert_eq!(BridgeError::from(foreign.clone()), BridgeError::Upstream(foreign));
    }

    #[test]
    fn local_errors_round_trip_by_name() {
        let err = BridgeError::unavailable("torn down");
        let wire = WireError::from(&err);
        assert_eq!(wire.name, SANDBOX_UNAVAILABLE);
        assert_eq!(BridgeError::from(wire), err);
    }
}
