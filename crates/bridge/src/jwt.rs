//! JWT payload decoding without signature verification. Verification is
//! the engine's concern; this only exposes the claims.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;
use thiserror::Error;

pub const DECODE_JWT_PAYLOAD: &str = "decodeJwtPayload";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JwtError {
    #[error("token must have three dot-separated segments, found {0}")]
    Segments(usize),
    #[error("payload segment is not base64url: {0}")]
    Encoding(String),
    #[error("payload is not a JSON object")]
    NotAnObject,
}

pub fn decode_payload(token: &str) -> Result<Value, JwtError> {
    let segments: Vec<&str> = token.trim().split('.').collect();
    if segments.len() != 3 {
        return Err(JwtError::Segments(segments.len()));
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(segments[1].trim_end_matches('='))
        .map_err(|err| JwtError::Encoding(err.to_string()))?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(claims @ Value::Object(_)) => Ok(claims),
        _ => Err(JwtError::NotAnObject),
    }
}
