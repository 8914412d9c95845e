//! JSON-RPC marshalling over a [`Session`]
//!
//! Only the envelope lives here: building a call, sending it through the
//! session, and turning the reply into a value or a structured
//! [`Failure`]. Individual remote methods are the caller's business.

pub mod session;
pub mod task;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::RpcError;
use crate::failure::Failure;
use crate::session::Session;

pub use session::RpcSession;
pub use task::{unwrap_result, JsonRpcTaskApi, TaskApi, TaskRecord, TaskStatus};

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    message: String,
    #[serde(default)]
    data: Vec<Value>,
}

/// Issue one call through the session and return its `result`
pub fn call(session: &dyn Session, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
    let payload = encode_request(method, params);
    let body = session.send_raw(&payload)?;
    decode_response(method, &body)
}

pub fn encode_request(method: &str, params: Vec<Value>) -> Vec<u8> {
    let id = NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed);
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": id,
    })
    .to_string()
    .into_bytes()
}

pub fn decode_response(method: &str, body: &[u8]) -> Result<Value, RpcError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(RpcError::EmptyResponse {
            method: method.to_string(),
        });
    }

    let response: JsonRpcResponse =
        serde_json::from_slice(body).map_err(|e| RpcError::InvalidResponse {
            method: method.to_string(),
            reason: e.to_string(),
        })?;

    if let Some(error) = response.error {
        let mut details = vec![error.message];
        details.extend(error.data.into_iter().map(|value| match value {
            Value::String(s) => s,
            other => other.to_string(),
        }));
        return Err(RpcError::Failure(Failure::new(details)));
    }

    Ok(response.result.unwrap_or(Value::Null))
}
