//! Remote task protocol
//!
//! Asynchronous remote calls return a task handle whose record exposes
//! `status`, fractional `progress`, `result` and `error_info`. Tasks can carry
//! arbitrary key/value tags in `other_config` and are destroyed explicitly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::call;
use crate::errors::RpcError;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Success,
    Failure,
    Cancelling,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub error_info: Vec<String>,
    #[serde(default)]
    pub other_config: HashMap<String, String>,
}

/// The calls the poller needs on a task handle
pub trait TaskApi: Send + Sync {
    fn get_record(&self, session: &dyn Session, task: &str) -> Result<TaskRecord, RpcError>;

    fn cancel(&self, session: &dyn Session, task: &str) -> Result<(), RpcError>;

    fn destroy(&self, session: &dyn Session, task: &str) -> Result<(), RpcError>;

    fn add_to_other_config(
        &self,
        session: &dyn Session,
        task: &str,
        key: &str,
        value: &str,
    ) -> Result<(), RpcError>;

    fn remove_from_other_config(
        &self,
        session: &dyn Session,
        task: &str,
        key: &str,
    ) -> Result<(), RpcError>;
}

/// [`TaskApi`] over JSON-RPC `task.*` methods
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRpcTaskApi;

impl TaskApi for JsonRpcTaskApi {
    fn get_record(&self, session: &dyn Session, task: &str) -> Result<TaskRecord, RpcError> {
        let method = "task.get_record";
        let value = call(session, method, vec![json!(session.opaque_ref()), json!(task)])?;
        serde_json::from_value(value).map_err(|e| RpcError::InvalidResponse {
            method: method.to_string(),
            reason: e.to_string(),
        })
    }

    fn cancel(&self, session: &dyn Session, task: &str) -> Result<(), RpcError> {
        call(session, "task.cancel", vec![json!(session.opaque_ref()), json!(task)]).map(drop)
    }

    fn destroy(&self, session: &dyn Session, task: &str) -> Result<(), RpcError> {
        call(session, "task.destroy", vec![json!(session.opaque_ref()), json!(task)]).map(drop)
    }

    fn add_to_other_config(
        &self,
        session: &dyn Session,
        task: &str,
        key: &str,
        value: &str,
    ) -> Result<(), RpcError> {
        call(
            session,
            "task.add_to_other_config",
            vec![json!(session.opaque_ref()), json!(task), json!(key), json!(value)],
        )
        .map(drop)
    }

    fn remove_from_other_config(
        &self,
        session: &dyn Session,
        task: &str,
        key: &str,
    ) -> Result<(), RpcError> {
        call(
            session,
            "task.remove_from_other_config",
            vec![json!(session.opaque_ref()), json!(task), json!(key)],
        )
        .map(drop)
    }
}

/// Strips the wire-level `<value>` envelope a task result may carry
pub fn unwrap_result(raw: &str) -> String {
    let mut result = raw.trim();
    while let Some(inner) = result
        .strip_prefix("<value>")
        .and_then(|rest| rest.strip_suffix("</value>"))
    {
        result = inner.trim();
    }
    result.to_string()
}

/// Turns a call result that should be a task handle into one
pub fn task_ref(value: &Value) -> Option<String> {
    value
        .as_str()
        .filter(|s| !s.is_empty() && *s != "OpaqueRef:NULL")
        .map(str::to_string)
}
