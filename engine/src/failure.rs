//! Structured remote failures
//!
//! The server reports failures as a list of strings: the first element names
//! the error kind, the rest are parameters (object references, power states,
//! host names). Higher-level actions may match on [`Failure::code`] to build
//! context-aware messages; everything else goes through the generic table here.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const HANDLE_INVALID: &str = "HANDLE_INVALID";
pub const SESSION_INVALID: &str = "SESSION_INVALID";
pub const RBAC_PERMISSION_DENIED: &str = "RBAC_PERMISSION_DENIED";
pub const TASK_CANCELLED: &str = "TASK_CANCELLED";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// (code, friendly template, short form)
const KNOWN_FAILURES: &[(&str, &str, Option<&str>)] = &[
    (
        HANDLE_INVALID,
        "The {0} you requested no longer exists ({1}).",
        Some("Object no longer exists"),
    ),
    (
        SESSION_INVALID,
        "Your session has expired or been disconnected. Log in again.",
        Some("Session expired"),
    ),
    (
        "HOST_OFFLINE",
        "The server {0} is offline.",
        Some("Server offline"),
    ),
    (
        "HOST_IS_SLAVE",
        "This server is not the pool coordinator. Connect to {0} instead.",
        Some("Not the pool coordinator"),
    ),
    (
        "VM_BAD_POWER_STATE",
        "The VM {0} must be {1} for this operation, but it is {2}.",
        Some("VM in wrong power state"),
    ),
    (
        RBAC_PERMISSION_DENIED,
        "You do not have the permissions required to perform {0}: {1}",
        Some("Permission denied"),
    ),
    (TASK_CANCELLED, "The task {0} was cancelled.", Some("Cancelled")),
    (
        "OTHER_OPERATION_IN_PROGRESS",
        "Another operation is already in progress on {0} {1}.",
        Some("Object busy"),
    ),
    (
        INTERNAL_ERROR,
        "The server reported an internal error: {0}",
        Some("Internal error"),
    ),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub error_description: Vec<String>,
}

impl Failure {
    pub fn new<I, S>(details: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            error_description: details.into_iter().map(Into::into).collect(),
        }
    }

    /// First element of the detail list, conventionally the error kind
    pub fn code(&self) -> Option<&str> {
        self.error_description.first().map(String::as_str)
    }

    pub fn params(&self) -> &[String] {
        self.error_description.get(1..).unwrap_or_default()
    }

    pub fn is_handle_invalid(&self) -> bool {
        self.code() == Some(HANDLE_INVALID)
    }

    /// Best-effort human readable message
    pub fn friendly_message(&self) -> String {
        let Some(code) = self.code() else {
            return "An unknown error occurred".to_string();
        };

        match lookup(code) {
            Some((template, _)) => fill_template(template, self.params()),
            None if self.params().is_empty() => code.to_string(),
            None => format!("{} {}", code, self.params().join(" ")),
        }
    }

    pub fn short_message(&self) -> String {
        match self.code() {
            Some(code) => lookup(code)
                .and_then(|(_, short)| short)
                .map(str::to_string)
                .unwrap_or_else(|| code.to_string()),
            None => "Unknown error".to_string(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.friendly_message())
    }
}

impl std::error::Error for Failure {}

fn lookup(code: &str) -> Option<(&'static str, Option<&'static str>)> {
    KNOWN_FAILURES
        .iter()
        .find(|(known, _, _)| *known == code)
        .map(|(_, template, short)| (*template, *short))
}

/// Substitutes `{0}`, `{1}`… with parameters; missing parameters become empty
fn fill_template(template: &str, params: &[String]) -> String {
    let mut message = template.to_string();
    let placeholders = template.matches('{').count();
    for index in 0..placeholders {
        let value = params.get(index).map(String::as_str).unwrap_or("");
        message = message.replace(&format!("{{{}}}", index), value);
    }
    message
}
