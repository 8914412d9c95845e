use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OperationState {
    NotStarted,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Cancelled | OperationState::Failed
        )
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(self, next: OperationState) -> bool {
        matches!(
            (self, next),
            (OperationState::NotStarted, OperationState::Running)
                | (OperationState::Running, OperationState::Completed)
                | (OperationState::Running, OperationState::Cancelled)
                | (OperationState::Running, OperationState::Failed)
        )
    }
}

/// Point-in-time copy of an operation's observable fields
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationSnapshot {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub state: OperationState,
    pub percent_complete: i32,
    pub error: Option<String>,
    pub short_error: Option<String>,
    pub error_details: Vec<String>,
    pub applies_to: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Bumped on every change so stale copies can be recognised
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    Started(OperationSnapshot),
    Changed(OperationSnapshot),
    /// The step sequence has returned and all cleanup has run
    Finished(OperationSnapshot),
}

impl OperationEvent {
    pub fn snapshot(&self) -> &OperationSnapshot {
        match self {
            OperationEvent::Started(s) | OperationEvent::Changed(s) | OperationEvent::Finished(s) => s,
        }
    }
}
