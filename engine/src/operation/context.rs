use std::sync::Arc;

use anyhow::anyhow;
use serde_json::Value;

use super::lifecycle::Operation;
use super::state::OperationState;
use crate::errors::OperationError;
use crate::rpc::{self, task::task_ref};
use crate::session::Session;

/// The remote-call sequence an operation performs.
///
/// `run` is invoked exactly once, on whichever thread drives the operation.
/// Long sequences should call [`OperationContext::check_cancelled`] between
/// blocking points; task polling does so on its own.
pub trait OperationSteps: Send + Sync {
    fn run(&self, ctx: &OperationContext<'_>) -> anyhow::Result<()>;

    /// Called from the cancelling thread after the remote task was cancelled
    fn on_cancel(&self, _operation: &Operation) {}
}

impl<F> OperationSteps for F
where
    F: Fn(&OperationContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn run(&self, ctx: &OperationContext<'_>) -> anyhow::Result<()> {
        self(ctx)
    }
}

/// What a running step sequence can see and do
pub struct OperationContext<'a> {
    operation: &'a Operation,
}

impl<'a> OperationContext<'a> {
    pub(super) fn new(operation: &'a Operation) -> Self {
        Self { operation }
    }

    pub fn operation(&self) -> &Operation {
        self.operation
    }

    /// The operation's session, acquired (and duplicated if configured) on first use
    pub fn session(&self) -> anyhow::Result<Arc<dyn Session>> {
        Ok(self.operation.session()?)
    }

    pub fn set_description(&self, description: impl Into<String>) {
        self.operation.set_description(description);
    }

    pub fn set_percent_complete(&self, percent: i32) {
        self.operation.set_percent_complete(percent);
    }

    pub fn is_cancelled(&self) -> bool {
        self.operation.is_cancel_requested()
    }

    pub fn check_cancelled(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            Err(OperationError::Cancelled.into())
        } else {
            Ok(())
        }
    }

    /// Synchronous remote call on the operation's session
    pub fn call(&self, method: &str, params: Vec<Value>) -> anyhow::Result<Value> {
        let session = self.session()?;
        Ok(rpc::call(session.as_ref(), method, params)?)
    }

    /// Calls the `Async.` variant of `method` and returns the task handle.
    /// The session reference is prepended to `params`.
    pub fn call_async(&self, method: &str, mut params: Vec<Value>) -> anyhow::Result<String> {
        let session = self.session()?;
        params.insert(0, Value::String(session.opaque_ref()));
        let method = format!("Async.{}", method);
        let value = rpc::call(session.as_ref(), &method, params)?;
        task_ref(&value).ok_or_else(|| {
            OperationError::MissingValue {
                what: format!("task handle from {}", method),
            }
            .into()
        })
    }

    /// Polls `task` to completion, mapping its progress onto `[start, finish]`
    pub fn poll_task(&self, task: &str, start: i32, finish: i32) -> anyhow::Result<()> {
        let session = self.session()?;
        self.operation.poll_task(&session, task, start, finish, false)
    }

    /// As [`poll_task`](Self::poll_task), but a remote failure is discarded:
    /// progress snaps to `finish` and the step continues. Only for sub-steps
    /// whose failure is acceptable.
    pub fn poll_task_suppressing_failures(
        &self,
        task: &str,
        start: i32,
        finish: i32,
    ) -> anyhow::Result<()> {
        let session = self.session()?;
        self.operation.poll_task(&session, task, start, finish, true)
    }

    /// Runs another operation to completion on this thread
    pub fn run_sub_operation(&self, sub: &Operation) -> anyhow::Result<()> {
        sub.run_sync();
        match sub.state() {
            OperationState::Completed => Ok(()),
            OperationState::Cancelled => Err(OperationError::Cancelled.into()),
            OperationState::Failed => Err(anyhow!(
                "{}",
                sub.error().unwrap_or_else(|| format!("{} failed", sub.title()))
            )),
            other => Err(anyhow!("{} ended in state {:?}", sub.title(), other)),
        }
    }
}
