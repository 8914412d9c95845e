// Background executor for operations
//
// Steps block on the transport, so they run on tokio's blocking pool rather
// than on the async workers.
//
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::errors::EngineError;
use crate::operation::{Operation, OperationState};

#[derive(Clone)]
pub struct OperationExecutor {
    runtime: Handle,
}

impl OperationExecutor {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Executor bound to the runtime of the calling context
    pub fn current() -> Result<Self, EngineError> {
        let runtime = Handle::try_current()
            .map_err(|e| EngineError::Other(format!("no tokio runtime available: {}", e)))?;
        Ok(Self::new(runtime))
    }

    /// Moves `operation` to `Running` and drives it on a worker thread.
    ///
    /// Returns immediately. `None` if the operation had already been started,
    /// in which case nothing is scheduled.
    #[instrument(skip_all, fields(operation = %operation.title()))]
    pub fn start(&self, operation: &Arc<Operation>) -> Option<JoinHandle<()>> {
        if !operation.begin() {
            warn!(
                "Operation '{}' ({}) already started",
                operation.title(),
                operation.id()
            );
            return None;
        }

        debug!("Scheduling '{}' ({})", operation.title(), operation.id());
        let operation = operation.clone();
        Some(self.runtime.spawn_blocking(move || operation.drive()))
    }

    /// Starts `operation` and waits for it to finish, returning its final state
    pub async fn run(&self, operation: &Arc<Operation>) -> Result<OperationState, EngineError> {
        let Some(handle) = self.start(operation) else {
            return Err(EngineError::Other(format!(
                "operation '{}' already started",
                operation.title()
            )));
        };
        handle
            .await
            .map_err(|e| EngineError::Other(format!("operation worker failed: {}", e)))?;
        Ok(operation.state())
    }
}
