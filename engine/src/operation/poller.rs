//! Remote task polling
//!
//! Follows one server task to a terminal status while mapping its fractional
//! progress onto a slice of the operation's percent bar. Whatever way the
//! loop ends, the task is untagged and destroyed on the server.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use super::lifecycle::Operation;
use crate::errors::OperationError;
use crate::failure::Failure;
use crate::rpc::{unwrap_result, TaskStatus};
use crate::session::Session;

/// Maps fractional remote progress onto `[start, finish]`
pub fn interpolate(start: i32, finish: i32, progress: f64) -> i32 {
    let progress = if progress.is_finite() {
        progress.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let percent = start as f64 + progress * (finish - start) as f64;
    (percent as i32).clamp(0, 100)
}

/// Untags and destroys the task when dropped, then forgets it
struct TaskCleanup<'a> {
    operation: &'a Operation,
    session: &'a Arc<dyn Session>,
    task: &'a str,
}

impl Drop for TaskCleanup<'_> {
    fn drop(&mut self) {
        let api = &self.operation.task_api;
        let session = self.session.as_ref();

        if let Err(e) =
            api.remove_from_other_config(session, self.task, &self.operation.correlation_key)
        {
            debug!("Could not untag task {}: {}", self.task, e);
        }
        if let Err(e) = api.destroy(session, self.task) {
            debug!("Could not destroy task {}: {}", self.task, e);
        }

        self.operation.mutate(|inner| {
            if inner.related_task.as_deref() != Some(self.task) {
                return false;
            }
            inner.related_task = None;
            true
        });
    }
}

impl Operation {
    pub(super) fn poll_task(
        &self,
        session: &Arc<dyn Session>,
        task: &str,
        start: i32,
        finish: i32,
        suppress_failures: bool,
    ) -> anyhow::Result<()> {
        self.mutate(|inner| {
            inner.related_task = Some(task.to_string());
            inner.result = None;
            true
        });

        // Lets the task be matched back to this operation after a reconnect
        if let Err(e) = self.task_api.add_to_other_config(
            session.as_ref(),
            task,
            &self.correlation_key,
            &self.id().to_string(),
        ) {
            debug!("Could not tag task {}: {}", task, e);
        }

        let _cleanup = TaskCleanup {
            operation: self,
            session,
            task,
        };

        self.poll_until_done(session, task, start, finish, suppress_failures)
    }

    fn poll_until_done(
        &self,
        session: &Arc<dyn Session>,
        task: &str,
        start: i32,
        finish: i32,
        suppress_failures: bool,
    ) -> anyhow::Result<()> {
        loop {
            if self.is_cancel_requested() {
                self.set_percent_complete(finish);
                return Err(OperationError::Cancelled.into());
            }

            let record = match self.task_api.get_record(session.as_ref(), task) {
                Ok(record) => record,
                Err(e) if e.failure().is_some_and(Failure::is_handle_invalid) => {
                    // Already finished and destroyed on the server
                    debug!("Task {} is gone; treating as complete", task);
                    self.set_percent_complete(finish);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            self.set_percent_complete(interpolate(start, finish, record.progress));

            match record.status {
                TaskStatus::Success => {
                    self.set_percent_complete(finish);
                    let result = unwrap_result(&record.result);
                    self.mutate(|inner| {
                        inner.result = Some(result);
                        true
                    });
                    return Ok(());
                }
                TaskStatus::Failure if suppress_failures => {
                    warn!(
                        "Ignoring failure of task {}: {}",
                        task,
                        record.error_info.join(" ")
                    );
                    self.set_percent_complete(finish);
                    return Ok(());
                }
                TaskStatus::Failure => {
                    self.set_percent_complete(finish);
                    return Err(Failure::new(record.error_info).into());
                }
                TaskStatus::Cancelled => {
                    self.set_percent_complete(finish);
                    self.mark_cancelled();
                    return Err(OperationError::Cancelled.into());
                }
                TaskStatus::Pending | TaskStatus::Cancelling => self.pause(),
            }
        }
    }

    /// Sleeps one poll interval, waking early on cancellation
    fn pause(&self) {
        let mut inner = self.inner.lock();
        if self.cancel_requested.load(Ordering::SeqCst) {
            return;
        }
        self.wakeup.wait_while_for(
            &mut inner,
            |_| !self.cancel_requested.load(Ordering::SeqCst),
            self.poll_interval,
        );
    }
}
