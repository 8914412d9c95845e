use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::applies_to::{AppliesTo, ObjectRef};
use super::context::{OperationContext, OperationSteps};
use super::defaults::OperationDefaults;
use super::state::{OperationEvent, OperationSnapshot, OperationState};
use crate::constants::operations;
use crate::errors::{OperationError, RpcError, SessionError};
use crate::failure::Failure;
use crate::registry::OperationRegistry;
use crate::rpc::{JsonRpcTaskApi, TaskApi};
use crate::session::{DefaultPermissionChecker, OwnedSession, PermissionChecker, Session};

/// Where an operation gets its session from
#[derive(Clone, Default)]
pub enum SessionSource {
    /// No session; steps that ask for one fail
    #[default]
    None,
    /// Duplicate this session lazily and own the copy for the run
    Duplicate(Arc<dyn Session>),
    /// Use this session as is; ownership stays with the caller
    External(Arc<dyn Session>),
}

#[derive(Debug)]
pub(super) struct Inner {
    pub(super) state: OperationState,
    pub(super) description: String,
    pub(super) percent_complete: i32,
    pub(super) error: Option<String>,
    pub(super) short_error: Option<String>,
    pub(super) error_details: Vec<String>,
    pub(super) applies_to: AppliesTo,
    pub(super) started_at: Option<DateTime<Utc>>,
    pub(super) finished_at: Option<DateTime<Utc>>,
    pub(super) related_task: Option<String>,
    pub(super) result: Option<String>,
    pub(super) revision: u64,
}

/// One long-running remote action: cancellable, progress-reporting, run
/// exactly once.
pub struct Operation {
    id: Uuid,
    title: String,
    pub(super) inner: Mutex<Inner>,
    // Paired with `inner`; wakes the poller's sleep on cancellation
    pub(super) wakeup: Condvar,
    pub(super) cancel_requested: AtomicBool,
    // Claimed by the first `cancel` call, before the driver is told
    cancel_claimed: AtomicBool,
    required_permissions: Vec<String>,
    session_source: SessionSource,
    active_session: Mutex<Option<Arc<dyn Session>>>,
    owned_session: Mutex<Option<OwnedSession>>,
    steps: Box<dyn OperationSteps>,
    pub(super) task_api: Arc<dyn TaskApi>,
    permission_checker: Arc<dyn PermissionChecker>,
    registry: Option<Arc<OperationRegistry>>,
    events: broadcast::Sender<OperationEvent>,
    pub(super) poll_interval: Duration,
    pub(super) correlation_key: String,
}

pub struct OperationBuilder {
    title: String,
    description: String,
    steps: Box<dyn OperationSteps>,
    session_source: SessionSource,
    required_permissions: Vec<String>,
    applies_to: AppliesTo,
    task_api: Arc<dyn TaskApi>,
    permission_checker: Arc<dyn PermissionChecker>,
    registry: Option<Arc<OperationRegistry>>,
    suppress_history: bool,
    poll_interval: Duration,
    correlation_key: String,
}

impl OperationBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn session(mut self, source: SessionSource) -> Self {
        self.session_source = source;
        self
    }

    /// Run on a private duplicate of `session`
    pub fn duplicate_session(self, session: Arc<dyn Session>) -> Self {
        self.session(SessionSource::Duplicate(session))
    }

    /// Run on `session` directly without taking ownership
    pub fn external_session(self, session: Arc<dyn Session>) -> Self {
        self.session(SessionSource::External(session))
    }

    pub fn required_permissions<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_permissions = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn applies_to(mut self, object: ObjectRef) -> Self {
        self.applies_to.add(&object);
        self
    }

    pub fn task_api(mut self, task_api: Arc<dyn TaskApi>) -> Self {
        self.task_api = task_api;
        self
    }

    pub fn permission_checker(mut self, checker: Arc<dyn PermissionChecker>) -> Self {
        self.permission_checker = checker;
        self
    }

    /// Register with `registry` instead of the process-wide one
    pub fn registry(mut self, registry: Arc<OperationRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Keep this operation out of any registry
    pub fn suppress_history(mut self) -> Self {
        self.suppress_history = true;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn correlation_key(mut self, key: impl Into<String>) -> Self {
        self.correlation_key = key.into();
        self
    }

    pub fn build(self) -> Arc<Operation> {
        let registry = if self.suppress_history {
            None
        } else {
            Some(self.registry.unwrap_or_else(OperationRegistry::global))
        };

        let (events, _) = broadcast::channel(operations::EVENT_CHANNEL_CAPACITY);
        let operation = Arc::new(Operation {
            id: Uuid::new_v4(),
            title: self.title,
            inner: Mutex::new(Inner {
                state: OperationState::NotStarted,
                description: self.description,
                percent_complete: 0,
                error: None,
                short_error: None,
                error_details: Vec::new(),
                applies_to: self.applies_to,
                started_at: None,
                finished_at: None,
                related_task: None,
                result: None,
                revision: 0,
            }),
            wakeup: Condvar::new(),
            cancel_requested: AtomicBool::new(false),
            cancel_claimed: AtomicBool::new(false),
            required_permissions: self.required_permissions,
            session_source: self.session_source,
            active_session: Mutex::new(None),
            owned_session: Mutex::new(None),
            steps: self.steps,
            task_api: self.task_api,
            permission_checker: self.permission_checker,
            registry,
            events,
            poll_interval: self.poll_interval,
            correlation_key: self.correlation_key,
        });

        if let Some(registry) = &operation.registry {
            registry.add(&operation);
        }

        operation
    }
}

impl Operation {
    pub fn builder(title: impl Into<String>, steps: impl OperationSteps + 'static) -> OperationBuilder {
        let defaults = OperationDefaults::current();
        OperationBuilder {
            title: title.into(),
            description: String::new(),
            steps: Box::new(steps),
            session_source: SessionSource::None,
            required_permissions: Vec::new(),
            applies_to: AppliesTo::default(),
            task_api: Arc::new(JsonRpcTaskApi),
            permission_checker: Arc::new(DefaultPermissionChecker),
            registry: None,
            suppress_history: false,
            poll_interval: defaults.poll_interval,
            correlation_key: defaults.correlation_key,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Key under which polled tasks are tagged with this operation's id
    pub fn correlation_key(&self) -> &str {
        &self.correlation_key
    }

    pub fn state(&self) -> OperationState {
        self.inner.lock().state
    }

    pub fn percent_complete(&self) -> i32 {
        self.inner.lock().percent_complete
    }

    pub fn description(&self) -> String {
        self.inner.lock().description.clone()
    }

    /// Meaningful once the state is `Failed`
    pub fn error(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    pub fn short_error(&self) -> Option<String> {
        self.inner.lock().short_error.clone()
    }

    pub fn error_details(&self) -> Vec<String> {
        self.inner.lock().error_details.clone()
    }

    /// Unwrapped result of the most recently polled task
    pub fn result(&self) -> Option<String> {
        self.inner.lock().result.clone()
    }

    /// Server task currently being polled, if any
    pub fn related_task(&self) -> Option<String> {
        self.inner.lock().related_task.clone()
    }

    pub fn required_permissions(&self) -> &[String] {
        &self.required_permissions
    }

    pub fn applies_to(&self) -> Vec<String> {
        self.inner.lock().applies_to.as_slice().to_vec()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> OperationSnapshot {
        let inner = self.inner.lock();
        self.snapshot_of(&inner)
    }

    fn snapshot_of(&self, inner: &Inner) -> OperationSnapshot {
        OperationSnapshot {
            id: self.id,
            title: self.title.clone(),
            description: inner.description.clone(),
            state: inner.state,
            percent_complete: inner.percent_complete,
            error: inner.error.clone(),
            short_error: inner.short_error.clone(),
            error_details: inner.error_details.clone(),
            applies_to: inner.applies_to.as_slice().to_vec(),
            started_at: inner.started_at,
            finished_at: inner.finished_at,
            revision: inner.revision,
        }
    }

    /// Applies `change` under the lock; publishes afterwards if it reports a change
    pub(super) fn mutate<F>(&self, change: F) -> bool
    where
        F: FnOnce(&mut Inner) -> bool,
    {
        let snapshot = {
            let mut inner = self.inner.lock();
            if !change(&mut inner) {
                return false;
            }
            inner.revision += 1;
            self.snapshot_of(&inner)
        };
        self.publish(OperationEvent::Changed(snapshot));
        true
    }

    fn publish(&self, event: OperationEvent) {
        if let Some(registry) = &self.registry {
            registry.update(event.snapshot());
        }
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn set_description(&self, description: impl Into<String>) {
        let description = description.into();
        self.mutate(|inner| {
            if inner.description == description {
                return false;
            }
            inner.description = description;
            true
        });
    }

    /// Clamped to `[0, 100]`
    pub fn set_percent_complete(&self, percent: i32) {
        let percent = percent.clamp(0, 100);
        self.mutate(|inner| {
            if inner.percent_complete == percent {
                return false;
            }
            inner.percent_complete = percent;
            true
        });
    }

    pub fn add_applies_to(&self, object: &ObjectRef) {
        self.mutate(|inner| {
            let before = inner.applies_to.len();
            inner.applies_to.add(object);
            inner.applies_to.len() != before
        });
    }

    /// Records an error. Moves to `Failed` only while `Running`, so a late
    /// error never overwrites a cancellation. With structured details the
    /// message is derived from them; otherwise `message` is used verbatim.
    pub fn set_error(&self, message: &str, details: Option<&[String]>) {
        let (error, short_error, error_details) = match details {
            Some(details) if !details.is_empty() => {
                let failure = Failure::new(details.iter().cloned());
                (failure.friendly_message(), failure.short_message(), details.to_vec())
            }
            _ => (message.to_string(), message.to_string(), Vec::new()),
        };

        self.mutate(|inner| {
            if inner.state != OperationState::Running {
                return false;
            }
            inner.state = OperationState::Failed;
            inner.error = Some(error);
            inner.short_error = Some(short_error);
            inner.error_details = error_details;
            inner.finished_at = Some(Utc::now());
            true
        });
    }

    /// `NotStarted -> Running`; false if the operation was already started
    pub(crate) fn begin(&self) -> bool {
        let snapshot = {
            let mut inner = self.inner.lock();
            if inner.state != OperationState::NotStarted {
                return false;
            }
            inner.state = OperationState::Running;
            inner.started_at = Some(Utc::now());
            inner.revision += 1;
            self.snapshot_of(&inner)
        };
        self.publish(OperationEvent::Started(snapshot));
        true
    }

    fn transition(&self, next: OperationState) -> bool {
        self.mutate(|inner| {
            if !inner.state.can_transition_to(next) {
                return false;
            }
            inner.state = next;
            inner.finished_at = Some(Utc::now());
            if next == OperationState::Completed {
                inner.percent_complete = 100;
            }
            true
        })
    }

    pub(super) fn mark_cancelled(&self) -> bool {
        self.transition(OperationState::Cancelled)
    }

    /// Requests cancellation. Only honoured while `Running`: the in-flight
    /// remote task is cancelled best-effort, the operation's own hook runs,
    /// then the state becomes `Cancelled`. Returns false if the operation was
    /// not running or a cancel was already requested.
    pub fn cancel(&self) -> bool {
        if self.state() != OperationState::Running {
            debug!("Ignoring cancel of '{}': not running", self.title);
            return false;
        }
        if self.cancel_claimed.swap(true, Ordering::SeqCst) {
            return false;
        }

        info!("Cancelling '{}' ({})", self.title, self.id);
        // The poller destroys its task once it sees the request, so the
        // server hears about the cancel first
        let remote = self.related_task().zip(self.active_session.lock().clone());
        if let Some((task, session)) = remote {
            self.cancel_remote_task(session.as_ref(), &task);
        }

        self.cancel_requested.store(true, Ordering::SeqCst);
        // Take the lock so a poller about to sleep cannot miss the wakeup
        drop(self.inner.lock());
        self.wakeup.notify_all();
        self.steps.on_cancel(self);
        // The woken driver may already have recorded the cancellation
        self.mark_cancelled();
        true
    }

    fn cancel_remote_task(&self, session: &dyn Session, task: &str) {
        match self.task_api.cancel(session, task) {
            Ok(()) => debug!("Cancelled remote task {}", task),
            // Typically the task has already finished
            Err(e) => debug!("Could not cancel remote task {}: {}", task, e),
        }
    }

    /// Strips the correlation tag from the task being polled, ahead of a reconnect
    pub fn prepare_for_restart(&self) {
        let Some(task) = self.related_task() else {
            return;
        };
        let Some(session) = self.active_session.lock().clone() else {
            return;
        };
        if let Err(e) =
            self.task_api
                .remove_from_other_config(session.as_ref(), &task, &self.correlation_key)
        {
            debug!("Could not untag task {} before restart: {}", task, e);
        }
    }

    /// Runs the step sequence on the calling thread until a terminal state
    pub fn run_sync(&self) {
        if !self.begin() {
            warn!("Operation '{}' ({}) already started", self.title, self.id);
            return;
        }
        self.drive();
    }

    /// Acquires the session on first use; duplicates are owned by this operation
    pub(super) fn session(&self) -> Result<Arc<dyn Session>, SessionError> {
        if let Some(session) = self.active_session.lock().clone() {
            return Ok(session);
        }

        let session = match &self.session_source {
            SessionSource::None => return Err(SessionError::NotAvailable),
            SessionSource::External(session) => {
                if !session.is_logged_in() {
                    return Err(SessionError::NotLoggedIn);
                }
                session.clone()
            }
            SessionSource::Duplicate(source) => {
                let owned = OwnedSession::duplicate_of(source.as_ref())?;
                let session = owned.session().clone();
                *self.owned_session.lock() = Some(owned);
                session
            }
        };

        *self.active_session.lock() = Some(session.clone());
        Ok(session)
    }

    fn check_permissions(&self) -> anyhow::Result<()> {
        if self.required_permissions.is_empty() {
            return Ok(());
        }
        let session = self.session()?;
        let Some(granted) = session.permissions() else {
            return Ok(());
        };
        let missing = self
            .permission_checker
            .missing(&self.required_permissions, &granted);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(OperationError::MissingPermissions { missing }.into())
        }
    }

    /// Worker-thread driver: runs the steps once, records the outcome,
    /// releases the private session, audit-logs, and publishes `Finished`.
    pub(crate) fn drive(&self) {
        let started = Instant::now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.check_permissions()?;
            let ctx = OperationContext::new(self);
            self.steps.run(&ctx)
        }));

        match outcome {
            Ok(Ok(())) => {
                self.transition(OperationState::Completed);
            }
            Ok(Err(e)) => self.record_error(&e),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "operation panicked".to_string());
                self.set_error(&format!("Internal error: {}", message), None);
            }
        }

        self.release_session();

        let elapsed = started.elapsed();
        let snapshot = self.snapshot();
        match snapshot.state {
            OperationState::Completed => info!(
                target: "audit",
                "Operation '{}' ({}) succeeded in {:?}", self.title, self.id, elapsed
            ),
            OperationState::Cancelled => info!(
                target: "audit",
                "Operation '{}' ({}) cancelled after {:?}", self.title, self.id, elapsed
            ),
            OperationState::Failed => warn!(
                target: "audit",
                "Operation '{}' ({}) failed after {:?}: {}",
                self.title,
                self.id,
                elapsed,
                snapshot.error.as_deref().unwrap_or("unknown error")
            ),
            other => warn!(
                "Operation '{}' ({}) ended in unexpected state {:?}",
                self.title, self.id, other
            ),
        }

        self.publish(OperationEvent::Finished(snapshot));
    }

    fn record_error(&self, err: &anyhow::Error) {
        let cancelled = err
            .chain()
            .any(|cause| matches!(cause.downcast_ref::<OperationError>(), Some(OperationError::Cancelled)));
        if cancelled {
            self.mark_cancelled();
            return;
        }

        let failure = err.chain().find_map(|cause| {
            cause
                .downcast_ref::<Failure>()
                .or_else(|| cause.downcast_ref::<RpcError>().and_then(RpcError::failure))
        });

        match failure {
            Some(failure) => self.set_error(&err.to_string(), Some(&failure.error_description)),
            None => self.set_error(&err.to_string(), None),
        }
    }

    fn release_session(&self) {
        self.active_session.lock().take();
        // Logout happens in OwnedSession's Drop, outside our locks
        let owned = self.owned_session.lock().take();
        drop(owned);
    }
}
