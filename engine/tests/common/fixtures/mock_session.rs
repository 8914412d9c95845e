//! In-memory session and task API doubles
//!
//! `MockSession` counts duplications and logouts and can forward raw
//! payloads to any responder (typically a [`FakeXapi`](super::FakeXapi)).
//! `ScriptedTaskApi` replays a fixed sequence of task records per task and
//! records every side effect the poller has on the server.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use engine::errors::{RpcError, SessionError};
use engine::failure::Failure;
use engine::rpc::{TaskApi, TaskRecord};
use engine::session::Session;

pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Counters shared by a session and all of its duplicates
#[derive(Default)]
pub struct SessionCounters {
    pub duplicates: AtomicUsize,
    pub logouts: AtomicUsize,
}

pub struct MockSession {
    opaque_ref: String,
    logged_in: AtomicBool,
    permissions: Option<Vec<String>>,
    responder: Option<Responder>,
    pub counters: Arc<SessionCounters>,
}

impl MockSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_ref("OpaqueRef:session-0", Arc::default()))
    }

    fn with_ref(opaque_ref: &str, counters: Arc<SessionCounters>) -> Self {
        Self {
            opaque_ref: opaque_ref.to_string(),
            logged_in: AtomicBool::new(true),
            permissions: None,
            responder: None,
            counters,
        }
    }

    /// Session whose server enforces role-based access with these grants
    pub fn with_permissions(permissions: &[&str]) -> Arc<Self> {
        let mut session = Self::with_ref("OpaqueRef:session-0", Arc::default());
        session.permissions = Some(permissions.iter().map(|p| p.to_string()).collect());
        Arc::new(session)
    }

    /// Session that forwards raw payloads to `responder`
    pub fn with_responder(opaque_ref: &str, responder: Responder) -> Arc<Self> {
        let mut session = Self::with_ref(opaque_ref, Arc::default());
        session.responder = Some(responder);
        Arc::new(session)
    }

    pub fn duplicates(&self) -> usize {
        self.counters.duplicates.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.counters.logouts.load(Ordering::SeqCst)
    }
}

impl Session for MockSession {
    fn opaque_ref(&self) -> String {
        self.opaque_ref.clone()
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    fn duplicate(&self) -> Result<Arc<dyn Session>, SessionError> {
        let n = self.counters.duplicates.fetch_add(1, Ordering::SeqCst) + 1;
        let mut copy = Self::with_ref(
            &format!("{}-dup{}", self.opaque_ref, n),
            self.counters.clone(),
        );
        copy.permissions = self.permissions.clone();
        copy.responder = self.responder.clone();
        Ok(Arc::new(copy))
    }

    fn send_raw(&self, payload: &[u8]) -> Result<Vec<u8>, SessionError> {
        if !self.is_logged_in() {
            return Err(SessionError::NotLoggedIn);
        }
        match &self.responder {
            Some(responder) => Ok(responder(payload)),
            None => Err(SessionError::RequestFailed {
                reason: "mock session has no responder".to_string(),
            }),
        }
    }

    fn permissions(&self) -> Option<Vec<String>> {
        self.permissions.clone()
    }

    fn logout(&self) -> Result<(), SessionError> {
        if self.logged_in.swap(false, Ordering::SeqCst) {
            self.counters.logouts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Replays scripted records; the last entry of a script repeats forever
#[derive(Default)]
pub struct ScriptedTaskApi {
    scripts: Mutex<HashMap<String, VecDeque<Result<TaskRecord, RpcError>>>>,
    tags: Mutex<HashMap<String, HashMap<String, String>>>,
    added_tags: Mutex<Vec<(String, String, String)>>,
    removed_tags: Mutex<Vec<(String, String)>>,
    cancelled: Mutex<Vec<String>>,
    destroyed: Mutex<Vec<String>>,
    lifecycle: Mutex<Vec<(&'static str, String)>>,
    polls: AtomicUsize,
    cancel_fails: AtomicBool,
}

impl ScriptedTaskApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, task: &str, records: Vec<TaskRecord>) {
        self.scripts
            .lock()
            .insert(task.to_string(), records.into_iter().map(Ok).collect());
    }

    /// The task disappears: every lookup reports `HANDLE_INVALID`
    pub fn vanish(&self, task: &str) {
        let gone = RpcError::Failure(Failure::new(["HANDLE_INVALID", "task", task]));
        self.scripts
            .lock()
            .insert(task.to_string(), VecDeque::from([Err(gone)]));
    }

    /// Make `task.cancel` report that the task already finished
    pub fn fail_cancel(&self) {
        self.cancel_fails.store(true, Ordering::SeqCst);
    }

    pub fn tags(&self, task: &str) -> HashMap<String, String> {
        self.tags.lock().get(task).cloned().unwrap_or_default()
    }

    /// Every (task, key, value) ever tagged, in order
    pub fn added_tags(&self) -> Vec<(String, String, String)> {
        self.added_tags.lock().clone()
    }

    pub fn removed_tags(&self) -> Vec<(String, String)> {
        self.removed_tags.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().clone()
    }

    /// Cancel and destroy calls in the order the server saw them
    pub fn lifecycle(&self) -> Vec<(&'static str, String)> {
        self.lifecycle.lock().clone()
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

impl TaskApi for ScriptedTaskApi {
    fn get_record(&self, _session: &dyn Session, task: &str) -> Result<TaskRecord, RpcError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut scripts = self.scripts.lock();
        let Some(script) = scripts.get_mut(task) else {
            return Err(RpcError::Failure(Failure::new(["HANDLE_INVALID", "task", task])));
        };
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        next.unwrap_or_else(|| Err(RpcError::Failure(Failure::new(["HANDLE_INVALID", "task", task]))))
    }

    fn cancel(&self, _session: &dyn Session, task: &str) -> Result<(), RpcError> {
        self.cancelled.lock().push(task.to_string());
        self.lifecycle.lock().push(("cancel", task.to_string()));
        if self.cancel_fails.load(Ordering::SeqCst) {
            return Err(RpcError::Failure(Failure::new(["TASK_CANCELLED", task])));
        }
        Ok(())
    }

    fn destroy(&self, _session: &dyn Session, task: &str) -> Result<(), RpcError> {
        self.destroyed.lock().push(task.to_string());
        self.lifecycle.lock().push(("destroy", task.to_string()));
        Ok(())
    }

    fn add_to_other_config(
        &self,
        _session: &dyn Session,
        task: &str,
        key: &str,
        value: &str,
    ) -> Result<(), RpcError> {
        self.added_tags
            .lock()
            .push((task.to_string(), key.to_string(), value.to_string()));
        self.tags
            .lock()
            .entry(task.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_from_other_config(
        &self,
        _session: &dyn Session,
        task: &str,
        key: &str,
    ) -> Result<(), RpcError> {
        if let Some(tags) = self.tags.lock().get_mut(task) {
            tags.remove(key);
        }
        self.removed_tags
            .lock()
            .push((task.to_string(), key.to_string()));
        Ok(())
    }
}
