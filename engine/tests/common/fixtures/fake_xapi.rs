//! Fake control-plane API
//!
//! Understands just enough JSON-RPC to log in and out, start asynchronous
//! calls, and walk their tasks to an outcome. Every call is recorded so
//! tests can assert on the exact server-side effects.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use super::credentials;
use super::mock_session::Responder;

/// How tasks created by `Async.*` calls end
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success { result: String },
    Failure { error_info: Vec<String> },
    /// Stays pending until cancelled
    Never,
}

#[derive(Debug, Clone)]
struct FakeTask {
    status: &'static str,
    progress: f64,
    polls_left: u32,
    outcome: TaskOutcome,
    other_config: HashMap<String, String>,
}

struct State {
    sessions: HashSet<String>,
    tasks: HashMap<String, FakeTask>,
    next_ref: u64,
    logins: usize,
    calls: Vec<(String, Vec<Value>)>,
    destroyed: Vec<String>,
    outcome: TaskOutcome,
    // Overrides `outcome` for async calls on a given object
    outcomes_by_object: HashMap<String, TaskOutcome>,
    polls_to_finish: u32,
}

pub struct FakeXapi {
    state: Mutex<State>,
}

impl FakeXapi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                sessions: HashSet::new(),
                tasks: HashMap::new(),
                next_ref: 0,
                logins: 0,
                calls: Vec::new(),
                destroyed: Vec::new(),
                outcome: TaskOutcome::Success {
                    result: String::new(),
                },
                outcomes_by_object: HashMap::new(),
                polls_to_finish: 3,
            }),
        })
    }

    /// Outcome of tasks created from now on, reached after `polls` lookups
    pub fn set_task_outcome(&self, outcome: TaskOutcome, polls: u32) {
        let mut state = self.state.lock();
        state.outcome = outcome;
        state.polls_to_finish = polls;
    }

    /// Outcome of tasks started on `object` (the first argument after the session)
    pub fn set_task_outcome_for(&self, object: &str, outcome: TaskOutcome) {
        self.state
            .lock()
            .outcomes_by_object
            .insert(object.to_string(), outcome);
    }

    /// Logs in directly, bypassing the wire
    pub fn open_session(&self) -> String {
        let mut state = self.state.lock();
        Self::new_session(&mut state)
    }

    pub fn responder(self: &Arc<Self>) -> Responder {
        let xapi = self.clone();
        Arc::new(move |payload: &[u8]| xapi.handle(payload))
    }

    pub fn logins(&self) -> usize {
        self.state.lock().logins
    }

    pub fn live_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn calls(&self, method: &str) -> Vec<Vec<Value>> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().destroyed.clone()
    }

    pub fn task_tags(&self, task: &str) -> Option<HashMap<String, String>> {
        self.state
            .lock()
            .tasks
            .get(task)
            .map(|t| t.other_config.clone())
    }

    /// Tasks created so far that still exist
    pub fn live_tasks(&self) -> Vec<String> {
        self.state.lock().tasks.keys().cloned().collect()
    }

    fn new_session(state: &mut State) -> String {
        state.next_ref += 1;
        state.logins += 1;
        let session = format!("OpaqueRef:session-{}", state.next_ref);
        state.sessions.insert(session.clone());
        session
    }

    /// Answers one raw JSON-RPC request
    pub fn handle(&self, payload: &[u8]) -> Vec<u8> {
        let request: Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => return error_body(&Value::Null, "INTERNAL_ERROR", &[json!(e.to_string())]),
        };
        let id = request["id"].clone();
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params = request["params"].as_array().cloned().unwrap_or_default();

        let mut state = self.state.lock();
        state.calls.push((method.clone(), params.clone()));

        let reply = self.dispatch(&mut state, &method, &params);
        match reply {
            Ok(result) => json!({"jsonrpc": "2.0", "result": result, "id": id})
                .to_string()
                .into_bytes(),
            Err((code, data)) => error_body(&id, &code, &data),
        }
    }

    fn dispatch(
        &self,
        state: &mut State,
        method: &str,
        params: &[Value],
    ) -> Result<Value, (String, Vec<Value>)> {
        let param = |i: usize| params.get(i).and_then(Value::as_str).unwrap_or_default().to_string();

        if method == "session.login_with_password" {
            if param(0) != credentials::USERNAME || param(1) != credentials::PASSWORD {
                return Err(("SESSION_AUTHENTICATION_FAILED".to_string(), vec![json!(param(0))]));
            }
            return Ok(json!(Self::new_session(state)));
        }

        let session = param(0);
        if !state.sessions.contains(&session) {
            return Err(("SESSION_INVALID".to_string(), vec![json!(session)]));
        }

        if let Some(inner) = method.strip_prefix("Async.") {
            state.next_ref += 1;
            let task = format!("OpaqueRef:task-{}", state.next_ref);
            let outcome = state
                .outcomes_by_object
                .get(&param(1))
                .unwrap_or(&state.outcome)
                .clone();
            let polls_left = state.polls_to_finish;
            state.tasks.insert(
                task.clone(),
                FakeTask {
                    status: "pending",
                    progress: 0.0,
                    polls_left,
                    outcome,
                    other_config: HashMap::from([("method".to_string(), inner.to_string())]),
                },
            );
            return Ok(json!(task));
        }

        let task_ref = param(1);
        let handle_invalid = || ("HANDLE_INVALID".to_string(), vec![json!("task"), json!(param(1))]);

        match method {
            "session.logout" => {
                state.sessions.remove(&session);
                Ok(Value::Null)
            }
            "task.get_record" => {
                let task = state.tasks.get_mut(&task_ref).ok_or_else(handle_invalid)?;
                advance(task);
                let result = match &task.outcome {
                    TaskOutcome::Success { result } if task.status == "success" => result.clone(),
                    _ => String::new(),
                };
                let error_info = match &task.outcome {
                    TaskOutcome::Failure { error_info } if task.status == "failure" => {
                        error_info.clone()
                    }
                    _ => Vec::new(),
                };
                Ok(json!({
                    "status": task.status,
                    "progress": task.progress,
                    "result": result,
                    "error_info": error_info,
                    "other_config": task.other_config,
                }))
            }
            "task.cancel" => {
                let task = state.tasks.get_mut(&task_ref).ok_or_else(handle_invalid)?;
                if task.status == "pending" {
                    task.status = "cancelling";
                }
                Ok(Value::Null)
            }
            "task.destroy" => {
                state.tasks.remove(&task_ref).ok_or_else(handle_invalid)?;
                state.destroyed.push(task_ref);
                Ok(Value::Null)
            }
            "task.add_to_other_config" => {
                let task = state.tasks.get_mut(&task_ref).ok_or_else(handle_invalid)?;
                task.other_config.insert(param(2), param(3));
                Ok(Value::Null)
            }
            "task.remove_from_other_config" => {
                let task = state.tasks.get_mut(&task_ref).ok_or_else(handle_invalid)?;
                task.other_config.remove(&param(2));
                Ok(Value::Null)
            }
            other => Err(("MESSAGE_METHOD_UNKNOWN".to_string(), vec![json!(other)])),
        }
    }
}

fn advance(task: &mut FakeTask) {
    match task.status {
        "cancelling" => task.status = "cancelled",
        "pending" => {
            if matches!(task.outcome, TaskOutcome::Never) {
                task.progress = 0.5;
                return;
            }
            if task.polls_left > 0 {
                task.polls_left -= 1;
            }
            if task.polls_left == 0 {
                task.progress = 1.0;
                task.status = match task.outcome {
                    TaskOutcome::Failure { .. } => "failure",
                    _ => "success",
                };
            } else {
                task.progress = (task.progress + 0.25).min(0.75);
            }
        }
        _ => {}
    }
}

fn error_body(id: &Value, code: &str, data: &[Value]) -> Vec<u8> {
    json!({
        "jsonrpc": "2.0",
        "error": {"code": 1, "message": code, "data": data},
        "id": id,
    })
    .to_string()
    .into_bytes()
}
