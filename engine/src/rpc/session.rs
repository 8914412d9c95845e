use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info};

use super::{decode_response, encode_request};
use crate::errors::SessionError;
use crate::session::Session;
use crate::transport::TransportWorker;

const API_VERSION: &str = "1.0";
const ORIGINATOR: &str = "engine";

/// A [`Session`] whose calls travel through a shared [`TransportWorker`]
pub struct RpcSession {
    worker: Arc<TransportWorker>,
    opaque_ref: String,
    username: String,
    password: String,
    response_timeout: Duration,
    logged_in: AtomicBool,
}

impl RpcSession {
    pub fn login(
        worker: Arc<TransportWorker>,
        username: &str,
        password: &str,
    ) -> Result<Arc<Self>, SessionError> {
        let response_timeout = worker.config().response_timeout;
        let method = "session.login_with_password";
        let payload = encode_request(
            method,
            vec![
                json!(username),
                json!(password),
                json!(API_VERSION),
                json!(ORIGINATOR),
            ],
        );

        let body = exchange(&worker, payload, response_timeout)?;
        let value = decode_response(method, &body).map_err(|e| SessionError::LoginFailed {
            reason: e.to_string(),
        })?;
        let opaque_ref = value
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SessionError::LoginFailed {
                reason: format!("unexpected login result {}", value),
            })?
            .to_string();

        info!("Logged in to {} as {}", worker.host(), username);

        Ok(Arc::new(Self {
            worker,
            opaque_ref,
            username: username.to_string(),
            password: password.to_string(),
            response_timeout,
            logged_in: AtomicBool::new(true),
        }))
    }
}

impl Session for RpcSession {
    fn opaque_ref(&self) -> String {
        self.opaque_ref.clone()
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    fn duplicate(&self) -> Result<Arc<dyn Session>, SessionError> {
        if !self.is_logged_in() {
            return Err(SessionError::NotLoggedIn);
        }
        let copy: Arc<dyn Session> =
            RpcSession::login(self.worker.clone(), &self.username, &self.password)?;
        Ok(copy)
    }

    fn send_raw(&self, payload: &[u8]) -> Result<Vec<u8>, SessionError> {
        if !self.is_logged_in() {
            return Err(SessionError::NotLoggedIn);
        }
        exchange(&self.worker, payload.to_vec(), self.response_timeout)
    }

    fn logout(&self) -> Result<(), SessionError> {
        if !self.logged_in.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let method = "session.logout";
        let payload = encode_request(method, vec![json!(self.opaque_ref)]);
        let body = exchange(&self.worker, payload, self.response_timeout)?;
        decode_response(method, &body).map_err(|e| SessionError::RequestFailed {
            reason: e.to_string(),
        })?;
        debug!("Logged out session {}", self.opaque_ref);
        Ok(())
    }
}

/// Queue without broadcast and wait for our own id
fn exchange(
    worker: &TransportWorker,
    payload: Vec<u8>,
    timeout: Duration,
) -> Result<Vec<u8>, SessionError> {
    let id = worker.queue_request(payload, false);
    match worker.wait_for_response(id, timeout) {
        None => Err(SessionError::Timeout),
        Some(body) if body.is_empty() => Err(SessionError::RequestFailed {
            reason: format!("no response from {}", worker.host()),
        }),
        Some(body) => Ok(body),
    }
}
