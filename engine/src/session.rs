//! Session collaborator contracts
//!
//! A session is an authenticated handle bound to a connection. Operations
//! either borrow one supplied by the caller or own a private duplicate so
//! concurrent operations never contend on the same server session.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::errors::SessionError;

pub trait Session: Send + Sync {
    /// Server-side reference of this session
    fn opaque_ref(&self) -> String;

    fn is_logged_in(&self) -> bool;

    /// Produce an independent, separately logged-in session
    fn duplicate(&self) -> Result<Arc<dyn Session>, SessionError>;

    /// Send one raw RPC payload and return the raw response body
    fn send_raw(&self, payload: &[u8]) -> Result<Vec<u8>, SessionError>;

    /// Permissions granted to this session, or `None` when the server does
    /// not enforce role-based access control
    fn permissions(&self) -> Option<Vec<String>> {
        None
    }

    fn logout(&self) -> Result<(), SessionError>;
}

/// A duplicated session owned by exactly one operation; logged out on drop
pub struct OwnedSession {
    session: Arc<dyn Session>,
}

impl OwnedSession {
    pub fn duplicate_of(source: &dyn Session) -> Result<Self, SessionError> {
        if !source.is_logged_in() {
            return Err(SessionError::NotLoggedIn);
        }
        let session = source.duplicate()?;
        debug!("Duplicated session {}", session.opaque_ref());
        Ok(Self { session })
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }
}

impl Drop for OwnedSession {
    fn drop(&mut self) {
        if !self.session.is_logged_in() {
            return;
        }
        match self.session.logout() {
            Ok(()) => debug!("Logged out owned session {}", self.session.opaque_ref()),
            Err(e) => warn!(
                "Failed to log out owned session {}: {}",
                self.session.opaque_ref(),
                e
            ),
        }
    }
}

/// Given declared method names and the session's grants, report what is missing
pub trait PermissionChecker: Send + Sync {
    fn missing(&self, declared: &[String], granted: &[String]) -> Vec<String>;
}

/// Case-insensitive set difference, preserving declaration order
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPermissionChecker;

impl PermissionChecker for DefaultPermissionChecker {
    fn missing(&self, declared: &[String], granted: &[String]) -> Vec<String> {
        let mut missing: Vec<String> = Vec::new();
        for method in declared {
            let held = granted.iter().any(|g| g.eq_ignore_ascii_case(method));
            let listed = missing.iter().any(|m| m.eq_ignore_ascii_case(method));
            if !held && !listed {
                missing.push(method.clone());
            }
        }
        missing
    }
}
