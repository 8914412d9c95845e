//! This module provides reusable test utilities:
//! - In-memory sessions and a scripted task API
//! - A fake control-plane API speaking JSON-RPC
//! - An in-process TLS server with a freshly minted certificate
//! - Common test data

// Allow unused code in test fixtures - each test binary uses a subset
#![allow(dead_code)]
#![allow(unused_imports)]

pub mod fake_xapi;
pub mod mock_session;
pub mod test_data;
pub mod tls_server;

// Re-export commonly used items
pub use fake_xapi::{FakeXapi, TaskOutcome};
pub use mock_session::{MockSession, Responder, ScriptedTaskApi};
pub use test_data::*;
pub use tls_server::{ResponseMode, TlsTestServer};
