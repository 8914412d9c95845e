//! Central repository for timeouts, intervals and wire constants
//!
//! Organised by concern so that the transport, the poller and the
//! configuration defaults share a single source of truth.

use std::time::Duration;

/// Transport worker timeouts
pub mod transport {
    use super::Duration;

    /// Bounded TCP connect
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

    /// Bounded TLS handshake
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

    /// Socket read timeout, also the idle window when a response has no Content-Length
    pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

    /// Socket write timeout
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default bound for a caller blocked in `wait_for_response`
    pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

    /// How long the owner waits for the worker thread to exit after a stop request
    pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

    /// How long an announced response waits to be taken before it is dropped
    pub const UNCLAIMED_RESPONSE_TIMEOUT: Duration = Duration::from_secs(300);

    /// Idle wait between queue drains when nothing is pending
    pub const IDLE_WAIT: Duration = Duration::from_millis(50);

    /// Default HTTPS port of the control-plane API
    pub const DEFAULT_PORT: u16 = 443;
}

/// HTTP framing
pub mod http {
    /// Path for payloads that look like XML-RPC
    pub const XML_RPC_PATH: &str = "/";

    /// Path for payloads that look like JSON-RPC
    pub const JSON_RPC_PATH: &str = "/jsonrpc";

    pub const XML_CONTENT_TYPE: &str = "text/xml";

    pub const JSON_CONTENT_TYPE: &str = "application/json";

    pub const USER_AGENT: &str = concat!("engine/", env!("CARGO_PKG_VERSION"));

    /// Upper bound on a response header block
    pub const MAX_HEADER_BYTES: usize = 64 * 1024;
}

/// Remote task polling
pub mod polling {
    use super::Duration;

    /// Sleep between two task status fetches
    pub const POLL_INTERVAL: Duration = Duration::from_millis(900);

    /// Key used in the task's other_config map to correlate it with a local operation
    pub const CORRELATION_KEY: &str = "engine_operation_uuid";
}

/// Operation defaults
pub mod operations {
    /// Capacity of each broadcast channel (operation events, registry events)
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;

    /// Worker threads for the binary's runtime
    pub const DEFAULT_WORKER_THREADS: usize = 4;
}
