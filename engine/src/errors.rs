//! Custom error types for the operation engine
//!
//! Each layer has its own enum so callers can match on the failure class:
//! transport failures never crash the worker, session failures fail fast
//! before a request is issued, and remote failures carry the server's
//! structured detail list.

use std::fmt;

use crate::failure::Failure;

/// Main error type for the engine
#[derive(Debug)]
pub enum EngineError {
    /// Configuration-related errors
    Config(ConfigError),

    /// Socket, TLS and framing errors
    Transport(TransportError),

    /// Session acquisition and lifecycle errors
    Session(SessionError),

    /// Remote call errors
    Rpc(RpcError),

    /// Operation contract errors
    Operation(OperationError),

    /// Other errors with context
    Other(String),
}

/// Configuration error variants
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to load configuration file
    LoadFailed { path: String, reason: String },

    /// Configuration parsing error
    ParseError { path: String, reason: String },

    /// Invalid configuration value
    InvalidValue { field: String, reason: String },
}

/// Transport error variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Hostname did not resolve to any address
    ResolveFailed { host: String, reason: String },

    /// TCP connect failed
    ConnectFailed { host: String, reason: String },

    /// TCP connect did not complete in time
    ConnectTimeout { host: String },

    /// TLS handshake failed or timed out
    HandshakeFailed { host: String, reason: String },

    /// Peer certificate was rejected by the certificate policy
    CertificateRejected { host: String },

    /// Worker has not connected yet, or connecting failed
    NotConnected,

    /// Worker was asked to stop
    Stopped,

    /// Response could not be parsed
    MalformedResponse { reason: String },

    /// Socket I/O failed
    Io { reason: String },
}

/// Session error variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No session could be acquired for the operation
    NotAvailable,

    /// Session exists but is not (or no longer) logged in
    NotLoggedIn,

    /// Login was refused by the server
    LoginFailed { reason: String },

    /// Raw request could not be delivered
    RequestFailed { reason: String },

    /// No response arrived within the response timeout
    Timeout,
}

/// Remote call error variants
#[derive(Debug, Clone)]
pub enum RpcError {
    /// The server reported a structured failure
    Failure(Failure),

    /// The request never reached the server or the response never came back
    Session(SessionError),

    /// The server answered with an empty body
    EmptyResponse { method: String },

    /// The response body was not a valid reply
    InvalidResponse { method: String, reason: String },
}

/// Operation contract errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// Cancellation was requested; not a failure
    Cancelled,

    /// The session lacks permissions the operation declared
    MissingPermissions { missing: Vec<String> },

    /// A required object or value was absent
    MissingValue { what: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Config(e) => write!(f, "Configuration error: {}", e),
            EngineError::Transport(e) => write!(f, "Transport error: {}", e),
            EngineError::Session(e) => write!(f, "Session error: {}", e),
            EngineError::Rpc(e) => write!(f, "{}", e),
            EngineError::Operation(e) => write!(f, "{}", e),
            EngineError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::LoadFailed { path, reason } => {
                write!(f, "Failed to load config from '{}': {}", path, reason)
            }
            ConfigError::ParseError { path, reason } => {
                write!(f, "Failed to parse config '{}': {}", path, reason)
            }
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "Invalid value for '{}': {}", field, reason)
            }
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ResolveFailed { host, reason } => {
                write!(f, "Could not resolve {}: {}", host, reason)
            }
            TransportError::ConnectFailed { host, reason } => {
                write!(f, "Connection to {} failed: {}", host, reason)
            }
            TransportError::ConnectTimeout { host } => {
                write!(f, "Timed out connecting to {}", host)
            }
            TransportError::HandshakeFailed { host, reason } => {
                write!(f, "TLS handshake with {} failed: {}", host, reason)
            }
            TransportError::CertificateRejected { host } => {
                write!(f, "Certificate presented by {} was rejected", host)
            }
            TransportError::NotConnected => write!(f, "Not connected"),
            TransportError::Stopped => write!(f, "Transport worker stopped"),
            TransportError::MalformedResponse { reason } => {
                write!(f, "Malformed response: {}", reason)
            }
            TransportError::Io { reason } => write!(f, "I/O error: {}", reason),
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotAvailable => write!(f, "No session available"),
            SessionError::NotLoggedIn => write!(f, "Session is not logged in"),
            SessionError::LoginFailed { reason } => write!(f, "Login failed: {}", reason),
            SessionError::RequestFailed { reason } => write!(f, "Request failed: {}", reason),
            SessionError::Timeout => write!(f, "Timed out waiting for a response"),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Failure(failure) => write!(f, "{}", failure),
            RpcError::Session(e) => write!(f, "{}", e),
            RpcError::EmptyResponse { method } => {
                write!(f, "Empty response to {}", method)
            }
            RpcError::InvalidResponse { method, reason } => {
                write!(f, "Invalid response to {}: {}", method, reason)
            }
        }
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationError::Cancelled => write!(f, "Operation cancelled"),
            OperationError::MissingPermissions { missing } => {
                write!(
                    f,
                    "You do not have the permissions required for this operation: {}",
                    missing.join(", ")
                )
            }
            OperationError::MissingValue { what } => write!(f, "Missing {}", what),
        }
    }
}

impl std::error::Error for EngineError {}
impl std::error::Error for ConfigError {}
impl std::error::Error for TransportError {}
impl std::error::Error for SessionError {}
impl std::error::Error for RpcError {}
impl std::error::Error for OperationError {}

impl RpcError {
    /// The structured failure, if the server reported one
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            RpcError::Failure(failure) => Some(failure),
            _ => None,
        }
    }
}

// Conversions from anyhow::Error for gradual migration
impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Other(err.to_string())
    }
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        EngineError::Config(err)
    }
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        EngineError::Transport(err)
    }
}

impl From<SessionError> for EngineError {
    fn from(err: SessionError) -> Self {
        EngineError::Session(err)
    }
}

impl From<RpcError> for EngineError {
    fn from(err: RpcError) -> Self {
        EngineError::Rpc(err)
    }
}

impl From<OperationError> for EngineError {
    fn from(err: OperationError) -> Self {
        EngineError::Operation(err)
    }
}

impl From<SessionError> for RpcError {
    fn from(err: SessionError) -> Self {
        RpcError::Session(err)
    }
}

impl From<Failure> for RpcError {
    fn from(failure: Failure) -> Self {
        RpcError::Failure(failure)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io {
            reason: err.to_string(),
        }
    }
}
