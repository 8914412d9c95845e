pub mod config;
pub mod constants;
pub mod errors;
pub mod executor;
pub mod failure;
pub mod operation;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use config::{Config, ConfigManager, ConnectionConfig, TransportConfig};
pub use errors::{EngineError, OperationError, RpcError, SessionError, TransportError};
pub use executor::OperationExecutor;
pub use failure::Failure;
pub use operation::{
    Operation, OperationBuilder, OperationContext, OperationDefaults, OperationEvent,
    OperationSnapshot, OperationState, OperationSteps,
};
pub use registry::{HistoryRecord, OperationRegistry, RegistryEvent};
pub use rpc::{RpcSession, TaskApi};
pub use session::{OwnedSession, Session};
pub use transport::{TlsConnector, TransportWorker};
