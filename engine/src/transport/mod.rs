//! Transport layer: one worker thread per connection
//!
//! # Architecture
//!
//! ```text
//! caller threads ──queue_request──▶ pending queue ──▶ worker thread ──▶ TLS socket
//!        ▲                                                │
//!        └──────wait_for_response(id)◀── completed map ◀──┘
//! ```
//!
//! The socket belongs to the worker thread alone. The two queues are the
//! only shared state and sit behind one lock and one condition variable.

pub mod framing;
pub mod tls;
pub mod worker;

pub use tls::{
    CertificatePolicy, CertificateValidator, ConnectPhase, Connector, PinnedCertificates, Stream,
    TlsConnector,
};
pub use worker::{ConnectionState, RequestId, TransportEvent, TransportWorker};
