//! Operations: long-running remote actions as cancellable units of work
//!
//! # Lifecycle
//!
//! ```text
//! NotStarted ──start──▶ Running ──▶ Completed
//!                          ├──────▶ Cancelled   (explicit cancel, or task cancelled remotely)
//!                          └──────▶ Failed      (error while Running)
//! ```
//!
//! Terminal states are final. State, progress, description and error are
//! guarded by the operation's own lock; every change is published to
//! subscribers and the registry after that lock is released.
//!
//! # Usage
//!
//! ```ignore
//! let op = Operation::builder("Reboot host", |ctx: &OperationContext<'_>| {
//!     let task = ctx.call_async("host.reboot", vec![json!(host_ref)])?;
//!     ctx.poll_task(&task, 0, 100)
//! })
//! .duplicate_session(session)
//! .required_permissions(["host.reboot"])
//! .build();
//!
//! executor.start(&op);
//! ```

pub mod applies_to;
pub mod context;
pub mod defaults;
pub mod lifecycle;
pub mod poller;
pub mod state;

pub use applies_to::{AppliesTo, ObjectRef};
pub use context::{OperationContext, OperationSteps};
pub use defaults::OperationDefaults;
pub use lifecycle::{Operation, OperationBuilder, SessionSource};
pub use poller::interpolate;
pub use state::{OperationEvent, OperationSnapshot, OperationState};
