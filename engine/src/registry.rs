//! Operation registry
//!
//! Process-wide catalogue of every operation started in the process. Keeps a
//! history record per operation that outlives the operation itself, and
//! re-broadcasts every change to listeners such as a history view.
//!
//! # Key Features
//!
//! - **History**: records survive the operation until explicitly purged
//! - **Change feed**: `Added`, `Updated` and `Removed` events
//! - **Consistent snapshot**: one lock guards the collection
//! - **Restart sweep**: strips correlation tags from tasks still in flight
//!
//! # Usage
//!
//! ```ignore
//! let registry = OperationRegistry::global();
//! let mut events = registry.subscribe();
//!
//! // Operations built without an explicit registry land here
//! let op = Operation::builder("Enable HA", steps).build();
//!
//! // Before reconnecting
//! registry.prepare_for_restart();
//! ```

use std::sync::{Arc, OnceLock, Weak};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::constants::operations;
use crate::operation::{Operation, OperationSnapshot, OperationState};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub error: Option<String>,
    pub percent_complete: i32,
    pub state: OperationState,
    pub applies_to: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    revision: u64,
}

impl HistoryRecord {
    fn from_snapshot(snapshot: &OperationSnapshot, registered_at: DateTime<Utc>) -> Self {
        Self {
            id: snapshot.id,
            title: snapshot.title.clone(),
            description: snapshot.description.clone(),
            error: snapshot.error.clone(),
            percent_complete: snapshot.percent_complete,
            state: snapshot.state,
            applies_to: snapshot.applies_to.clone(),
            registered_at,
            started_at: snapshot.started_at,
            finished_at: snapshot.finished_at,
            revision: snapshot.revision,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Added(HistoryRecord),
    Updated(HistoryRecord),
    Removed(Uuid),
}

struct Entry {
    record: HistoryRecord,
    operation: Weak<Operation>,
}

pub struct OperationRegistry {
    entries: RwLock<Vec<Entry>>,
    events: broadcast::Sender<RegistryEvent>,
}

static GLOBAL: OnceLock<Arc<OperationRegistry>> = OnceLock::new();

impl OperationRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(operations::EVENT_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Process-wide default, created on first use
    pub fn global() -> Arc<OperationRegistry> {
        GLOBAL.get_or_init(|| Arc::new(OperationRegistry::new())).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Start tracking `operation`; adding the same operation twice is a no-op
    #[instrument(skip_all, fields(operation = %operation.title()))]
    pub fn add(&self, operation: &Arc<Operation>) {
        let record = {
            let mut entries = self.entries.write();
            if entries.iter().any(|e| e.record.id == operation.id()) {
                return;
            }
            let record = HistoryRecord::from_snapshot(&operation.snapshot(), Utc::now());
            entries.push(Entry {
                record: record.clone(),
                operation: Arc::downgrade(operation),
            });
            record
        };
        debug!("Registered operation {} ({})", record.title, record.id);
        self.publish(RegistryEvent::Added(record));
    }

    /// Mirror a change; copies older than the stored one are ignored
    pub fn update(&self, snapshot: &OperationSnapshot) {
        let record = {
            let mut entries = self.entries.write();
            let Some(entry) = entries.iter_mut().find(|e| e.record.id == snapshot.id) else {
                return;
            };
            if snapshot.revision < entry.record.revision {
                return;
            }
            entry.record = HistoryRecord::from_snapshot(snapshot, entry.record.registered_at);
            entry.record.clone()
        };
        self.publish(RegistryEvent::Updated(record));
    }

    pub fn remove(&self, id: Uuid) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|e| e.record.id != id);
            entries.len() != before
        };
        if removed {
            self.publish(RegistryEvent::Removed(id));
        }
        removed
    }

    pub fn record(&self, id: Uuid) -> Option<HistoryRecord> {
        self.entries
            .read()
            .iter()
            .find(|e| e.record.id == id)
            .map(|e| e.record.clone())
    }

    /// All records in registration order
    pub fn records(&self) -> Vec<HistoryRecord> {
        self.entries.read().iter().map(|e| e.record.clone()).collect()
    }

    /// Live operations that have not reached a terminal state
    pub fn in_progress(&self) -> Vec<Arc<Operation>> {
        self.entries
            .read()
            .iter()
            .filter(|e| !e.record.is_finished())
            .filter_map(|e| e.operation.upgrade())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop the history of every finished operation
    pub fn purge_finished(&self) -> usize {
        let purged: Vec<Uuid> = {
            let mut entries = self.entries.write();
            let purged = entries
                .iter()
                .filter(|e| e.record.is_finished())
                .map(|e| e.record.id)
                .collect();
            entries.retain(|e| !e.record.is_finished());
            purged
        };

        for id in &purged {
            self.publish(RegistryEvent::Removed(*id));
        }
        if !purged.is_empty() {
            info!("Purged {} finished operations from history", purged.len());
        }
        purged.len()
    }

    /// Strip correlation tags from every running operation's task ahead of a reconnect
    #[instrument(skip(self))]
    pub fn prepare_for_restart(&self) -> usize {
        let running: Vec<Arc<Operation>> = self
            .in_progress()
            .into_iter()
            .filter(|op| op.state() == OperationState::Running)
            .collect();

        for operation in &running {
            operation.prepare_for_restart();
        }
        info!("Prepared {} running operations for restart", running.len());
        running.len()
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
