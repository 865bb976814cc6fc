//! Event log persistence.
//!
//! Domain events are append-only: inserted in the same transaction as the
//! entity state and outbox rows, never updated, never deleted by the core.
//! The log is retained for audit; nothing reconstructs state from it.

pub mod postgres;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use causeway_core::EventId;
use causeway_events::{EventMetadata, NewEvent};

pub use postgres::{map_sqlx_error, persist_events, with_transaction, PostgresEventLog};

/// A persisted domain event, as read back from the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub event_id: EventId,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub schema_version: u32,
    pub payload: JsonValue,
    pub metadata: EventMetadata,
    /// Assigned at persistence time.
    pub occurred_at: DateTime<Utc>,
}

impl EventLogEntry {
    pub fn from_new_event(event: &NewEvent, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_id: event.event_id,
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            event_type: event.event_type.clone(),
            schema_version: event.schema_version,
            payload: event.payload.clone(),
            metadata: event.metadata.clone(),
            occurred_at,
        }
    }
}
