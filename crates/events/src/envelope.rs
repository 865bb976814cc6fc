//! Persistence and delivery envelopes.
//!
//! `NewEvent` is the unit of persistence: what the write path inserts into
//! the event log and denormalizes into the outbox. `DeliveredEvent` is the
//! worker-side reconstruction from a queue job. Both carry the full
//! metadata so neither end needs to re-read the event row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use causeway_core::{DomainError, DomainResult, EventId};

use crate::event::DomainEvent;
use crate::metadata::EventMetadata;

/// An event ready to be appended to the log (not yet assigned an
/// occurred-at by the store).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_id: EventId,
    /// Short aggregate stream name (e.g. `"policy"`).
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub schema_version: u32,
    pub payload: JsonValue,
    pub metadata: EventMetadata,
    /// Producer time; persistence assigns its own occurred-at column
    /// alongside this.
    pub occurred_at: DateTime<Utc>,
}

impl NewEvent {
    /// Build a persistence envelope from a typed domain event.
    ///
    /// Serialization failure is a programming error in the event type, but
    /// it is surfaced as a value so the write path can abort cleanly.
    pub fn from_typed<E>(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event: &E,
        metadata: EventMetadata,
    ) -> DomainResult<Self>
    where
        E: DomainEvent + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            DomainError::internal(format!("event payload serialization failed: {e}"))
        })?;

        Ok(Self {
            event_id: EventId::new(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event.event_type().to_string(),
            schema_version: event.schema_version(),
            payload,
            metadata,
            occurred_at: event.occurred_at(),
        })
    }

    /// Serialized payload size in bytes, used to enforce the configurable
    /// event payload cap before anything hits the queue.
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec(&self.payload).map(|v| v.len()).unwrap_or(0)
    }
}

/// An event as seen by handlers: reconstructed from a queue job, never
/// from the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: JsonValue,
    pub metadata: EventMetadata,
}
