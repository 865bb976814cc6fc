//! Queue wire format.
//!
//! One queue carries all domain events. The job id is the event id, which
//! lets the queue coalesce duplicate submissions of the same event (e.g.
//! after an outbox reclaim).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use causeway_core::EventId;

use crate::envelope::{DeliveredEvent, NewEvent};
use crate::metadata::EventMetadata;

/// Name of the single outbound queue.
pub const QUEUE_NAME: &str = "domain-events";

/// Job body: the event payload plus its full metadata, so the consumer
/// can rebuild the event without touching the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub data: JsonValue,
    pub metadata: EventMetadata,
}

/// A job on the `domain-events` queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: JobPayload,
}

impl QueueJob {
    /// Dedup/coalescing key.
    pub fn job_id(&self) -> EventId {
        self.event_id
    }

    pub fn from_new_event(event: &NewEvent) -> Self {
        Self {
            event_id: event.event_id,
            event_type: event.event_type.clone(),
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            payload: JobPayload {
                data: event.payload.clone(),
                metadata: event.metadata.clone(),
            },
        }
    }

    /// Reconstruct the in-memory event a worker hands to handlers.
    pub fn into_delivered(self) -> DeliveredEvent {
        DeliveredEvent {
            event_id: self.event_id,
            event_type: self.event_type,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            payload: self.payload.data,
            metadata: self.payload.metadata,
        }
    }
}
