//! Event metadata: the caller context snapshot carried by every event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use causeway_core::{Actor, CommandMetadata, RequestContext};

/// Metadata persisted with every domain event and embedded in the outbox
/// payload, so that dispatch and background handlers never need to re-read
/// the event row or inherit ambient state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub causation_id: Option<String>,
    pub actor: Actor,
    /// When the producer constructed the event.
    pub produced_at: DateTime<Utc>,
    pub schema_version: u32,
    /// Test-fixture flag consumed by controlled-fault handlers.
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub simulate_failure: bool,
}

impl EventMetadata {
    /// Snapshot the caller metadata of the command that produced the event.
    pub fn from_command(meta: &CommandMetadata, schema_version: u32) -> Self {
        Self {
            correlation_id: meta.correlation_id.clone(),
            causation_id: meta.causation_id.clone(),
            actor: meta.actor.clone(),
            produced_at: meta.timestamp,
            schema_version,
            simulate_failure: meta.simulate_failure,
        }
    }

    /// Context for background processing of the event this metadata rides
    /// on: correlation preserved, causation becomes the event id, actor is
    /// copied (or the `system` sentinel when absent by construction).
    pub fn background_context(&self, event_id: impl core::fmt::Display) -> RequestContext {
        RequestContext {
            correlation_id: self.correlation_id.clone(),
            causation_id: Some(event_id.to_string()),
            actor: self.actor.clone(),
        }
    }
}
