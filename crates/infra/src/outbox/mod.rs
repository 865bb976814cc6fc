//! Transactional outbox: entry model, status machine, and the store seam.
//!
//! Outbox rows are written in the same transaction as their domain events
//! (see `event_store`); the dispatcher owns every status transition after
//! that. Completed and failed rows never move back to pending without
//! operator intervention.

pub mod dispatcher;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use causeway_core::{DomainError, DomainResult, EventId};
use causeway_events::{JobPayload, NewEvent, QueueJob};

/// Default delivery attempts before a row is parked as `failed`.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Outbox delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    /// Awaiting claim by a dispatcher.
    Pending,
    /// Claimed; reclaimed after `next_retry_at` if the dispatcher dies
    /// before recording an outcome.
    Processing,
    /// Enqueued on the external queue.
    Completed,
    /// Retries exhausted; parked for operator inspection.
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Completed => "completed",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "processing" => Ok(OutboxStatus::Processing),
            "completed" => Ok(OutboxStatus::Completed),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(DomainError::internal(format!(
                "unknown outbox status: {other}"
            ))),
        }
    }
}

/// One event awaiting delivery to the external queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    /// Event payload plus full metadata; dispatch never re-reads the
    /// event row.
    pub payload: JobPayload,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    pub fn from_new_event(event: &NewEvent, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_id: event.event_id,
            event_type: event.event_type.clone(),
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            payload: JobPayload {
                data: event.payload.clone(),
                metadata: event.metadata.clone(),
            },
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
            created_at,
            processed_at: None,
            next_retry_at: None,
        }
    }

    /// The queue job for this entry, keyed by event id so the queue can
    /// coalesce duplicate submissions.
    pub fn to_job(&self) -> QueueJob {
        QueueJob {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Status counts exposed for health checks and operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxMetrics {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Storage seam for outbox rows.
///
/// Claiming must be safe across concurrent dispatcher processes: two
/// claimers never receive the same row (row-level locks with skip-locked
/// semantics in Postgres, a single mutex in memory).
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` deliverable rows, oldest first, and mark them
    /// `processing` with a reclaim deadline of now + `claim_timeout`.
    ///
    /// Deliverable: `pending` and not backing off (`next_retry_at` unset
    /// or past), or `processing` with an expired deadline (crash
    /// recovery), with retries remaining.
    async fn claim_batch(
        &self,
        limit: usize,
        claim_timeout: Duration,
    ) -> DomainResult<Vec<OutboxEntry>>;

    /// Record a successful enqueue.
    async fn mark_completed(&self, id: Uuid) -> DomainResult<()>;

    /// Record a failed enqueue and schedule the next attempt; increments
    /// the retry count and moves the row back to `pending`.
    async fn mark_retry(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> DomainResult<()>;

    /// Record a terminally failed enqueue; increments the retry count and
    /// parks the row as `failed`.
    async fn mark_failed(&self, id: Uuid, error: &str) -> DomainResult<()>;

    async fn metrics(&self) -> DomainResult<OutboxMetrics>;

    /// One entry by outbox row id (operator/test surface).
    async fn entry(&self, id: Uuid) -> DomainResult<Option<OutboxEntry>>;
}
