//! Job queue seam.
//!
//! One queue (`domain-events`) carries every domain event. Jobs are keyed
//! by event id so duplicate submissions coalesce; delivery to handlers is
//! at-least-once, retried per the queue's own ladder (3 attempts,
//! exponential backoff, 1 s base), independent of outbox retries.

pub mod in_memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use causeway_core::{DomainError, EventId};
use causeway_events::QueueJob;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue {queue} unavailable: {message}")]
    Unavailable { queue: String, message: String },

    #[error("job {0} is not currently leased")]
    NotLeased(EventId),

    #[error("unknown job {0}")]
    UnknownJob(EventId),
}

impl From<QueueError> for DomainError {
    fn from(err: QueueError) -> Self {
        DomainError::infrastructure("queue", err.to_string())
    }
}

/// Result of submitting a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A job with the same id was already known; the submission was
    /// absorbed.
    Coalesced,
}

/// A job leased to a consumer, invisible to other consumers until the
/// deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedJob {
    pub job: QueueJob,
    /// 1-indexed attempt number for this delivery.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Visibility deadline; handler invocations inherit it.
    pub deadline: DateTime<Utc>,
}

impl LeasedJob {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A job that exhausted its attempts, kept for operator inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedJob {
    pub job: QueueJob,
    pub attempts_made: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

/// Queue contract shared by the dispatcher (producer) and worker
/// (consumer). Implementations are assumed thread-safe and shared.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn queue_name(&self) -> &str;

    /// Submit a job; a duplicate job id coalesces instead of enqueueing
    /// twice.
    async fn enqueue(&self, job: QueueJob) -> Result<EnqueueOutcome, QueueError>;

    /// Lease the next ready job, if any.
    async fn pop_ready(&self) -> Result<Option<LeasedJob>, QueueError>;

    /// Acknowledge successful processing; the job is removed.
    async fn ack(&self, job_id: EventId) -> Result<(), QueueError>;

    /// Report failed processing; the job is rescheduled with backoff or
    /// moved to the failed list once attempts are exhausted.
    async fn nack(&self, job_id: EventId, error: &str) -> Result<(), QueueError>;

    /// Jobs that exhausted their attempts.
    async fn failed_jobs(&self) -> Result<Vec<FailedJob>, QueueError>;

    /// Number of jobs waiting or leased (excludes failed).
    async fn depth(&self) -> Result<usize, QueueError>;
}
