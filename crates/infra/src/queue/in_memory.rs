//! In-process job queue.
//!
//! Single-process backend behind the `JobQueue` seam: job-id dedup, FIFO
//! among ready jobs, visibility timeout on leases, exponential backoff on
//! failures, and a failed list once attempts are exhausted. State lives in
//! one mutex; nothing survives a restart, which is exactly why the outbox
//! exists upstream of it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, warn};

use causeway_core::{Clock, EventId};
use causeway_events::{QueueJob, QUEUE_NAME};

use crate::retry::RetryPolicy;

use super::{EnqueueOutcome, FailedJob, JobQueue, LeasedJob, QueueError};

#[derive(Debug, Clone)]
struct QueuedJob {
    job: QueueJob,
    attempts_made: u32,
    /// FIFO tie-break; wall time alone cannot order jobs enqueued in the
    /// same instant.
    seq: u64,
    available_at: DateTime<Utc>,
    leased_until: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<EventId, QueuedJob>,
    next_seq: u64,
    /// Every job id ever submitted; the dedup key outlives completion so a
    /// reclaimed outbox row cannot double-enqueue.
    seen: HashSet<EventId>,
    failed: Vec<FailedJob>,
    acked: u64,
    /// Test affordance: when set, enqueues are rejected with this message.
    reject_with: Option<String>,
}

pub struct InMemoryQueue {
    name: String,
    retry: RetryPolicy,
    visibility_timeout: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl InMemoryQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            name: QUEUE_NAME.to_string(),
            retry: RetryPolicy::queue_default(),
            visibility_timeout: Duration::from_secs(30),
            clock,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Jobs acknowledged so far.
    pub fn acked_count(&self) -> u64 {
        self.state.lock().unwrap().acked
    }

    /// Make every subsequent enqueue fail (test affordance for the outbox
    /// retry ladder).
    pub fn reject_enqueues(&self, message: impl Into<String>) {
        self.state.lock().unwrap().reject_with = Some(message.into());
    }

    /// Undo `reject_enqueues`.
    pub fn accept_enqueues(&self) {
        self.state.lock().unwrap().reject_with = None;
    }

    fn chrono_visibility(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.visibility_timeout).unwrap_or_else(|_| ChronoDuration::seconds(30))
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, job: QueueJob) -> Result<EnqueueOutcome, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();

        if let Some(message) = &state.reject_with {
            return Err(QueueError::Unavailable {
                queue: self.name.clone(),
                message: message.clone(),
            });
        }

        let job_id = job.job_id();
        if !state.seen.insert(job_id) {
            debug!(job_id = %job_id, "duplicate job id, coalescing");
            return Ok(EnqueueOutcome::Coalesced);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(
            job_id,
            QueuedJob {
                job,
                attempts_made: 0,
                seq,
                available_at: now,
                leased_until: None,
            },
        );
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn pop_ready(&self) -> Result<Option<LeasedJob>, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();

        let candidate = state
            .jobs
            .values()
            .filter(|j| {
                j.available_at <= now && j.leased_until.is_none_or(|until| until < now)
            })
            .min_by_key(|j| (j.available_at, j.seq))
            .map(|j| j.job.job_id());

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        let deadline = now + self.chrono_visibility();
        let queued = state.jobs.get_mut(&job_id).expect("candidate vanished");
        queued.leased_until = Some(deadline);

        Ok(Some(LeasedJob {
            job: queued.job.clone(),
            attempt: queued.attempts_made + 1,
            max_attempts: self.retry.max_attempts,
            deadline,
        }))
    }

    async fn ack(&self, job_id: EventId) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        match state.jobs.remove(&job_id) {
            Some(_) => {
                state.acked += 1;
                Ok(())
            }
            None => Err(QueueError::UnknownJob(job_id)),
        }
    }

    async fn nack(&self, job_id: EventId, error: &str) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();

        let queued = state
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::UnknownJob(job_id))?;
        if queued.leased_until.is_none() {
            return Err(QueueError::NotLeased(job_id));
        }

        queued.attempts_made += 1;
        queued.leased_until = None;

        if queued.attempts_made >= self.retry.max_attempts {
            let queued = state.jobs.remove(&job_id).expect("job vanished");
            warn!(
                job_id = %job_id,
                attempts = queued.attempts_made,
                error,
                "job exhausted queue attempts"
            );
            state.failed.push(FailedJob {
                job: queued.job,
                attempts_made: queued.attempts_made,
                last_error: error.to_string(),
                failed_at: now,
            });
        } else {
            let delay = self.retry.backoff_after(queued.attempts_made - 1);
            queued.available_at =
                now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
        }

        Ok(())
    }

    async fn failed_jobs(&self) -> Result<Vec<FailedJob>, QueueError> {
        Ok(self.state.lock().unwrap().failed.clone())
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        Ok(self.state.lock().unwrap().jobs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_core::{Actor, CommandMetadata, ManualClock};
    use causeway_events::{EventMetadata, JobPayload};
    use serde_json::json;

    fn job() -> QueueJob {
        let meta = CommandMetadata::new("c1", Actor::new("u1", "u1@example.com"), Utc::now());
        QueueJob {
            event_id: EventId::new(),
            event_type: "action.created".into(),
            aggregate_type: "action".into(),
            aggregate_id: "a-1".into(),
            payload: JobPayload {
                data: json!({}),
                metadata: EventMetadata::from_command(&meta, 1),
            },
        }
    }

    fn queue() -> (Arc<ManualClock>, InMemoryQueue) {
        let clock = Arc::new(ManualClock::starting_now());
        let queue = InMemoryQueue::new(clock.clone());
        (clock, queue)
    }

    #[tokio::test]
    async fn duplicate_job_ids_coalesce() {
        let (_clock, queue) = queue();
        let job = job();

        assert_eq!(
            queue.enqueue(job.clone()).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(
            queue.enqueue(job.clone()).await.unwrap(),
            EnqueueOutcome::Coalesced
        );
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dedup_outlives_completion() {
        let (_clock, queue) = queue();
        let job = job();
        queue.enqueue(job.clone()).await.unwrap();

        let leased = queue.pop_ready().await.unwrap().unwrap();
        queue.ack(leased.job.job_id()).await.unwrap();

        assert_eq!(
            queue.enqueue(job).await.unwrap(),
            EnqueueOutcome::Coalesced
        );
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn leased_jobs_are_invisible_until_deadline() {
        let (clock, queue) = queue();
        queue.enqueue(job()).await.unwrap();

        let leased = queue.pop_ready().await.unwrap().unwrap();
        assert_eq!(leased.attempt, 1);
        assert!(queue.pop_ready().await.unwrap().is_none());

        // Expired lease: redelivered without counting an attempt.
        clock.advance(ChronoDuration::seconds(31));
        let redelivered = queue.pop_ready().await.unwrap().unwrap();
        assert_eq!(redelivered.attempt, 1);
        assert_eq!(redelivered.job.job_id(), leased.job.job_id());
    }

    #[tokio::test]
    async fn nack_schedules_exponential_backoff() {
        let (clock, queue) = queue();
        queue.enqueue(job()).await.unwrap();

        let leased = queue.pop_ready().await.unwrap().unwrap();
        let job_id = leased.job.job_id();
        queue.nack(job_id, "boom").await.unwrap();

        // Backoff after first failure is 1 s.
        assert!(queue.pop_ready().await.unwrap().is_none());
        clock.advance(ChronoDuration::seconds(1));
        let second = queue.pop_ready().await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        queue.nack(job_id, "boom").await.unwrap();

        // Then 2 s.
        clock.advance(ChronoDuration::seconds(1));
        assert!(queue.pop_ready().await.unwrap().is_none());
        clock.advance(ChronoDuration::seconds(1));
        let third = queue.pop_ready().await.unwrap().unwrap();
        assert_eq!(third.attempt, 3);
        assert!(third.is_final_attempt());
    }

    #[tokio::test]
    async fn exhausted_jobs_move_to_failed_list() {
        let (clock, queue) = queue();
        queue.enqueue(job()).await.unwrap();

        for _ in 0..3 {
            clock.advance(ChronoDuration::seconds(10));
            let leased = queue.pop_ready().await.unwrap().unwrap();
            queue.nack(leased.job.job_id(), "persistent failure").await.unwrap();
        }

        assert_eq!(queue.depth().await.unwrap(), 0);
        let failed = queue.failed_jobs().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts_made, 3);
        assert_eq!(failed[0].last_error, "persistent failure");
    }

    #[tokio::test]
    async fn ack_of_unknown_job_is_an_error() {
        let (_clock, queue) = queue();
        let err = queue.ack(EventId::new()).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownJob(_)));
    }
}
