//! Outbox dispatcher: drains pending outbox rows onto the job queue.
//!
//! A single polling task claims batches, enqueues each claimed row, and
//! records the outcome. Re-entrancy against itself is guarded by an atomic
//! flag; across processes the store's claim semantics (skip-locked rows)
//! keep claims disjoint. Delivery is attempted in creation order per
//! aggregate on first attempt; after retries a failed event can land
//! behind a later success, so handlers needing strict per-aggregate order
//! must re-sequence themselves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use causeway_core::{Clock, DomainResult, SystemClock};

use crate::queue::JobQueue;
use crate::retry::RetryPolicy;

use super::{OutboxMetrics, OutboxStore};

/// Dispatcher tuning. Defaults: poll every 1 s, claim 100 rows per tick,
/// 30 s reclaim window, outbox retry ladder (5 attempts, 1 s base, 5 min
/// cap).
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// How long a claimed row stays invisible before a crashed dispatcher's
    /// claim is reclaimable.
    pub claim_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            claim_timeout: Duration::from_secs(30),
            retry: RetryPolicy::outbox_default(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Outcome of one dispatcher tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub claimed: usize,
    pub enqueued: usize,
    pub retried: usize,
    pub failed: usize,
    /// True when the tick was skipped because another tick was in flight.
    pub skipped: bool,
}

/// Handle to a spawned dispatcher task.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Request graceful shutdown: no new claim cycles; the in-flight batch
    /// completes before the task exits.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

pub struct Dispatcher {
    store: Arc<dyn OutboxStore>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    tick_in_flight: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        queue: Arc<dyn JobQueue>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            queue,
            clock: Arc::new(SystemClock),
            config,
            tick_in_flight: AtomicBool::new(false),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run exactly one claim/enqueue cycle. Exposed for operators and
    /// tests; the polling loop calls this on every tick.
    pub async fn trigger_once(&self) -> DomainResult<TickSummary> {
        if self.tick_in_flight.swap(true, Ordering::SeqCst) {
            debug!("dispatcher tick already in flight, skipping");
            return Ok(TickSummary {
                skipped: true,
                ..TickSummary::default()
            });
        }

        let result = self.run_tick().await;
        self.tick_in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn run_tick(&self) -> DomainResult<TickSummary> {
        let entries = self
            .store
            .claim_batch(self.config.batch_size, self.config.claim_timeout)
            .await?;

        let mut summary = TickSummary {
            claimed: entries.len(),
            ..TickSummary::default()
        };

        for entry in entries {
            let job = entry.to_job();
            match self.queue.enqueue(job).await {
                Ok(outcome) => {
                    debug!(
                        event_id = %entry.event_id,
                        event_type = %entry.event_type,
                        outcome = ?outcome,
                        "outbox entry enqueued"
                    );
                    self.store.mark_completed(entry.id).await?;
                    summary.enqueued += 1;
                }
                Err(err) => {
                    let attempts = entry.retry_count + 1;
                    let message = err.to_string();
                    if attempts >= entry.max_retries {
                        error!(
                            event_id = %entry.event_id,
                            event_type = %entry.event_type,
                            attempts,
                            error = %message,
                            "outbox entry failed after max retries"
                        );
                        self.store.mark_failed(entry.id, &message).await?;
                        summary.failed += 1;
                    } else {
                        let delay = self.config.retry.backoff_after(attempts);
                        let next_retry_at = self.clock.now()
                            + ChronoDuration::from_std(delay)
                                .unwrap_or_else(|_| ChronoDuration::zero());
                        warn!(
                            event_id = %entry.event_id,
                            event_type = %entry.event_type,
                            attempts,
                            next_retry_at = %next_retry_at,
                            error = %message,
                            "outbox enqueue failed, scheduling retry"
                        );
                        self.store
                            .mark_retry(entry.id, &message, next_retry_at)
                            .await?;
                        summary.retried += 1;
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Outbox status counts (operator surface).
    pub async fn metrics(&self) -> DomainResult<OutboxMetrics> {
        self.store.metrics().await
    }

    /// Spawn the polling loop on the current runtime.
    pub fn spawn(self: Arc<Self>) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run_loop(shutdown_rx));
        DispatcherHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    async fn run_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "outbox dispatcher started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = interval.tick() => {}
            }
            if *shutdown_rx.borrow() {
                break;
            }
            // Awaited outside the select so shutdown waits for the
            // in-flight batch.
            if let Err(err) = self.trigger_once().await {
                error!(error = %err, "outbox dispatcher tick failed");
            }
        }

        info!("outbox dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use crate::queue::in_memory::InMemoryQueue;
    use causeway_core::{Actor, CommandMetadata, ManualClock};
    use causeway_events::{EventMetadata, NewEvent};
    use chrono::Utc;
    use serde_json::json;

    fn new_event(aggregate_id: &str) -> NewEvent {
        let meta = CommandMetadata::new("c1", Actor::new("u1", "u1@example.com"), Utc::now());
        NewEvent {
            event_id: causeway_core::EventId::new(),
            aggregate_type: "policy".into(),
            aggregate_id: aggregate_id.into(),
            event_type: "policy.created".into(),
            schema_version: 1,
            payload: json!({"name": "P", "status": "draft"}),
            metadata: EventMetadata::from_command(&meta, 1),
            occurred_at: meta.timestamp,
        }
    }

    fn fixture() -> (Arc<ManualClock>, Arc<InMemoryBackend>, Arc<InMemoryQueue>, Dispatcher) {
        let clock = Arc::new(ManualClock::starting_now());
        let backend = Arc::new(InMemoryBackend::new(clock.clone()));
        let queue = Arc::new(InMemoryQueue::new(clock.clone()));
        let dispatcher = Dispatcher::new(
            backend.clone(),
            queue.clone(),
            DispatcherConfig::default(),
        )
        .with_clock(clock.clone());
        (clock, backend, queue, dispatcher)
    }

    #[tokio::test]
    async fn tick_moves_pending_entries_to_completed() {
        let (_clock, backend, queue, dispatcher) = fixture();
        backend.seed_events(&[new_event("p-1"), new_event("p-2")]);

        let summary = dispatcher.trigger_once().await.unwrap();
        assert_eq!(summary.claimed, 2);
        assert_eq!(summary.enqueued, 2);

        let metrics = dispatcher.metrics().await.unwrap();
        assert_eq!(metrics.completed, 2);
        assert_eq!(metrics.pending, 0);
        assert_eq!(queue.depth().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn completed_entries_are_not_reclaimed() {
        let (_clock, backend, _queue, dispatcher) = fixture();
        backend.seed_events(&[new_event("p-1")]);

        dispatcher.trigger_once().await.unwrap();
        let summary = dispatcher.trigger_once().await.unwrap();
        assert_eq!(summary.claimed, 0);
    }

    #[tokio::test]
    async fn enqueue_failure_schedules_backoff_then_fails_terminally() {
        let (clock, backend, queue, dispatcher) = fixture();
        backend.seed_events(&[new_event("p-1")]);
        backend.set_outbox_max_retries(2);
        queue.reject_enqueues("queue down");

        let summary = dispatcher.trigger_once().await.unwrap();
        assert_eq!(summary.retried, 1);
        let metrics = dispatcher.metrics().await.unwrap();
        assert_eq!(metrics.pending, 1);

        // Not yet due.
        let summary = dispatcher.trigger_once().await.unwrap();
        assert_eq!(summary.claimed, 0);

        // Second and final attempt fails terminally.
        clock.advance(chrono::Duration::seconds(10));
        let summary = dispatcher.trigger_once().await.unwrap();
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.failed, 1);

        let metrics = dispatcher.metrics().await.unwrap();
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.pending, 0);

        // Failed rows stay failed.
        clock.advance(chrono::Duration::seconds(600));
        let summary = dispatcher.trigger_once().await.unwrap();
        assert_eq!(summary.claimed, 0);
    }

    #[tokio::test]
    async fn concurrent_claims_are_disjoint() {
        let (_clock, backend, _queue, _dispatcher) = fixture();
        backend.seed_events(&[new_event("p-1"), new_event("p-2"), new_event("p-3")]);

        let first = backend
            .claim_batch(2, Duration::from_secs(30))
            .await
            .unwrap();
        let second = backend
            .claim_batch(2, Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        for entry in &second {
            assert!(first.iter().all(|f| f.id != entry.id));
        }
    }

    #[tokio::test]
    async fn crashed_claim_is_reclaimed_after_timeout() {
        let (clock, backend, queue, dispatcher) = fixture();
        backend.seed_events(&[new_event("p-1")]);

        // Simulate claim-then-crash: rows are processing, nothing enqueued.
        let claimed = backend
            .claim_batch(10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        // Within the claim window nothing is deliverable.
        let summary = dispatcher.trigger_once().await.unwrap();
        assert_eq!(summary.claimed, 0);

        clock.advance(chrono::Duration::seconds(31));
        let summary = dispatcher.trigger_once().await.unwrap();
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.enqueued, 1);
        assert_eq!(queue.depth().await.unwrap(), 1);
    }
}
