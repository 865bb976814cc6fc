//! Queue worker: consumes jobs, dispatches to registered handlers, and
//! records idempotent completion.
//!
//! Per handler: the ledger is consulted first (skip on a hit), the
//! handler runs, and success is recorded with insert-if-absent semantics.
//! The job is acknowledged only when every subscribed handler succeeded or
//! was already recorded; otherwise it is nacked and the queue's retry
//! ladder takes over. Handlers run concurrently, bounded by a semaphore.

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use causeway_core::{DomainError, DomainResult};
use causeway_events::{DeliveredEvent, EventHandler, HandlerRegistry};

use crate::context;
use crate::ledger::ProcessedEventLedger;
use crate::queue::{JobQueue, LeasedJob};

/// Worker tuning. Defaults: 50 ms idle poll, 4 concurrent handlers.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: std::time::Duration,
    pub max_handler_concurrency: usize,
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_millis(50),
            max_handler_concurrency: 4,
            name: "domain-events-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_handler_concurrency(mut self, max: usize) -> Self {
        self.max_handler_concurrency = max;
        self
    }
}

/// Handle to a spawned worker task.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Request graceful shutdown; an in-flight job completes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

pub struct Worker {
    queue: Arc<dyn JobQueue>,
    registry: Arc<HandlerRegistry>,
    ledger: Arc<dyn ProcessedEventLedger>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        registry: Arc<HandlerRegistry>,
        ledger: Arc<dyn ProcessedEventLedger>,
    ) -> Self {
        Self {
            queue,
            registry,
            ledger,
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Process jobs until the queue has nothing ready. Returns the number
    /// of jobs processed. Test/operator surface; the spawned loop is the
    /// production path.
    pub async fn drain(&self) -> DomainResult<usize> {
        let mut processed = 0;
        while self.process_next().await? {
            processed += 1;
        }
        Ok(processed)
    }

    /// Lease and process at most one job.
    pub async fn process_next(&self) -> DomainResult<bool> {
        match self.queue.pop_ready().await? {
            Some(leased) => {
                self.process_job(leased).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn process_job(&self, leased: LeasedJob) -> DomainResult<()> {
        let attempt = leased.attempt;
        let is_final = leased.is_final_attempt();
        let job_id = leased.job.job_id();
        let event = leased.job.into_delivered();

        let handlers = self.registry.handlers_for(&event.event_type);
        if handlers.is_empty() {
            debug!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "no handlers subscribed, acknowledging"
            );
            self.queue.ack(job_id).await?;
            return Ok(());
        }

        // Fresh context from event metadata; nothing is inherited from the
        // spawning scope.
        let ctx = event.metadata.background_context(event.event_id);
        let outcomes = context::scope(ctx, self.dispatch(handlers, &event)).await;

        let failures: Vec<String> = outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                HandlerOutcome { result: Err(err), handler } => {
                    Some(format!("{handler}: {err}"))
                }
                _ => None,
            })
            .collect();

        if failures.is_empty() {
            self.queue.ack(job_id).await?;
            return Ok(());
        }

        if failures.len() == outcomes.len() {
            error!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                attempt,
                "every subscribed handler failed"
            );
        }

        let message = failures.join("; ");
        if is_final {
            error!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                attempts = attempt,
                error = %message,
                "event delivery failed after max retries"
            );
        } else {
            warn!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                attempt,
                error = %message,
                "handler failures, job will be retried"
            );
        }

        self.queue.nack(job_id, &message).await?;
        Ok(())
    }

    /// Invoke every handler concurrently (bounded), each under the current
    /// context, with the ledger guard around each invocation.
    async fn dispatch(
        &self,
        handlers: Vec<Arc<dyn EventHandler>>,
        event: &DeliveredEvent,
    ) -> Vec<HandlerOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_handler_concurrency.max(1)));
        let ctx = context::current();
        let mut set = JoinSet::new();
        let spawned = handlers.len();

        for handler in handlers {
            let semaphore = semaphore.clone();
            let ledger = self.ledger.clone();
            let event = event.clone();
            let ctx = ctx.clone();

            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("handler semaphore closed");
                let name = handler.name();
                let fut = invoke_guarded(handler, ledger, event);
                let result = match ctx {
                    Some(ctx) => context::scope(ctx, fut).await,
                    None => fut.await,
                };
                HandlerOutcome {
                    handler: name,
                    result,
                }
            });
        }

        let mut outcomes = Vec::with_capacity(spawned);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                // A panicking handler counts as a failure, never an abort.
                Err(err) => outcomes.push(HandlerOutcome {
                    handler: "unknown",
                    result: Err(DomainError::internal(format!("handler panicked: {err}"))),
                }),
            }
        }
        outcomes
    }

    /// Spawn the consuming loop on the current runtime.
    pub fn spawn(self: Arc<Self>) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run_loop(shutdown_rx));
        WorkerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    async fn run_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(worker = %self.config.name, handlers = self.registry.len(), "queue worker started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(err) => {
                    error!(worker = %self.config.name, error = %err, "job processing failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        info!(worker = %self.config.name, "queue worker stopped");
    }
}

#[derive(Debug)]
struct HandlerOutcome {
    handler: &'static str,
    result: DomainResult<()>,
}

async fn invoke_guarded(
    handler: Arc<dyn EventHandler>,
    ledger: Arc<dyn ProcessedEventLedger>,
    event: DeliveredEvent,
) -> DomainResult<()> {
    let name = handler.name();

    if ledger.has(event.event_id, name).await? {
        debug!(
            event_id = %event.event_id,
            handler = name,
            "handler already processed event, skipping"
        );
        return Ok(());
    }

    handler.invoke(&event).await?;
    ledger.record(event.event_id, name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::queue::in_memory::InMemoryQueue;
    use async_trait::async_trait;
    use causeway_core::{Actor, CommandMetadata, EventId, ManualClock};
    use causeway_events::{EventMetadata, JobPayload, QueueJob};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        name: &'static str,
        subs: Vec<&'static str>,
        invocations: AtomicU32,
        fail_first: u32,
    }

    impl CountingHandler {
        fn new(name: &'static str, subs: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                name,
                subs,
                invocations: AtomicU32::new(0),
                fail_first: 0,
            })
        }

        fn failing_first(name: &'static str, subs: Vec<&'static str>, n: u32) -> Arc<Self> {
            Arc::new(Self {
                name,
                subs,
                invocations: AtomicU32::new(0),
                fail_first: n,
            })
        }

        fn count(&self) -> u32 {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        fn name(&self) -> &'static str {
            self.name
        }

        fn subscribed_event_types(&self) -> &[&'static str] {
            &self.subs
        }

        async fn invoke(&self, _event: &DeliveredEvent) -> DomainResult<()> {
            let n = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
            // The worker context must be visible to handlers.
            assert!(context::current().is_some());
            if n <= self.fail_first {
                return Err(DomainError::infrastructure("downstream", "not yet"));
            }
            Ok(())
        }
    }

    fn job(event_type: &str) -> QueueJob {
        let meta = CommandMetadata::new("c1", Actor::new("u1", "u1@example.com"), Utc::now());
        QueueJob {
            event_id: EventId::new(),
            event_type: event_type.into(),
            aggregate_type: "policy".into(),
            aggregate_id: "p-1".into(),
            payload: JobPayload {
                data: json!({"status": "draft"}),
                metadata: EventMetadata::from_command(&meta, 1),
            },
        }
    }

    fn fixture(
        handlers: Vec<Arc<dyn EventHandler>>,
    ) -> (Arc<ManualClock>, Arc<InMemoryQueue>, Arc<InMemoryLedger>, Worker) {
        let clock = Arc::new(ManualClock::starting_now());
        let queue = Arc::new(InMemoryQueue::new(clock.clone()));
        let ledger = Arc::new(InMemoryLedger::new());

        let mut builder = HandlerRegistry::builder();
        for handler in handlers {
            builder = builder.register(handler).unwrap();
        }
        let registry = Arc::new(builder.build());

        let worker = Worker::new(queue.clone(), registry, ledger.clone());
        (clock, queue, ledger, worker)
    }

    #[tokio::test]
    async fn successful_job_is_acked_and_recorded() {
        let handler = CountingHandler::new("audit", vec!["policy.*"]);
        let (_clock, queue, ledger, worker) = fixture(vec![handler.clone()]);

        let job = job("policy.created");
        let event_id = job.job_id();
        queue.enqueue(job).await.unwrap();

        assert_eq!(worker.drain().await.unwrap(), 1);
        assert_eq!(handler.count(), 1);
        assert!(ledger.has(event_id, "audit").await.unwrap());
        assert_eq!(queue.acked_count(), 1);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn job_with_no_subscribers_is_acknowledged() {
        let handler = CountingHandler::new("audit", vec!["policy.*"]);
        let (_clock, queue, ledger, worker) = fixture(vec![handler.clone()]);

        queue.enqueue(job("shipment.created")).await.unwrap();
        assert_eq!(worker.drain().await.unwrap(), 1);
        assert_eq!(handler.count(), 0);
        assert!(ledger.is_empty());
        assert_eq!(queue.acked_count(), 1);
    }

    #[tokio::test]
    async fn ledger_hit_skips_reinvocation() {
        let handler = CountingHandler::new("audit", vec!["policy.*"]);
        let (_clock, queue, ledger, worker) = fixture(vec![handler.clone()]);

        let job = job("policy.created");
        ledger.record(job.job_id(), "audit").await.unwrap();
        queue.enqueue(job).await.unwrap();

        assert_eq!(worker.drain().await.unwrap(), 1);
        assert_eq!(handler.count(), 0);
        assert_eq!(queue.acked_count(), 1);
    }

    #[tokio::test]
    async fn partial_failure_nacks_without_reinvoking_the_successful_handler() {
        let flaky = CountingHandler::failing_first("flaky", vec!["policy.*"], 1);
        let steady = CountingHandler::new("steady", vec!["policy.*"]);
        let (clock, queue, ledger, worker) =
            fixture(vec![flaky.clone(), steady.clone()]);

        let job = job("policy.created");
        let event_id = job.job_id();
        queue.enqueue(job).await.unwrap();

        // First attempt: steady succeeds and is recorded, flaky fails.
        assert_eq!(worker.drain().await.unwrap(), 1);
        assert!(ledger.has(event_id, "steady").await.unwrap());
        assert!(!ledger.has(event_id, "flaky").await.unwrap());
        assert_eq!(queue.depth().await.unwrap(), 1);

        // Retry after backoff: only flaky is re-invoked.
        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(worker.drain().await.unwrap(), 1);
        assert_eq!(steady.count(), 1);
        assert_eq!(flaky.count(), 2);
        assert!(ledger.has(event_id, "flaky").await.unwrap());
        assert_eq!(queue.acked_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_leave_job_on_failed_list() {
        let broken = CountingHandler::failing_first("broken", vec!["policy.*"], u32::MAX);
        let (clock, queue, ledger, worker) = fixture(vec![broken.clone()]);

        queue.enqueue(job("policy.created")).await.unwrap();

        for _ in 0..3 {
            clock.advance(chrono::Duration::seconds(10));
            worker.drain().await.unwrap();
        }

        assert!(ledger.is_empty());
        let failed = queue.failed_jobs().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts_made, 3);
        assert!(failed[0].last_error.contains("broken"));
    }
}
