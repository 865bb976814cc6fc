//! Infrastructure: storage backends, the transactional write path, the
//! outbox dispatcher, the job queue, the queue worker, the idempotency
//! ledger, the command service, and the reference handlers.
//!
//! Dataflow: caller -> `CommandService` -> aggregate -> repository (state +
//! events + outbox in one transaction) -> `Dispatcher` (outbox -> queue) ->
//! `Worker` (queue -> handlers, recorded in the ledger).
//!
//! Every seam is a trait with a Postgres implementation and an in-memory
//! implementation; the in-memory backend exists for tests and single-node
//! development, not as a durability option.

pub mod commands;
pub mod context;
pub mod event_store;
pub mod handlers;
pub mod health;
pub mod ledger;
pub mod memory;
pub mod outbox;
pub mod queue;
pub mod repository;
pub mod retry;
pub mod worker;

pub use commands::{Command, CommandReceipt, CommandRequest, CommandService, CommandServiceConfig};
pub use ledger::{InMemoryLedger, ProcessedEventLedger};
pub use memory::InMemoryBackend;
pub use outbox::dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle, TickSummary};
pub use outbox::{OutboxEntry, OutboxMetrics, OutboxStatus, OutboxStore};
pub use queue::in_memory::InMemoryQueue;
pub use queue::{EnqueueOutcome, FailedJob, JobQueue, LeasedJob, QueueError};
pub use retry::RetryPolicy;
pub use worker::{Worker, WorkerConfig, WorkerHandle};
