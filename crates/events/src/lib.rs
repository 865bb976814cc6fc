//! Domain event contracts: the event trait, metadata, persistence
//! envelope, queue wire format, and the handler registry.
//!
//! Events are immutable, past-tense facts. They are persisted append-only
//! together with an outbox row (see `causeway-infra`), delivered through a
//! work queue, and consumed by registered handlers. The event log is
//! retained for audit, not for state reconstruction.

pub mod envelope;
pub mod event;
pub mod handler;
pub mod job;
pub mod metadata;
pub mod registry;

pub use envelope::{DeliveredEvent, NewEvent};
pub use event::DomainEvent;
pub use handler::EventHandler;
pub use job::{JobPayload, QueueJob, QUEUE_NAME};
pub use metadata::EventMetadata;
pub use registry::{HandlerRegistry, RegistryBuilder, RegistryError};
