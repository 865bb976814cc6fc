//! Reference event handlers.
//!
//! `AuditSink` writes one immutable audit row per event; `PolicyProjection`
//! maintains the policy read model. Both register with the handler
//! registry and are guarded by the idempotency ledger like any other
//! consumer.

pub mod audit;
pub mod projection;

pub use audit::{
    AuditRecord, AuditSink, AuditStore, FaultInjector, InMemoryAuditStore, PostgresAuditStore,
};
pub use projection::{
    InMemorySummaryStore, PolicyProjection, PolicySummary, PostgresSummaryStore, SummaryStore,
};
