//! Idempotency ledger: witnesses that a handler completed for an event.
//!
//! A uniqueness constraint on `(event id, handler name)` is the sole
//! correctness mechanism; `record` must succeed silently on duplicates so
//! a redelivered job converges instead of erroring.

pub mod postgres;

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use causeway_core::{DomainResult, EventId};

pub use postgres::PostgresLedger;

#[async_trait]
pub trait ProcessedEventLedger: Send + Sync {
    async fn has(&self, event_id: EventId, handler_name: &str) -> DomainResult<bool>;

    /// Record completion. Inserting an already-present pair is success.
    async fn record(&self, event_id: EventId, handler_name: &str) -> DomainResult<()>;
}

/// In-memory ledger for tests and single-node development.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    entries: Mutex<HashSet<(EventId, String)>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProcessedEventLedger for InMemoryLedger {
    async fn has(&self, event_id: EventId, handler_name: &str) -> DomainResult<bool> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.contains(&(event_id, handler_name.to_string())))
    }

    async fn record(&self, event_id: EventId, handler_name: &str) -> DomainResult<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert((event_id, handler_name.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_then_has() {
        let ledger = InMemoryLedger::new();
        let event_id = EventId::new();

        assert!(!ledger.has(event_id, "audit").await.unwrap());
        ledger.record(event_id, "audit").await.unwrap();
        assert!(ledger.has(event_id, "audit").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_record_is_silent_success() {
        let ledger = InMemoryLedger::new();
        let event_id = EventId::new();

        ledger.record(event_id, "audit").await.unwrap();
        ledger.record(event_id, "audit").await.unwrap();
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn handler_names_are_independent() {
        let ledger = InMemoryLedger::new();
        let event_id = EventId::new();

        ledger.record(event_id, "audit").await.unwrap();
        assert!(!ledger.has(event_id, "policy-projection").await.unwrap());
    }
}
