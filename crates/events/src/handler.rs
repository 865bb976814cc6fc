//! Event handler contract.

use async_trait::async_trait;

use causeway_core::DomainResult;

use crate::envelope::DeliveredEvent;

/// A function that reacts to an event and performs a side effect.
///
/// Handlers are invoked at least once per event; the worker's idempotency
/// ledger guarantees the *recorded* effect happens once per
/// `(event id, handler name)`. A handler that writes to an external system
/// must itself be idempotent by natural key or tolerate retry.
///
/// Subscriptions are dotted event types; a trailing `.*` subscribes to a
/// whole aggregate stream (e.g. `"policy.*"`).
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Unique handler name within the process; this is the ledger key.
    fn name(&self) -> &'static str;

    fn subscribed_event_types(&self) -> &[&'static str];

    async fn invoke(&self, event: &DeliveredEvent) -> DomainResult<()>;
}
