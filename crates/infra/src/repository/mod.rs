//! Aggregate state storage.
//!
//! Repositories are the seam where the transactional write path lives:
//! state write + event append + outbox insert happen atomically inside one
//! implementation call (I1/I2). The Postgres implementations compose
//! `with_transaction` + `persist_events`; the in-memory backend holds one
//! lock across the same steps.

pub mod postgres;

use async_trait::async_trait;

use causeway_actions::Action;
use causeway_core::{ActionId, DomainResult, EventId, PolicyId};
use causeway_events::NewEvent;
use causeway_policies::Policy;

pub use postgres::{PostgresActionRepository, PostgresPolicyRepository};

#[async_trait]
pub trait ActionRepository: Send + Sync {
    async fn load(&self, id: ActionId) -> DomainResult<Option<Action>>;

    /// Persist a freshly created aggregate (version 1) with its events.
    /// A duplicate id is a `conflict`.
    async fn create(&self, action: &Action, events: Vec<NewEvent>) -> DomainResult<Vec<EventId>>;

    /// Persist a state transition guarded by the optimistic version check:
    /// the row must still be at `expected_version` or the write fails with
    /// `optimistic-lock`.
    async fn update(
        &self,
        action: &Action,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> DomainResult<Vec<EventId>>;
}

#[async_trait]
pub trait PolicyRepository: Send + Sync {
    async fn load(&self, id: PolicyId) -> DomainResult<Option<Policy>>;

    async fn create(&self, policy: &Policy, events: Vec<NewEvent>) -> DomainResult<Vec<EventId>>;

    async fn update(
        &self,
        policy: &Policy,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> DomainResult<Vec<EventId>>;
}
