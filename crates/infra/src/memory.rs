//! In-memory backend: one lock over aggregate state, the event log, and
//! the outbox.
//!
//! Implements the same seams as the Postgres backend (`ActionRepository`,
//! `PolicyRepository`, `OutboxStore`) with the same atomicity: a write
//! either lands state + events + outbox rows together or not at all.
//! Exists for tests and single-node development; nothing here survives a
//! restart.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use causeway_actions::Action;
use causeway_core::{
    ActionId, AggregateRoot, Clock, DomainError, DomainResult, EventId, PolicyId,
};
use causeway_events::NewEvent;
use causeway_policies::Policy;

use crate::event_store::EventLogEntry;
use crate::outbox::{OutboxEntry, OutboxMetrics, OutboxStatus, OutboxStore};
use crate::repository::{ActionRepository, PolicyRepository};

#[derive(Default)]
struct Inner {
    actions: Vec<Action>,
    policies: Vec<Policy>,
    events: Vec<EventLogEntry>,
    outbox: Vec<OutboxEntry>,
}

pub struct InMemoryBackend {
    clock: Arc<dyn Clock>,
    state: Mutex<Inner>,
}

impl InMemoryBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(Inner::default()),
        }
    }

    fn persist_events_locked(
        inner: &mut Inner,
        events: &[NewEvent],
        now: DateTime<Utc>,
    ) -> Vec<EventId> {
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            inner.events.push(EventLogEntry::from_new_event(event, now));
            inner.outbox.push(OutboxEntry::from_new_event(event, now));
            ids.push(event.event_id);
        }
        ids
    }

    /// Append events (and outbox rows) without any aggregate state write.
    /// Test/dev affordance for exercising the delivery pipeline directly.
    pub fn seed_events(&self, events: &[NewEvent]) -> Vec<EventId> {
        let now = self.clock.now();
        let mut inner = self.state.lock().unwrap();
        Self::persist_events_locked(&mut inner, events, now)
    }

    /// Override `max_retries` on every current outbox row (test
    /// affordance for the terminal-failure path).
    pub fn set_outbox_max_retries(&self, max_retries: u32) {
        let mut inner = self.state.lock().unwrap();
        for entry in &mut inner.outbox {
            entry.max_retries = max_retries;
        }
    }

    pub fn events(&self) -> Vec<EventLogEntry> {
        self.state.lock().unwrap().events.clone()
    }

    /// Events for one aggregate in persistence order.
    pub fn events_for_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Vec<EventLogEntry> {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.aggregate_type == aggregate_type && e.aggregate_id == aggregate_id)
            .cloned()
            .collect()
    }

    pub fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.state.lock().unwrap().outbox.clone()
    }
}

#[async_trait]
impl ActionRepository for InMemoryBackend {
    async fn load(&self, id: ActionId) -> DomainResult<Option<Action>> {
        let inner = self.state.lock().unwrap();
        Ok(inner.actions.iter().find(|a| *a.id() == id).cloned())
    }

    async fn create(&self, action: &Action, events: Vec<NewEvent>) -> DomainResult<Vec<EventId>> {
        let now = self.clock.now();
        let mut inner = self.state.lock().unwrap();

        if inner.actions.iter().any(|a| a.id() == action.id()) {
            return Err(DomainError::conflict(format!(
                "action {} already exists",
                action.id()
            )));
        }

        inner.actions.push(action.clone());
        Ok(Self::persist_events_locked(&mut inner, &events, now))
    }

    async fn update(
        &self,
        action: &Action,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> DomainResult<Vec<EventId>> {
        let now = self.clock.now();
        let mut inner = self.state.lock().unwrap();

        let Some(stored) = inner.actions.iter_mut().find(|a| a.id() == action.id()) else {
            return Err(DomainError::not_found(format!(
                "action {} not found",
                action.id()
            )));
        };

        if stored.version() != expected_version {
            return Err(DomainError::optimistic_lock(
                "action.version.mismatch",
                format!(
                    "expected version {expected_version}, found {}",
                    stored.version()
                ),
            ));
        }

        *stored = action.clone();
        Ok(Self::persist_events_locked(&mut inner, &events, now))
    }
}

#[async_trait]
impl PolicyRepository for InMemoryBackend {
    async fn load(&self, id: PolicyId) -> DomainResult<Option<Policy>> {
        let inner = self.state.lock().unwrap();
        Ok(inner.policies.iter().find(|p| *p.id() == id).cloned())
    }

    async fn create(&self, policy: &Policy, events: Vec<NewEvent>) -> DomainResult<Vec<EventId>> {
        let now = self.clock.now();
        let mut inner = self.state.lock().unwrap();

        if inner.policies.iter().any(|p| p.id() == policy.id()) {
            return Err(DomainError::conflict(format!(
                "policy {} already exists",
                policy.id()
            )));
        }

        inner.policies.push(policy.clone());
        Ok(Self::persist_events_locked(&mut inner, &events, now))
    }

    async fn update(
        &self,
        policy: &Policy,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> DomainResult<Vec<EventId>> {
        let now = self.clock.now();
        let mut inner = self.state.lock().unwrap();

        let Some(stored) = inner.policies.iter_mut().find(|p| p.id() == policy.id()) else {
            return Err(DomainError::not_found(format!(
                "policy {} not found",
                policy.id()
            )));
        };

        if stored.version() != expected_version {
            return Err(DomainError::optimistic_lock(
                "policy.version.mismatch",
                format!(
                    "expected version {expected_version}, found {}",
                    stored.version()
                ),
            ));
        }

        *stored = policy.clone();
        Ok(Self::persist_events_locked(&mut inner, &events, now))
    }
}

#[async_trait]
impl OutboxStore for InMemoryBackend {
    async fn claim_batch(
        &self,
        limit: usize,
        claim_timeout: Duration,
    ) -> DomainResult<Vec<OutboxEntry>> {
        let now = self.clock.now();
        let deadline = now
            + chrono::Duration::from_std(claim_timeout)
                .map_err(|e| DomainError::internal(format!("claim timeout out of range: {e}")))?;

        let mut inner = self.state.lock().unwrap();
        let mut claimed = Vec::new();

        // Insertion order is creation order; the mutex stands in for the
        // database's row locks, so claims are disjoint by construction.
        for entry in inner.outbox.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            let deliverable = match entry.status {
                // A pending row with a future next_retry_at is backing off.
                OutboxStatus::Pending => entry.next_retry_at.is_none_or(|at| at < now),
                OutboxStatus::Processing => {
                    entry.next_retry_at.is_some_and(|at| at < now)
                }
                _ => false,
            };
            if deliverable && entry.retry_count < entry.max_retries {
                entry.status = OutboxStatus::Processing;
                entry.next_retry_at = Some(deadline);
                claimed.push(entry.clone());
            }
        }

        Ok(claimed)
    }

    async fn mark_completed(&self, id: Uuid) -> DomainResult<()> {
        let now = self.clock.now();
        let mut inner = self.state.lock().unwrap();
        if let Some(entry) = inner.outbox.iter_mut().find(|e| e.id == id) {
            if entry.status == OutboxStatus::Processing {
                entry.status = OutboxStatus::Completed;
                entry.processed_at = Some(now);
                entry.next_retry_at = None;
            }
        }
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        let mut inner = self.state.lock().unwrap();
        if let Some(entry) = inner.outbox.iter_mut().find(|e| e.id == id) {
            if entry.status == OutboxStatus::Processing {
                entry.status = OutboxStatus::Pending;
                entry.retry_count += 1;
                entry.last_error = Some(error.to_string());
                entry.next_retry_at = Some(next_retry_at);
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> DomainResult<()> {
        let mut inner = self.state.lock().unwrap();
        if let Some(entry) = inner.outbox.iter_mut().find(|e| e.id == id) {
            if entry.status == OutboxStatus::Processing {
                entry.status = OutboxStatus::Failed;
                entry.retry_count += 1;
                entry.last_error = Some(error.to_string());
                entry.next_retry_at = None;
            }
        }
        Ok(())
    }

    async fn metrics(&self) -> DomainResult<OutboxMetrics> {
        let inner = self.state.lock().unwrap();
        let mut metrics = OutboxMetrics::default();
        for entry in &inner.outbox {
            match entry.status {
                OutboxStatus::Pending => metrics.pending += 1,
                OutboxStatus::Processing => metrics.processing += 1,
                OutboxStatus::Completed => metrics.completed += 1,
                OutboxStatus::Failed => metrics.failed += 1,
            }
        }
        Ok(metrics)
    }

    async fn entry(&self, id: Uuid) -> DomainResult<Option<OutboxEntry>> {
        let inner = self.state.lock().unwrap();
        Ok(inner.outbox.iter().find(|e| e.id == id).cloned())
    }
}
