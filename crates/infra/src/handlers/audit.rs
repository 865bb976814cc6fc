//! Audit sink: one immutable audit row per delivered event.
//!
//! The row is a single insert; failure bubbles up so the queue and outbox
//! retry ladders engage. The controlled-fault mode is a test fixture: it
//! is attached only through `with_controlled_faults` and arms only for
//! events whose metadata carries the `simulate_failure` flag, so it never
//! sits on the production construction path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sqlx::PgPool;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use causeway_core::{Actor, DomainError, DomainResult};
use causeway_events::{DeliveredEvent, EventHandler};

use crate::event_store::map_sqlx_error;

/// Handler name recorded in the idempotency ledger.
pub const AUDIT_HANDLER: &str = "audit";

const SUBSCRIPTIONS: &[&str] = &["action.*", "policy.*"];

/// An immutable audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub correlation_id: String,
    pub entity_type: String,
    pub entity_id: String,
    /// Imperative action name derived from the event type
    /// (`policy.activated` -> `activate`).
    pub action: String,
    pub actor: Actor,
    pub before_snapshot: Option<JsonValue>,
    pub after_snapshot: Option<JsonValue>,
    /// Field-level diffs; `{status: {from, to}}` for status transitions,
    /// empty object otherwise.
    pub changes: JsonValue,
    pub metadata: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

/// Insert-only audit storage.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, record: AuditRecord) -> DomainResult<()>;

    /// Rows for one entity in insertion order (operator/test surface).
    async fn records_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> DomainResult<Vec<AuditRecord>>;
}

/// In-memory audit store for tests and single-node development.
#[derive(Debug, Default)]
pub struct InMemoryAuditStore {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, record: AuditRecord) -> DomainResult<()> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }

    async fn records_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> DomainResult<Vec<AuditRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.entity_type == entity_type && r.entity_id == entity_id)
            .cloned()
            .collect())
    }
}

/// Postgres audit store.
#[derive(Debug, Clone)]
pub struct PostgresAuditStore {
    pool: PgPool,
}

impl PostgresAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for PostgresAuditStore {
    #[instrument(skip(self, record), fields(entity_id = %record.entity_id), err)]
    async fn append(&self, record: AuditRecord) -> DomainResult<()> {
        let actor = serde_json::to_value(&record.actor)
            .map_err(|e| DomainError::internal(format!("actor serialization failed: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, correlation_id, entity_type, entity_id, action, actor,
                before_snapshot, after_snapshot, changes, metadata, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id)
        .bind(&record.correlation_id)
        .bind(&record.entity_type)
        .bind(&record.entity_id)
        .bind(&record.action)
        .bind(&actor)
        .bind(&record.before_snapshot)
        .bind(&record.after_snapshot)
        .bind(&record.changes)
        .bind(&record.metadata)
        .bind(record.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_audit_row", e))?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn records_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> DomainResult<Vec<AuditRecord>> {
        use sqlx::Row;

        let rows = sqlx::query(
            r#"
            SELECT id, correlation_id, entity_type, entity_id, action, actor,
                   before_snapshot, after_snapshot, changes, metadata, occurred_at
            FROM audit_log
            WHERE entity_type = $1 AND entity_id = $2
            ORDER BY id ASC
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("audit_rows_for_entity", e))?;

        rows.iter()
            .map(|row| {
                let read = |e: sqlx::Error| map_sqlx_error("read_audit_row", e);
                let actor: JsonValue = row.try_get("actor").map_err(read)?;
                let actor = serde_json::from_value(actor)
                    .map_err(|e| DomainError::internal(format!("malformed audit actor: {e}")))?;
                Ok(AuditRecord {
                    id: row.try_get("id").map_err(read)?,
                    correlation_id: row.try_get("correlation_id").map_err(read)?,
                    entity_type: row.try_get("entity_type").map_err(read)?,
                    entity_id: row.try_get("entity_id").map_err(read)?,
                    action: row.try_get("action").map_err(read)?,
                    actor,
                    before_snapshot: row.try_get("before_snapshot").map_err(read)?,
                    after_snapshot: row.try_get("after_snapshot").map_err(read)?,
                    changes: row.try_get("changes").map_err(read)?,
                    metadata: row.try_get("metadata").map_err(read)?,
                    occurred_at: row.try_get("occurred_at").map_err(read)?,
                })
            })
            .collect()
    }
}

/// Test fixture: fail the first `failures_before_success` invocations per
/// `(aggregate id, event type)` key, then succeed.
#[derive(Debug)]
pub struct FaultInjector {
    failures_before_success: u32,
    invocations: Mutex<HashMap<(String, String), u32>>,
}

impl FaultInjector {
    pub fn failing_first(failures_before_success: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_before_success,
            invocations: Mutex::new(HashMap::new()),
        })
    }

    /// Never succeeds; for dead-letter tests.
    pub fn permanent() -> Arc<Self> {
        Self::failing_first(u32::MAX)
    }

    fn should_fail(&self, aggregate_id: &str, event_type: &str) -> bool {
        let mut invocations = self.invocations.lock().unwrap();
        let count = invocations
            .entry((aggregate_id.to_string(), event_type.to_string()))
            .or_insert(0);
        *count += 1;
        *count <= self.failures_before_success
    }
}

/// The audit handler.
pub struct AuditSink {
    store: Arc<dyn AuditStore>,
    faults: Option<Arc<FaultInjector>>,
}

impl AuditSink {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self {
            store,
            faults: None,
        }
    }

    /// Test-fixture constructor; production wiring uses `new`.
    pub fn with_controlled_faults(store: Arc<dyn AuditStore>, faults: Arc<FaultInjector>) -> Self {
        Self {
            store,
            faults: Some(faults),
        }
    }
}

#[async_trait]
impl EventHandler for AuditSink {
    fn name(&self) -> &'static str {
        AUDIT_HANDLER
    }

    fn subscribed_event_types(&self) -> &[&'static str] {
        SUBSCRIPTIONS
    }

    async fn invoke(&self, event: &DeliveredEvent) -> DomainResult<()> {
        if event.metadata.simulate_failure {
            if let Some(faults) = &self.faults {
                if faults.should_fail(&event.aggregate_id, &event.event_type) {
                    warn!(
                        event_id = %event.event_id,
                        event_type = %event.event_type,
                        "injected audit failure"
                    );
                    return Err(DomainError::infrastructure(
                        "audit-store",
                        "injected audit failure",
                    ));
                }
            }
        }

        let record = record_for(event)?;
        debug!(
            event_id = %event.event_id,
            entity_id = %record.entity_id,
            action = %record.action,
            "writing audit row"
        );
        self.store.append(record).await
    }
}

fn record_for(event: &DeliveredEvent) -> DomainResult<AuditRecord> {
    let metadata = serde_json::to_value(&event.metadata)
        .map_err(|e| DomainError::internal(format!("metadata serialization failed: {e}")))?;

    Ok(AuditRecord {
        id: Uuid::now_v7(),
        correlation_id: event.metadata.correlation_id.clone(),
        entity_type: event.aggregate_type.clone(),
        entity_id: event.aggregate_id.clone(),
        action: audit_action(&event.event_type),
        actor: event.metadata.actor.clone(),
        before_snapshot: None,
        after_snapshot: Some(event.payload.clone()),
        changes: changes_for(&event.payload),
        metadata,
        occurred_at: event.metadata.produced_at,
    })
}

/// `policy.activated` -> `activate`, `action.created` -> `create`, etc.
/// Unknown suffixes pass through unmapped.
fn audit_action(event_type: &str) -> String {
    let fact = event_type.rsplit('.').next().unwrap_or(event_type);
    match fact {
        "created" => "create",
        "updated" => "update",
        "completed" => "complete",
        "cancelled" => "cancel",
        "activated" => "activate",
        "suspended" => "suspend",
        "revoked" => "revoke",
        other => other,
    }
    .to_string()
}

/// Status-transition events carry `status` and `previous_status`; map them
/// into a `{status: {from, to}}` diff. Everything else gets no changes.
fn changes_for(payload: &JsonValue) -> JsonValue {
    match (
        payload.get("previous_status").and_then(JsonValue::as_str),
        payload.get("status").and_then(JsonValue::as_str),
    ) {
        (Some(from), Some(to)) => json!({ "status": { "from": from, "to": to } }),
        _ => json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_core::{CommandMetadata, EventId};
    use causeway_events::EventMetadata;

    fn delivered(event_type: &str, payload: JsonValue, simulate_failure: bool) -> DeliveredEvent {
        let mut meta =
            CommandMetadata::new("c1", Actor::new("u1", "u1@example.com"), Utc::now());
        if simulate_failure {
            meta = meta.with_simulated_failure();
        }
        DeliveredEvent {
            event_id: EventId::new(),
            event_type: event_type.into(),
            aggregate_type: event_type.split('.').next().unwrap().into(),
            aggregate_id: "agg-1".into(),
            payload,
            metadata: EventMetadata::from_command(&meta, 1),
        }
    }

    #[test]
    fn event_types_map_to_audit_actions() {
        assert_eq!(audit_action("policy.created"), "create");
        assert_eq!(audit_action("policy.activated"), "activate");
        assert_eq!(audit_action("policy.suspended"), "suspend");
        assert_eq!(audit_action("policy.revoked"), "revoke");
        assert_eq!(audit_action("action.updated"), "update");
        assert_eq!(audit_action("action.completed"), "complete");
        assert_eq!(audit_action("action.cancelled"), "cancel");
        assert_eq!(audit_action("policy.archived"), "archived");
    }

    #[tokio::test]
    async fn writes_one_row_with_snapshot_and_correlation() {
        let store = Arc::new(InMemoryAuditStore::new());
        let sink = AuditSink::new(store.clone());

        let event = delivered("policy.created", json!({"name": "P", "status": "draft"}), false);
        sink.invoke(&event).await.unwrap();

        let rows = store.all();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action, "create");
        assert_eq!(rows[0].correlation_id, "c1");
        assert_eq!(rows[0].after_snapshot, Some(event.payload.clone()));
        assert_eq!(rows[0].before_snapshot, None);
        assert_eq!(rows[0].changes, json!({}));
    }

    #[tokio::test]
    async fn status_transition_gets_changes_map() {
        let store = Arc::new(InMemoryAuditStore::new());
        let sink = AuditSink::new(store.clone());

        let event = delivered(
            "policy.activated",
            json!({"status": "active", "previous_status": "draft"}),
            false,
        );
        sink.invoke(&event).await.unwrap();

        let rows = store.all();
        assert_eq!(
            rows[0].changes,
            json!({"status": {"from": "draft", "to": "active"}})
        );
    }

    #[tokio::test]
    async fn controlled_fault_fails_twice_then_succeeds() {
        let store = Arc::new(InMemoryAuditStore::new());
        let sink = AuditSink::with_controlled_faults(store.clone(), FaultInjector::failing_first(2));

        let event = delivered("policy.created", json!({"status": "draft"}), true);

        assert!(sink.invoke(&event).await.is_err());
        assert!(sink.invoke(&event).await.is_err());
        sink.invoke(&event).await.unwrap();

        assert_eq!(store.all().len(), 1);
    }

    #[tokio::test]
    async fn fault_injector_ignores_unflagged_events() {
        let store = Arc::new(InMemoryAuditStore::new());
        let sink = AuditSink::with_controlled_faults(store.clone(), FaultInjector::permanent());

        let event = delivered("policy.created", json!({"status": "draft"}), false);
        sink.invoke(&event).await.unwrap();
        assert_eq!(store.all().len(), 1);
    }
}
