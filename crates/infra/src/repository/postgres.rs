//! Postgres repositories for `Action` and `Policy`.
//!
//! Each write runs `with_transaction`: entity row first, then
//! `persist_events` appends the event log + outbox rows. Version guards
//! are `UPDATE ... WHERE version = $expected`; zero rows affected means a
//! concurrent writer won and the caller gets `optimistic-lock`.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use causeway_actions::{Action, ActionStatus};
use causeway_core::{ActionId, AggregateRoot, DomainError, DomainResult, EventId, PolicyId};
use causeway_events::NewEvent;
use causeway_policies::{Policy, PolicyStatus};

use crate::event_store::{map_sqlx_error, persist_events, with_transaction};

use super::{ActionRepository, PolicyRepository};

fn parse_action_status(s: &str) -> DomainResult<ActionStatus> {
    match s {
        "active" => Ok(ActionStatus::Active),
        "completed" => Ok(ActionStatus::Completed),
        "cancelled" => Ok(ActionStatus::Cancelled),
        other => Err(DomainError::internal(format!(
            "unknown action status in storage: {other}"
        ))),
    }
}

fn parse_policy_status(s: &str) -> DomainResult<PolicyStatus> {
    match s {
        "draft" => Ok(PolicyStatus::Draft),
        "active" => Ok(PolicyStatus::Active),
        "suspended" => Ok(PolicyStatus::Suspended),
        "revoked" => Ok(PolicyStatus::Revoked),
        other => Err(DomainError::internal(format!(
            "unknown policy status in storage: {other}"
        ))),
    }
}

fn action_from_row(row: &sqlx::postgres::PgRow) -> DomainResult<Action> {
    let read = |e: sqlx::Error| map_sqlx_error("read_action_row", e);
    let status: String = row.try_get("status").map_err(read)?;

    Ok(Action::from_parts(
        ActionId::from_uuid(row.try_get("id").map_err(read)?),
        row.try_get("name").map_err(read)?,
        row.try_get("description").map_err(read)?,
        parse_action_status(&status)?,
        row.try_get("cancel_reason").map_err(read)?,
        row.try_get::<i64, _>("version").map_err(read)? as u64,
        row.try_get("created_at").map_err(read)?,
        row.try_get("updated_at").map_err(read)?,
    ))
}

fn policy_from_row(row: &sqlx::postgres::PgRow) -> DomainResult<Policy> {
    let read = |e: sqlx::Error| map_sqlx_error("read_policy_row", e);
    let status: String = row.try_get("status").map_err(read)?;

    Ok(Policy::from_parts(
        PolicyId::from_uuid(row.try_get("id").map_err(read)?),
        row.try_get("name").map_err(read)?,
        row.try_get("rules").map_err(read)?,
        parse_policy_status(&status)?,
        row.try_get("suspend_reason").map_err(read)?,
        row.try_get("revoke_reason").map_err(read)?,
        row.try_get("revoked_by").map_err(read)?,
        row.try_get::<i64, _>("version").map_err(read)? as u64,
        row.try_get("created_at").map_err(read)?,
        row.try_get("updated_at").map_err(read)?,
    ))
}

#[derive(Debug, Clone)]
pub struct PostgresActionRepository {
    pool: PgPool,
}

impl PostgresActionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActionRepository for PostgresActionRepository {
    #[instrument(skip(self), err)]
    async fn load(&self, id: ActionId) -> DomainResult<Option<Action>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, description, status, cancel_reason, version,
                   created_at, updated_at
            FROM actions
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_action", e))?;

        row.as_ref().map(action_from_row).transpose()
    }

    #[instrument(skip(self, action, events), fields(action_id = %action.id()), err)]
    async fn create(&self, action: &Action, events: Vec<NewEvent>) -> DomainResult<Vec<EventId>> {
        let action = action.clone();
        with_transaction(&self.pool, move |tx| {
            Box::pin(async move {
                sqlx::query(
                    r#"
                    INSERT INTO actions (
                        id, name, description, status, cancel_reason,
                        version, created_at, updated_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(action.id().as_uuid())
                .bind(action.name())
                .bind(action.description())
                .bind(action.status().as_str())
                .bind(action.cancel_reason())
                .bind(action.version() as i64)
                .bind(action.created_at())
                .bind(action.updated_at())
                .execute(&mut **tx)
                .await
                .map_err(|e| match map_sqlx_error("insert_action", e) {
                    err if err.kind == causeway_core::ErrorKind::Concurrency => {
                        DomainError::conflict(format!("action {} already exists", action.id()))
                    }
                    err => err,
                })?;

                persist_events(tx, &events).await
            })
        })
        .await
    }

    #[instrument(skip(self, action, events), fields(action_id = %action.id()), err)]
    async fn update(
        &self,
        action: &Action,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> DomainResult<Vec<EventId>> {
        let action = action.clone();
        with_transaction(&self.pool, move |tx| {
            Box::pin(async move {
                let result = sqlx::query(
                    r#"
                    UPDATE actions
                       SET name = $2,
                           description = $3,
                           status = $4,
                           cancel_reason = $5,
                           version = $6,
                           updated_at = $7
                     WHERE id = $1 AND version = $8
                    "#,
                )
                .bind(action.id().as_uuid())
                .bind(action.name())
                .bind(action.description())
                .bind(action.status().as_str())
                .bind(action.cancel_reason())
                .bind(action.version() as i64)
                .bind(action.updated_at())
                .bind(expected_version as i64)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("update_action", e))?;

                if result.rows_affected() == 0 {
                    return Err(version_conflict(
                        tx,
                        "actions",
                        "action",
                        *action.id().as_uuid(),
                        expected_version,
                    )
                    .await);
                }

                persist_events(tx, &events).await
            })
        })
        .await
    }
}

#[derive(Debug, Clone)]
pub struct PostgresPolicyRepository {
    pool: PgPool,
}

impl PostgresPolicyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PolicyRepository for PostgresPolicyRepository {
    #[instrument(skip(self), err)]
    async fn load(&self, id: PolicyId) -> DomainResult<Option<Policy>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, rules, status, suspend_reason, revoke_reason,
                   revoked_by, version, created_at, updated_at
            FROM policies
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_policy", e))?;

        row.as_ref().map(policy_from_row).transpose()
    }

    #[instrument(skip(self, policy, events), fields(policy_id = %policy.id()), err)]
    async fn create(&self, policy: &Policy, events: Vec<NewEvent>) -> DomainResult<Vec<EventId>> {
        let policy = policy.clone();
        with_transaction(&self.pool, move |tx| {
            Box::pin(async move {
                sqlx::query(
                    r#"
                    INSERT INTO policies (
                        id, name, rules, status, suspend_reason, revoke_reason,
                        revoked_by, version, created_at, updated_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    "#,
                )
                .bind(policy.id().as_uuid())
                .bind(policy.name())
                .bind(policy.rules())
                .bind(policy.status().as_str())
                .bind(policy.suspend_reason())
                .bind(policy.revoke_reason())
                .bind(policy.revoked_by())
                .bind(policy.version() as i64)
                .bind(policy.created_at())
                .bind(policy.updated_at())
                .execute(&mut **tx)
                .await
                .map_err(|e| match map_sqlx_error("insert_policy", e) {
                    err if err.kind == causeway_core::ErrorKind::Concurrency => {
                        DomainError::conflict(format!("policy {} already exists", policy.id()))
                    }
                    err => err,
                })?;

                persist_events(tx, &events).await
            })
        })
        .await
    }

    #[instrument(skip(self, policy, events), fields(policy_id = %policy.id()), err)]
    async fn update(
        &self,
        policy: &Policy,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> DomainResult<Vec<EventId>> {
        let policy = policy.clone();
        with_transaction(&self.pool, move |tx| {
            Box::pin(async move {
                let result = sqlx::query(
                    r#"
                    UPDATE policies
                       SET name = $2,
                           rules = $3,
                           status = $4,
                           suspend_reason = $5,
                           revoke_reason = $6,
                           revoked_by = $7,
                           version = $8,
                           updated_at = $9
                     WHERE id = $1 AND version = $10
                    "#,
                )
                .bind(policy.id().as_uuid())
                .bind(policy.name())
                .bind(policy.rules())
                .bind(policy.status().as_str())
                .bind(policy.suspend_reason())
                .bind(policy.revoke_reason())
                .bind(policy.revoked_by())
                .bind(policy.version() as i64)
                .bind(policy.updated_at())
                .bind(expected_version as i64)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("update_policy", e))?;

                if result.rows_affected() == 0 {
                    return Err(version_conflict(
                        tx,
                        "policies",
                        "policy",
                        *policy.id().as_uuid(),
                        expected_version,
                    )
                    .await);
                }

                persist_events(tx, &events).await
            })
        })
        .await
    }
}

/// Distinguish a missing row from a lost optimistic race after a guarded
/// UPDATE matched nothing.
async fn version_conflict(
    tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
    table: &str,
    aggregate_type: &str,
    id: uuid::Uuid,
    expected_version: u64,
) -> DomainError {
    let sql = format!("SELECT version FROM {table} WHERE id = $1");
    let found = sqlx::query(&sql).bind(id).fetch_optional(&mut **tx).await;

    match found {
        Ok(Some(row)) => match row.try_get::<i64, _>("version") {
            Ok(found_version) => DomainError::optimistic_lock(
                format!("{aggregate_type}.version.mismatch"),
                format!("expected version {expected_version}, found {found_version}"),
            ),
            Err(e) => map_sqlx_error("check_version_conflict", e),
        },
        Ok(None) => DomainError::not_found(format!("{aggregate_type} {id} not found")),
        Err(e) => map_sqlx_error("check_version_conflict", e),
    }
}
