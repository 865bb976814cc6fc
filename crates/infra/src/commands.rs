//! Command service: the single inbound surface of the core.
//!
//! `execute` binds the caller context, loads the aggregate, runs the
//! operation, converts the typed events into persistence envelopes, and
//! writes state + events + outbox through the repository seam. Expected
//! failures come back as values; the caller decides what to do with them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use causeway_actions::{Action, CreateActionInput, UpdateActionInput};
use causeway_core::{
    ActionId, AggregateRoot, CommandMetadata, DomainError, DomainResult, EventId, PolicyId,
    Transition,
};
use causeway_events::{DomainEvent, EventMetadata, NewEvent};
use causeway_policies::{CreatePolicyInput, Policy};

use crate::context;
use crate::repository::{ActionRepository, PolicyRepository};

/// Commands accepted by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Command {
    CreateAction {
        input: CreateActionInput,
    },
    UpdateAction {
        action_id: ActionId,
        input: UpdateActionInput,
        expected_version: u64,
    },
    CompleteAction {
        action_id: ActionId,
        expected_version: u64,
    },
    CancelAction {
        action_id: ActionId,
        reason: String,
        expected_version: u64,
    },
    CreatePolicy {
        input: CreatePolicyInput,
    },
    ActivatePolicy {
        policy_id: PolicyId,
        expected_version: u64,
    },
    SuspendPolicy {
        policy_id: PolicyId,
        reason: String,
        expected_version: u64,
    },
    RevokePolicy {
        policy_id: PolicyId,
        reason: String,
        revoked_by: String,
        expected_version: u64,
    },
}

/// A command plus its caller metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: Command,
    pub metadata: CommandMetadata,
}

/// Successful command outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReceipt {
    pub aggregate_id: String,
    pub version: u64,
    /// Ids of the events persisted by this command, in production order
    /// (empty for no-op updates).
    pub event_ids: Vec<EventId>,
}

#[derive(Debug, Clone)]
pub struct CommandServiceConfig {
    /// Serialized event payload cap; oversized payloads fail the command
    /// instead of failing later on the queue.
    pub max_event_payload_bytes: usize,
}

impl Default for CommandServiceConfig {
    fn default() -> Self {
        Self {
            max_event_payload_bytes: 256 * 1024,
        }
    }
}

pub struct CommandService {
    actions: Arc<dyn ActionRepository>,
    policies: Arc<dyn PolicyRepository>,
    config: CommandServiceConfig,
}

impl CommandService {
    pub fn new(actions: Arc<dyn ActionRepository>, policies: Arc<dyn PolicyRepository>) -> Self {
        Self {
            actions,
            policies,
            config: CommandServiceConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CommandServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Execute one command under its caller context.
    #[instrument(
        skip(self, request),
        fields(correlation_id = %request.metadata.correlation_id),
        err
    )]
    pub async fn execute(&self, request: CommandRequest) -> DomainResult<CommandReceipt> {
        let ctx = request.metadata.context();
        context::scope(ctx, self.dispatch(request)).await
    }

    async fn dispatch(&self, request: CommandRequest) -> DomainResult<CommandReceipt> {
        let meta = request.metadata;
        match request.command {
            Command::CreateAction { input } => {
                let id = ActionId::new();
                let (action, transition) = Action::create(id, input, &meta)?;
                let events = self.to_new_events(&action, &transition, &meta)?;
                let event_ids = self.actions.create(&action, events).await?;
                Ok(receipt(id.to_string(), transition.new_version, event_ids))
            }
            Command::UpdateAction {
                action_id,
                input,
                expected_version,
            } => {
                let mut action = self.load_action(action_id).await?;
                let transition = action.update(input, expected_version, &meta)?;
                if transition.is_no_op() {
                    debug!(action_id = %action_id, "no-op update, nothing persisted");
                    return Ok(receipt(action_id.to_string(), transition.new_version, vec![]));
                }
                let events = self.to_new_events(&action, &transition, &meta)?;
                let event_ids = self.actions.update(&action, expected_version, events).await?;
                Ok(receipt(action_id.to_string(), transition.new_version, event_ids))
            }
            Command::CompleteAction {
                action_id,
                expected_version,
            } => {
                let mut action = self.load_action(action_id).await?;
                let transition = action.complete(expected_version, &meta)?;
                let events = self.to_new_events(&action, &transition, &meta)?;
                let event_ids = self.actions.update(&action, expected_version, events).await?;
                Ok(receipt(action_id.to_string(), transition.new_version, event_ids))
            }
            Command::CancelAction {
                action_id,
                reason,
                expected_version,
            } => {
                let mut action = self.load_action(action_id).await?;
                let transition = action.cancel(&reason, expected_version, &meta)?;
                let events = self.to_new_events(&action, &transition, &meta)?;
                let event_ids = self.actions.update(&action, expected_version, events).await?;
                Ok(receipt(action_id.to_string(), transition.new_version, event_ids))
            }
            Command::CreatePolicy { input } => {
                let id = PolicyId::new();
                let (policy, transition) = Policy::create(id, input, &meta)?;
                let events = self.to_new_events(&policy, &transition, &meta)?;
                let event_ids = self.policies.create(&policy, events).await?;
                Ok(receipt(id.to_string(), transition.new_version, event_ids))
            }
            Command::ActivatePolicy {
                policy_id,
                expected_version,
            } => {
                let mut policy = self.load_policy(policy_id).await?;
                let transition = policy.activate(expected_version, &meta)?;
                let events = self.to_new_events(&policy, &transition, &meta)?;
                let event_ids = self
                    .policies
                    .update(&policy, expected_version, events)
                    .await?;
                Ok(receipt(policy_id.to_string(), transition.new_version, event_ids))
            }
            Command::SuspendPolicy {
                policy_id,
                reason,
                expected_version,
            } => {
                let mut policy = self.load_policy(policy_id).await?;
                let transition = policy.suspend(&reason, expected_version, &meta)?;
                let events = self.to_new_events(&policy, &transition, &meta)?;
                let event_ids = self
                    .policies
                    .update(&policy, expected_version, events)
                    .await?;
                Ok(receipt(policy_id.to_string(), transition.new_version, event_ids))
            }
            Command::RevokePolicy {
                policy_id,
                reason,
                revoked_by,
                expected_version,
            } => {
                let mut policy = self.load_policy(policy_id).await?;
                let transition = policy.revoke(&reason, &revoked_by, expected_version, &meta)?;
                let events = self.to_new_events(&policy, &transition, &meta)?;
                let event_ids = self
                    .policies
                    .update(&policy, expected_version, events)
                    .await?;
                Ok(receipt(policy_id.to_string(), transition.new_version, event_ids))
            }
        }
    }

    async fn load_action(&self, id: ActionId) -> DomainResult<Action> {
        self.actions
            .load(id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("action {id} not found")))
    }

    async fn load_policy(&self, id: PolicyId) -> DomainResult<Policy> {
        self.policies
            .load(id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("policy {id} not found")))
    }

    /// Convert a transition's typed events into persistence envelopes,
    /// enforcing the payload cap.
    fn to_new_events<A, E>(
        &self,
        aggregate: &A,
        transition: &Transition<E>,
        meta: &CommandMetadata,
    ) -> DomainResult<Vec<NewEvent>>
    where
        A: AggregateRoot,
        A::Id: core::fmt::Display,
        E: DomainEvent + Serialize,
    {
        let aggregate_id = aggregate.id().to_string();
        let mut events = Vec::with_capacity(transition.events.len());
        for event in &transition.events {
            let new_event = NewEvent::from_typed(
                A::aggregate_type(),
                aggregate_id.clone(),
                event,
                EventMetadata::from_command(meta, event.schema_version()),
            )?;
            let size = new_event.payload_size();
            if size > self.config.max_event_payload_bytes {
                return Err(DomainError::validation(format!(
                    "event payload is {size} bytes, cap is {}",
                    self.config.max_event_payload_bytes
                ))
                .with_rule("event.payload.too_large"));
            }
            events.push(new_event);
        }
        Ok(events)
    }
}

fn receipt(aggregate_id: String, version: u64, event_ids: Vec<EventId>) -> CommandReceipt {
    CommandReceipt {
        aggregate_id,
        version,
        event_ids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use causeway_core::{Actor, ErrorKind, ManualClock};
    use chrono::Utc;
    use serde_json::json;

    fn meta() -> CommandMetadata {
        CommandMetadata::new("c1", Actor::new("u1", "u1@example.com"), Utc::now())
    }

    fn service() -> (Arc<InMemoryBackend>, CommandService) {
        let backend = Arc::new(InMemoryBackend::new(Arc::new(ManualClock::starting_now())));
        let service = CommandService::new(backend.clone(), backend.clone());
        (backend, service)
    }

    #[tokio::test]
    async fn create_policy_persists_event_and_outbox_row() {
        let (backend, service) = service();

        let receipt = service
            .execute(CommandRequest {
                command: Command::CreatePolicy {
                    input: CreatePolicyInput {
                        name: "P".into(),
                        rules: json!({"x": 1}),
                    },
                },
                metadata: meta(),
            })
            .await
            .unwrap();

        assert_eq!(receipt.version, 1);
        assert_eq!(receipt.event_ids.len(), 1);

        let events = backend.events_for_aggregate("policy", &receipt.aggregate_id);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "policy.created");
        assert_eq!(events[0].metadata.correlation_id, "c1");

        let outbox = backend.outbox_entries();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].event_id, receipt.event_ids[0]);
    }

    #[tokio::test]
    async fn unknown_aggregate_is_not_found() {
        let (_backend, service) = service();
        let err = service
            .execute(CommandRequest {
                command: Command::ActivatePolicy {
                    policy_id: PolicyId::new(),
                    expected_version: 1,
                },
                metadata: meta(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn replayed_expected_version_gets_optimistic_lock() {
        let (_backend, service) = service();

        let receipt = service
            .execute(CommandRequest {
                command: Command::CreateAction {
                    input: CreateActionInput {
                        name: "A".into(),
                        description: None,
                    },
                },
                metadata: meta(),
            })
            .await
            .unwrap();
        let action_id: ActionId = receipt.aggregate_id.parse().unwrap();

        let complete = Command::CompleteAction {
            action_id,
            expected_version: 1,
        };
        service
            .execute(CommandRequest {
                command: complete.clone(),
                metadata: meta(),
            })
            .await
            .unwrap();

        let err = service
            .execute(CommandRequest {
                command: complete,
                metadata: meta(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::OptimisticLock);
        assert_eq!(err.rule.as_deref(), Some("action.version.mismatch"));
    }

    #[tokio::test]
    async fn no_op_update_persists_nothing() {
        let (backend, service) = service();

        let receipt = service
            .execute(CommandRequest {
                command: Command::CreateAction {
                    input: CreateActionInput {
                        name: "A".into(),
                        description: None,
                    },
                },
                metadata: meta(),
            })
            .await
            .unwrap();
        let action_id: ActionId = receipt.aggregate_id.parse().unwrap();

        let receipt = service
            .execute(CommandRequest {
                command: Command::UpdateAction {
                    action_id,
                    input: UpdateActionInput {
                        name: Some("A".into()),
                        description: None,
                    },
                    expected_version: 1,
                },
                metadata: meta(),
            })
            .await
            .unwrap();

        assert_eq!(receipt.version, 1);
        assert!(receipt.event_ids.is_empty());
        assert_eq!(backend.events().len(), 1);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let (backend, service) = service();

        let service = service.with_config(CommandServiceConfig {
            max_event_payload_bytes: 64,
        });

        let err = service
            .execute(CommandRequest {
                command: Command::CreatePolicy {
                    input: CreatePolicyInput {
                        name: "P".into(),
                        rules: json!({"blob": "x".repeat(500)}),
                    },
                },
                metadata: meta(),
            })
            .await
            .unwrap_err();

        assert_eq!(err.rule.as_deref(), Some("event.payload.too_large"));
        assert!(backend.events().is_empty());
    }
}
