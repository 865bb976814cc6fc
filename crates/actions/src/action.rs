use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use causeway_core::{
    check_expected_version, ActionId, AggregateRoot, CommandMetadata, DomainError, DomainResult,
    Transition,
};
use causeway_events::DomainEvent;

const NAME_MAX_LEN: usize = 200;
const DESCRIPTION_MAX_LEN: usize = 2000;
const REASON_MAX_LEN: usize = 500;

/// Action status lifecycle: `active` until completed or cancelled, both of
/// which are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Active,
    Completed,
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Active => "active",
            ActionStatus::Completed => "completed",
            ActionStatus::Cancelled => "cancelled",
        }
    }
}

/// Aggregate root: Action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    id: ActionId,
    name: String,
    description: String,
    status: ActionStatus,
    cancel_reason: Option<String>,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Action {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn status(&self) -> ActionStatus {
        self.status
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, ActionStatus::Active)
    }

    /// Rehydrate from stored state. Storage owns the row mapping; this is
    /// the `from_row` half of the pair.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: ActionId,
        name: String,
        description: String,
        status: ActionStatus,
        cancel_reason: Option<String>,
        version: u64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name,
            description,
            status,
            cancel_reason,
            version,
            created_at,
            updated_at,
        }
    }

    /// First successful command: brings the aggregate to version 1.
    pub fn create(
        id: ActionId,
        input: CreateActionInput,
        meta: &CommandMetadata,
    ) -> DomainResult<(Self, Transition<ActionEvent>)> {
        let name = validate_name(&input.name)?;
        let description = validate_description(input.description.as_deref().unwrap_or(""))?;

        let action = Self {
            id,
            name: name.clone(),
            description: description.clone(),
            status: ActionStatus::Active,
            cancel_reason: None,
            version: 1,
            created_at: meta.timestamp,
            updated_at: meta.timestamp,
        };

        let event = ActionEvent::Created(ActionCreated {
            action_id: id,
            name,
            description,
            status: ActionStatus::Active,
            occurred_at: meta.timestamp,
        });

        Ok((action, Transition::new(vec![event], 1)))
    }

    /// Update name/description. Allowed only while `active`; an all-equal
    /// update succeeds with zero events and no version bump.
    pub fn update(
        &mut self,
        input: UpdateActionInput,
        expected_version: u64,
        meta: &CommandMetadata,
    ) -> DomainResult<Transition<ActionEvent>> {
        check_expected_version(Self::aggregate_type(), self.version, expected_version)?;

        if !self.is_active() {
            return Err(DomainError::business_rule(
                "action.update.not_active",
                format!("action is {} and admits no further updates", self.status.as_str()),
            ));
        }

        let name = match input.name {
            Some(ref n) => validate_name(n)?,
            None => self.name.clone(),
        };
        let description = match input.description {
            Some(ref d) => validate_description(d)?,
            None => self.description.clone(),
        };

        if name == self.name && description == self.description {
            return Ok(Transition::no_op(self.version));
        }

        self.name = name.clone();
        self.description = description.clone();
        self.version += 1;
        self.updated_at = meta.timestamp;

        let event = ActionEvent::Updated(ActionUpdated {
            action_id: self.id,
            name,
            description,
            occurred_at: meta.timestamp,
        });

        Ok(Transition::new(vec![event], self.version))
    }

    pub fn complete(
        &mut self,
        expected_version: u64,
        meta: &CommandMetadata,
    ) -> DomainResult<Transition<ActionEvent>> {
        check_expected_version(Self::aggregate_type(), self.version, expected_version)?;

        if !self.is_active() {
            return Err(DomainError::business_rule(
                "action.complete.not_active",
                format!("cannot complete an action that is {}", self.status.as_str()),
            ));
        }

        let previous_status = self.status;
        self.status = ActionStatus::Completed;
        self.version += 1;
        self.updated_at = meta.timestamp;

        let event = ActionEvent::Completed(ActionCompleted {
            action_id: self.id,
            status: self.status,
            previous_status,
            occurred_at: meta.timestamp,
        });

        Ok(Transition::new(vec![event], self.version))
    }

    /// Cancel requires a non-empty reason.
    pub fn cancel(
        &mut self,
        reason: &str,
        expected_version: u64,
        meta: &CommandMetadata,
    ) -> DomainResult<Transition<ActionEvent>> {
        check_expected_version(Self::aggregate_type(), self.version, expected_version)?;

        if !self.is_active() {
            return Err(DomainError::business_rule(
                "action.cancel.not_active",
                format!("cannot cancel an action that is {}", self.status.as_str()),
            ));
        }

        let reason = validate_reason("action.cancel", reason)?;

        let previous_status = self.status;
        self.status = ActionStatus::Cancelled;
        self.cancel_reason = Some(reason.clone());
        self.version += 1;
        self.updated_at = meta.timestamp;

        let event = ActionEvent::Cancelled(ActionCancelled {
            action_id: self.id,
            reason,
            status: self.status,
            previous_status,
            occurred_at: meta.timestamp,
        });

        Ok(Transition::new(vec![event], self.version))
    }
}

impl AggregateRoot for Action {
    type Id = ActionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn aggregate_type() -> &'static str {
        "action"
    }
}

// Emptiness is checked before length so a blank value never reads as "too
// long".
fn validate_name(raw: &str) -> DomainResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(
            DomainError::validation("action name must not be empty")
                .with_rule("action.name.required"),
        );
    }
    if trimmed.chars().count() > NAME_MAX_LEN {
        return Err(DomainError::validation(format!(
            "action name exceeds {NAME_MAX_LEN} characters"
        ))
        .with_rule("action.name.too_long"));
    }
    Ok(trimmed.to_string())
}

fn validate_description(raw: &str) -> DomainResult<String> {
    let trimmed = raw.trim();
    if trimmed.chars().count() > DESCRIPTION_MAX_LEN {
        return Err(DomainError::validation(format!(
            "action description exceeds {DESCRIPTION_MAX_LEN} characters"
        ))
        .with_rule("action.description.too_long"));
    }
    Ok(trimmed.to_string())
}

fn validate_reason(rule_prefix: &str, raw: &str) -> DomainResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation("a reason is required")
            .with_rule(format!("{rule_prefix}.reason_required")));
    }
    if trimmed.chars().count() > REASON_MAX_LEN {
        return Err(
            DomainError::validation(format!("reason exceeds {REASON_MAX_LEN} characters"))
                .with_rule(format!("{rule_prefix}.reason_too_long")),
        );
    }
    Ok(trimmed.to_string())
}

/// Input: create an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateActionInput {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
}

/// Input: update an action. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateActionInput {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
}

/// Event: action.created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCreated {
    pub action_id: ActionId,
    pub name: String,
    pub description: String,
    pub status: ActionStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: action.updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionUpdated {
    pub action_id: ActionId,
    pub name: String,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: action.completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCompleted {
    pub action_id: ActionId,
    pub status: ActionStatus,
    pub previous_status: ActionStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: action.cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCancelled {
    pub action_id: ActionId,
    pub reason: String,
    pub status: ActionStatus,
    pub previous_status: ActionStatus,
    pub occurred_at: DateTime<Utc>,
}

// Untagged: the payload is the bare fact. Variant order matters for
// deserialization; richer shapes come before their field subsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionEvent {
    Created(ActionCreated),
    Cancelled(ActionCancelled),
    Completed(ActionCompleted),
    Updated(ActionUpdated),
}

impl DomainEvent for ActionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ActionEvent::Created(_) => "action.created",
            ActionEvent::Updated(_) => "action.updated",
            ActionEvent::Completed(_) => "action.completed",
            ActionEvent::Cancelled(_) => "action.cancelled",
        }
    }

    fn schema_version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ActionEvent::Created(e) => e.occurred_at,
            ActionEvent::Updated(e) => e.occurred_at,
            ActionEvent::Completed(e) => e.occurred_at,
            ActionEvent::Cancelled(e) => e.occurred_at,
        }
    }
}
