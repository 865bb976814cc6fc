use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use causeway_core::{
    check_expected_version, AggregateRoot, CommandMetadata, DomainError, DomainResult, PolicyId,
    Transition,
};
use causeway_events::DomainEvent;

const NAME_MAX_LEN: usize = 200;
const REASON_MAX_LEN: usize = 500;

/// Policy status lifecycle.
///
/// `draft → active`, `active ↔ suspended`, and any non-revoked status may
/// transition to `revoked`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStatus {
    Draft,
    Active,
    Suspended,
    Revoked,
}

impl PolicyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyStatus::Draft => "draft",
            PolicyStatus::Active => "active",
            PolicyStatus::Suspended => "suspended",
            PolicyStatus::Revoked => "revoked",
        }
    }
}

/// Aggregate root: Policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    id: PolicyId,
    name: String,
    rules: JsonValue,
    status: PolicyStatus,
    suspend_reason: Option<String>,
    revoke_reason: Option<String>,
    revoked_by: Option<String>,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Policy {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rules(&self) -> &JsonValue {
        &self.rules
    }

    pub fn status(&self) -> PolicyStatus {
        self.status
    }

    pub fn suspend_reason(&self) -> Option<&str> {
        self.suspend_reason.as_deref()
    }

    pub fn revoke_reason(&self) -> Option<&str> {
        self.revoke_reason.as_deref()
    }

    pub fn revoked_by(&self) -> Option<&str> {
        self.revoked_by.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Rehydrate from stored state (the `from_row` half of the mapping).
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: PolicyId,
        name: String,
        rules: JsonValue,
        status: PolicyStatus,
        suspend_reason: Option<String>,
        revoke_reason: Option<String>,
        revoked_by: Option<String>,
        version: u64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name,
            rules,
            status,
            suspend_reason,
            revoke_reason,
            revoked_by,
            version,
            created_at,
            updated_at,
        }
    }

    pub fn create(
        id: PolicyId,
        input: CreatePolicyInput,
        meta: &CommandMetadata,
    ) -> DomainResult<(Self, Transition<PolicyEvent>)> {
        let name = validate_name(&input.name)?;
        if !input.rules.is_object() {
            return Err(
                DomainError::validation("policy rules must be a JSON object")
                    .with_rule("policy.rules.invalid"),
            );
        }

        let policy = Self {
            id,
            name: name.clone(),
            rules: input.rules.clone(),
            status: PolicyStatus::Draft,
            suspend_reason: None,
            revoke_reason: None,
            revoked_by: None,
            version: 1,
            created_at: meta.timestamp,
            updated_at: meta.timestamp,
        };

        let event = PolicyEvent::Created(PolicyCreated {
            policy_id: id,
            name,
            rules: input.rules,
            status: PolicyStatus::Draft,
            occurred_at: meta.timestamp,
        });

        Ok((policy, Transition::new(vec![event], 1)))
    }

    /// Activate a draft policy, or resume a suspended one.
    pub fn activate(
        &mut self,
        expected_version: u64,
        meta: &CommandMetadata,
    ) -> DomainResult<Transition<PolicyEvent>> {
        check_expected_version(Self::aggregate_type(), self.version, expected_version)?;

        match self.status {
            PolicyStatus::Draft | PolicyStatus::Suspended => {}
            _ => {
                return Err(DomainError::business_rule(
                    "policy.activate.not_draft",
                    format!("cannot activate a policy that is {}", self.status.as_str()),
                ));
            }
        }

        let previous_status = self.status;
        self.status = PolicyStatus::Active;
        self.suspend_reason = None;
        self.version += 1;
        self.updated_at = meta.timestamp;

        let event = PolicyEvent::Activated(PolicyActivated {
            policy_id: self.id,
            status: self.status,
            previous_status,
            occurred_at: meta.timestamp,
        });

        Ok(Transition::new(vec![event], self.version))
    }

    /// Suspend requires a non-empty reason and an `active` policy.
    pub fn suspend(
        &mut self,
        reason: &str,
        expected_version: u64,
        meta: &CommandMetadata,
    ) -> DomainResult<Transition<PolicyEvent>> {
        check_expected_version(Self::aggregate_type(), self.version, expected_version)?;

        if self.status != PolicyStatus::Active {
            return Err(DomainError::business_rule(
                "policy.suspend.not_active",
                format!("cannot suspend a policy that is {}", self.status.as_str()),
            ));
        }

        let reason = validate_reason("policy.suspend", reason)?;

        let previous_status = self.status;
        self.status = PolicyStatus::Suspended;
        self.suspend_reason = Some(reason.clone());
        self.version += 1;
        self.updated_at = meta.timestamp;

        let event = PolicyEvent::Suspended(PolicySuspended {
            policy_id: self.id,
            reason,
            status: self.status,
            previous_status,
            occurred_at: meta.timestamp,
        });

        Ok(Transition::new(vec![event], self.version))
    }

    /// Revoke requires a reason and the revoker's id; `revoked` is
    /// terminal.
    pub fn revoke(
        &mut self,
        reason: &str,
        revoked_by: &str,
        expected_version: u64,
        meta: &CommandMetadata,
    ) -> DomainResult<Transition<PolicyEvent>> {
        check_expected_version(Self::aggregate_type(), self.version, expected_version)?;

        if self.status == PolicyStatus::Revoked {
            return Err(DomainError::business_rule(
                "policy.revoke.already_revoked",
                "policy is already revoked",
            ));
        }

        let reason = validate_reason("policy.revoke", reason)?;
        let revoked_by = revoked_by.trim();
        if revoked_by.is_empty() {
            return Err(DomainError::validation("a revoker id is required")
                .with_rule("policy.revoke.revoker_required"));
        }

        let previous_status = self.status;
        self.status = PolicyStatus::Revoked;
        self.revoke_reason = Some(reason.clone());
        self.revoked_by = Some(revoked_by.to_string());
        self.version += 1;
        self.updated_at = meta.timestamp;

        let event = PolicyEvent::Revoked(PolicyRevoked {
            policy_id: self.id,
            reason,
            revoked_by: revoked_by.to_string(),
            status: self.status,
            previous_status,
            occurred_at: meta.timestamp,
        });

        Ok(Transition::new(vec![event], self.version))
    }
}

impl AggregateRoot for Policy {
    type Id = PolicyId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn aggregate_type() -> &'static str {
        "policy"
    }
}

fn validate_name(raw: &str) -> DomainResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(
            DomainError::validation("policy name must not be empty")
                .with_rule("policy.name.required"),
        );
    }
    if trimmed.chars().count() > NAME_MAX_LEN {
        return Err(DomainError::validation(format!(
            "policy name exceeds {NAME_MAX_LEN} characters"
        ))
        .with_rule("policy.name.too_long"));
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

/// Input: create a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePolicyInput {
    pub name: String,
    pub rules: JsonValue,
}

/// Event: policy.created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyCreated {
    pub policy_id: PolicyId,
    pub name: String,
    pub rules: JsonValue,
    pub status: PolicyStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: policy.activated (from `draft` or `suspended`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyActivated {
    pub policy_id: PolicyId,
    pub status: PolicyStatus,
    pub previous_status: PolicyStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: policy.suspended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySuspended {
    pub policy_id: PolicyId,
    pub reason: String,
    pub status: PolicyStatus,
    pub previous_status: PolicyStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: policy.revoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRevoked {
    pub policy_id: PolicyId,
    pub reason: String,
    pub revoked_by: String,
    pub status: PolicyStatus,
    pub previous_status: PolicyStatus,
    pub occurred_at: DateTime<Utc>,
}

// Untagged: the payload is the bare fact. Variant order matters for
// deserialization; richer shapes come before their field subsets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicyEvent {
    Created(PolicyCreated),
    Revoked(PolicyRevoked),
    Suspended(PolicySuspended),
    Activated(PolicyActivated),
}

impl DomainEvent for PolicyEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PolicyEvent::Created(_) => "policy.created",
            PolicyEvent::Activated(_) => "policy.activated",
            PolicyEvent::Suspended(_) => "policy.suspended",
            PolicyEvent::Revoked(_) => "policy.revoked",
        }
    }

    fn schema_version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PolicyEvent::Created(e) => e.occurred_at,
            PolicyEvent::Activated(e) => e.occurred_at,
            PolicyEvent::Suspended(e) => e.occurred_at,
            PolicyEvent::Revoked(e) => e.occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_core::{Actor, ErrorKind};
    use serde_json::json;

    fn meta() -> CommandMetadata {
        CommandMetadata::new("c1", Actor::new("u1", "u1@example.com"), Utc::now())
    }

    fn draft() -> Policy {
        let (policy, _) = Policy::create(
            PolicyId::new(),
            CreatePolicyInput {
                name: "Data retention".into(),
                rules: json!({"max_age_days": 90}),
            },
            &meta(),
        )
        .unwrap();
        policy
    }

    #[test]
    fn create_starts_draft_at_version_one() {
        let policy = draft();
        assert_eq!(policy.status(), PolicyStatus::Draft);
        assert_eq!(policy.version(), 1);
    }

    #[test]
    fn rules_must_be_an_object() {
        let err = Policy::create(
            PolicyId::new(),
            CreatePolicyInput {
                name: "P".into(),
                rules: json!(["not", "an", "object"]),
            },
            &meta(),
        )
        .unwrap_err();
        assert_eq!(err.rule.as_deref(), Some("policy.rules.invalid"));
    }

    #[test]
    fn activate_from_draft() {
        let mut policy = draft();
        let transition = policy.activate(1, &meta()).unwrap();
        assert_eq!(policy.status(), PolicyStatus::Active);
        assert_eq!(transition.new_version, 2);
        match &transition.events[0] {
            PolicyEvent::Activated(e) => {
                assert_eq!(e.previous_status, PolicyStatus::Draft);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn activate_when_already_active_rejected() {
        let mut policy = draft();
        policy.activate(1, &meta()).unwrap();
        let err = policy.activate(2, &meta()).unwrap_err();
        assert_eq!(err.rule.as_deref(), Some("policy.activate.not_draft"));
    }

    #[test]
    fn suspend_and_resume() {
        let mut policy = draft();
        policy.activate(1, &meta()).unwrap();
        policy.suspend("billing dispute", 2, &meta()).unwrap();
        assert_eq!(policy.status(), PolicyStatus::Suspended);
        assert_eq!(policy.suspend_reason(), Some("billing dispute"));

        let transition = policy.activate(3, &meta()).unwrap();
        assert_eq!(policy.status(), PolicyStatus::Active);
        assert_eq!(policy.suspend_reason(), None);
        match &transition.events[0] {
            PolicyEvent::Activated(e) => {
                assert_eq!(e.previous_status, PolicyStatus::Suspended);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn suspend_requires_active() {
        let mut policy = draft();
        let err = policy.suspend("too early", 1, &meta()).unwrap_err();
        assert_eq!(err.rule.as_deref(), Some("policy.suspend.not_active"));
    }

    #[test]
    fn suspend_requires_reason() {
        let mut policy = draft();
        policy.activate(1, &meta()).unwrap();
        let err = policy.suspend("  ", 2, &meta()).unwrap_err();
        assert_eq!(err.rule.as_deref(), Some("policy.suspend.reason_required"));
    }

    #[test]
    fn revoke_from_any_non_revoked_status() {
        for activate_first in [false, true] {
            let mut policy = draft();
            let mut version = 1;
            if activate_first {
                policy.activate(version, &meta()).unwrap();
                version += 1;
            }
            policy.revoke("breach", "admin-1", version, &meta()).unwrap();
            assert_eq!(policy.status(), PolicyStatus::Revoked);
            assert_eq!(policy.revoked_by(), Some("admin-1"));
        }
    }

    #[test]
    fn revoked_is_terminal() {
        let mut policy = draft();
        policy.revoke("breach", "admin-1", 1, &meta()).unwrap();

        let err = policy.activate(2, &meta()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BusinessRule);

        let err = policy.revoke("again", "admin-1", 2, &meta()).unwrap_err();
        assert_eq!(err.rule.as_deref(), Some("policy.revoke.already_revoked"));
    }

    #[test]
    fn revoke_requires_reason_and_revoker() {
        let mut policy = draft();
        let err = policy.revoke("", "admin-1", 1, &meta()).unwrap_err();
        assert_eq!(err.rule.as_deref(), Some("policy.revoke.reason_required"));

        let err = policy.revoke("breach", "  ", 1, &meta()).unwrap_err();
        assert_eq!(err.rule.as_deref(), Some("policy.revoke.revoker_required"));
    }

    #[test]
    fn version_mismatch_takes_precedence() {
        let mut policy = draft();
        policy.revoke("breach", "admin-1", 1, &meta()).unwrap();
        // Revoked AND stale expected version: optimistic-lock wins.
        let err = policy.activate(1, &meta()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OptimisticLock);
        assert_eq!(err.rule.as_deref(), Some("policy.version.mismatch"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Activate,
            Suspend,
            Revoke,
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![Just(Op::Activate), Just(Op::Suspend), Just(Op::Revoke)]
        }

        proptest! {
            // Any sequence of operations keeps the version monotone: +1 per
            // success, unchanged per failure, no gaps.
            #[test]
            fn version_is_gapless(ops in proptest::collection::vec(op_strategy(), 0..24)) {
                let mut policy = draft();
                let mut expected = 1u64;

                for op in ops {
                    let result = match op {
                        Op::Activate => policy.activate(expected, &meta()),
                        Op::Suspend => policy.suspend("load shed", expected, &meta()),
                        Op::Revoke => policy.revoke("sweep", "admin-1", expected, &meta()),
                    };
                    match result {
                        Ok(t) => {
                            prop_assert_eq!(t.new_version, expected + 1);
                            expected += 1;
                        }
                        Err(_) => {
                            prop_assert_eq!(policy.version(), expected);
                        }
                    }
                }
                prop_assert_eq!(policy.version(), expected);
            }
        }
    }
}
