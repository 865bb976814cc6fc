//! Caller context value types.
//!
//! Transport and authentication are out of scope; callers arrive as an
//! opaque context of correlation id, causation id, and actor identity.
//! These are plain values. Propagation across task boundaries lives in
//! `causeway_infra::context`, which binds a `RequestContext` into
//! task-local storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The identity on whose behalf a command or event is processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub account_id: Option<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            account_id: None,
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// Sentinel actor for background processing where event metadata
    /// carries no caller identity.
    pub fn system() -> Self {
        Self::new("system", "system")
    }

    pub fn is_system(&self) -> bool {
        self.id == "system"
    }
}

/// Correlation/causation/actor triple visible to everything a request
/// touches, synchronously or asynchronously.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Shared by all events and logs triggered by one original request.
    pub correlation_id: String,
    /// Id of the command or event that caused the current work.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub causation_id: Option<String>,
    pub actor: Actor,
}

impl RequestContext {
    pub fn new(correlation_id: impl Into<String>, actor: Actor) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            causation_id: None,
            actor,
        }
    }

    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }
}

/// Caller metadata attached to every command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMetadata {
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub causation_id: Option<String>,
    pub actor: Actor,
    pub timestamp: DateTime<Utc>,
    /// Test-fixture flag: downstream fault injectors only arm for events
    /// whose metadata carries it. Never set on the production path.
    #[serde(default)]
    pub simulate_failure: bool,
}

impl CommandMetadata {
    pub fn new(correlation_id: impl Into<String>, actor: Actor, timestamp: DateTime<Utc>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            causation_id: None,
            actor,
            timestamp,
            simulate_failure: false,
        }
    }

    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn with_simulated_failure(mut self) -> Self {
        self.simulate_failure = true;
        self
    }

    pub fn context(&self) -> RequestContext {
        RequestContext {
            correlation_id: self.correlation_id.clone(),
            causation_id: self.causation_id.clone(),
            actor: self.actor.clone(),
        }
    }
}
