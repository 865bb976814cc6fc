//! Aggregate root protocol.
//!
//! An aggregate is a consistency boundary: one entity whose invariants are
//! enforced atomically. State-changing operations never touch storage; they
//! validate against in-memory state and return the events describing what
//! happened, together with the successor version. Storage and delivery are
//! someone else's job.

use serde_json::json;

use crate::error::{DomainError, DomainResult};

/// Aggregate root marker + minimal interface.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Monotonically increasing version of the aggregate's state.
    ///
    /// Starts at 1 on creation; each state-changing operation bumps it by
    /// exactly 1. The optimistic-concurrency check compares against this.
    fn version(&self) -> u64;

    /// Short stream name (e.g. `"policy"`), used for event routing and
    /// rule identifiers.
    fn aggregate_type() -> &'static str;
}

/// Result of a state-changing aggregate operation: the events recording
/// what happened and the version the aggregate now holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<E> {
    pub events: Vec<E>,
    pub new_version: u64,
}

impl<E> Transition<E> {
    pub fn new(events: Vec<E>, new_version: u64) -> Self {
        Self {
            events,
            new_version,
        }
    }

    /// An all-equal update: zero events, no version bump.
    pub fn no_op(current_version: u64) -> Self {
        Self {
            events: Vec::new(),
            new_version: current_version,
        }
    }

    pub fn is_no_op(&self) -> bool {
        self.events.is_empty()
    }
}

/// Optimistic-concurrency gate, evaluated before any business rule so a
/// stale caller always sees `optimistic-lock` rather than a masked
/// business error.
pub fn check_expected_version(
    aggregate_type: &str,
    current: u64,
    expected: u64,
) -> DomainResult<()> {
    if current == expected {
        return Ok(());
    }
    Err(DomainError::optimistic_lock(
        format!("{aggregate_type}.version.mismatch"),
        format!("expected version {expected}, found {current}"),
    )
    .with_details(json!({ "expected": expected, "found": current })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn matching_version_passes() {
        assert!(check_expected_version("action", 3, 3).is_ok());
    }

    #[test]
    fn mismatch_is_optimistic_lock_with_rule() {
        let err = check_expected_version("action", 4, 3).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OptimisticLock);
        assert_eq!(err.rule.as_deref(), Some("action.version.mismatch"));
        let details = err.details.unwrap();
        assert_eq!(details["expected"], 3);
        assert_eq!(details["found"], 4);
    }

    #[test]
    fn no_op_transition_keeps_version() {
        let t: Transition<()> = Transition::no_op(7);
        assert!(t.is_no_op());
        assert_eq!(t.new_version, 7);
    }
}
