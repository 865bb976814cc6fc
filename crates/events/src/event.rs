//! Domain event trait.

use chrono::{DateTime, Utc};

/// A domain event: an immutable fact emitted by an aggregate.
///
/// Events are versioned for schema evolution and designed to be
/// append-only. The identifier returned by `event_type()` must be stable
/// (changing it breaks deserialization of historical events), descriptive,
/// and namespaced with dot notation.
///
/// Convention: `{aggregate}.{fact}` in past tense (e.g. `policy.activated`).
/// Schema evolution is additive within a type; a breaking change mints a
/// new suffix (`policy.created.v2`) and a new handler subscription.
pub trait DomainEvent: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable dotted event name (e.g. `"action.completed"`).
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type. Starts at 1; only increases.
    fn schema_version(&self) -> u32;

    /// When the event occurred (producer time, not persistence time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
