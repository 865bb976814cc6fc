//! Handler registry.
//!
//! Wiring is explicit and deterministic: each handler is constructed, then
//! registered through the builder at startup. There is no discovery and no
//! reflection; duplicate names fail loudly before the worker starts.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::handler::EventHandler;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("handler name registered twice: {0}")]
    DuplicateHandler(String),

    #[error("handler {0} subscribes to no event types")]
    NoSubscriptions(String),
}

/// Maps event type to the ordered list of subscribed handlers.
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Handlers subscribed to `event_type`, in registration order.
    ///
    /// A subscription matches exactly, or by stream when it ends in `.*`
    /// (`"policy.*"` matches `"policy.activated"`).
    pub fn handlers_for(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .iter()
            .filter(|h| {
                h.subscribed_event_types()
                    .iter()
                    .any(|sub| subscription_matches(sub, event_type))
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field(
                "handlers",
                &self.handlers.iter().map(|h| h.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn subscription_matches(subscription: &str, event_type: &str) -> bool {
    if let Some(prefix) = subscription.strip_suffix(".*") {
        event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'))
    } else {
        subscription == event_type
    }
}

/// Deterministic startup assembly for the registry.
#[derive(Default)]
pub struct RegistryBuilder {
    handlers: Vec<Arc<dyn EventHandler>>,
    names: HashSet<&'static str>,
}

impl std::fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("handlers", &self.handlers.len())
            .field("names", &self.names)
            .finish()
    }
}

impl RegistryBuilder {
    pub fn register(mut self, handler: Arc<dyn EventHandler>) -> Result<Self, RegistryError> {
        let name = handler.name();
        if !self.names.insert(name) {
            return Err(RegistryError::DuplicateHandler(name.to_string()));
        }
        if handler.subscribed_event_types().is_empty() {
            return Err(RegistryError::NoSubscriptions(name.to_string()));
        }
        debug!(
            handler = name,
            subscriptions = ?handler.subscribed_event_types(),
            "registered event handler"
        );
        self.handlers.push(handler);
        Ok(self)
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::DeliveredEvent;
    use async_trait::async_trait;
    use causeway_core::DomainResult;

    struct Probe {
        name: &'static str,
        subs: Vec<&'static str>,
    }

    #[async_trait]
    impl EventHandler for Probe {
        fn name(&self) -> &'static str {
            self.name
        }

        fn subscribed_event_types(&self) -> &[&'static str] {
            &self.subs
        }

        async fn invoke(&self, _event: &DeliveredEvent) -> DomainResult<()> {
            Ok(())
        }
    }

    fn probe(name: &'static str, subs: Vec<&'static str>) -> Arc<dyn EventHandler> {
        Arc::new(Probe { name, subs })
    }

    #[test]
    fn exact_subscription_matches() {
        let registry = HandlerRegistry::builder()
            .register(probe("audit", vec!["policy.created"]))
            .unwrap()
            .build();

        assert_eq!(registry.handlers_for("policy.created").len(), 1);
        assert!(registry.handlers_for("policy.activated").is_empty());
    }

    #[test]
    fn stream_subscription_matches_whole_aggregate() {
        let registry = HandlerRegistry::builder()
            .register(probe("audit", vec!["policy.*"]))
            .unwrap()
            .build();

        assert_eq!(registry.handlers_for("policy.created").len(), 1);
        assert_eq!(registry.handlers_for("policy.revoked").len(), 1);
        assert!(registry.handlers_for("action.created").is_empty());
        // "policy" alone is not in the stream
        assert!(registry.handlers_for("policy").is_empty());
        // prefix must respect the dot boundary
        assert!(registry.handlers_for("policyx.created").is_empty());
    }

    #[test]
    fn handlers_returned_in_registration_order() {
        let registry = HandlerRegistry::builder()
            .register(probe("audit", vec!["policy.*"]))
            .unwrap()
            .register(probe("projection", vec!["policy.*"]))
            .unwrap()
            .build();

        let names: Vec<_> = registry
            .handlers_for("policy.created")
            .iter()
            .map(|h| h.name())
            .collect();
        assert_eq!(names, vec!["audit", "projection"]);
    }

    #[test]
    fn duplicate_name_is_a_configuration_error() {
        let err = HandlerRegistry::builder()
            .register(probe("audit", vec!["policy.*"]))
            .unwrap()
            .register(probe("audit", vec!["action.*"]))
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateHandler("audit".into()));
    }

    #[test]
    fn empty_subscriptions_rejected() {
        let err = HandlerRegistry::builder()
            .register(probe("audit", vec![]))
            .unwrap_err();
        assert_eq!(err, RegistryError::NoSubscriptions("audit".into()));
    }
}
