//! Listener contract and the name-keyed registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{OutboxError, OutboxResult};

/// Named consumer of a single event type. Invoked at-least-once per emit
/// until its name is recorded in the record's delivered set or the record
/// dead-letters.
#[async_trait]
pub trait OutboxListener: Send + Sync {
    /// Stable identifier recorded in `delivered_to_listeners`.
    fn name(&self) -> &str;

    async fn handle(&self, payload: &Value, event_name: &str) -> anyhow::Result<()>;
}

/// Maps event name to its ordered set of listeners.
///
/// Mutable at runtime; mutations serialize on the inner lock and readers get
/// a stable snapshot per call. Registration order is observable and stable
/// but is not a delivery-ordering guarantee.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<String, Vec<Arc<dyn OutboxListener>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends; fails with `DuplicateListenerName` when a listener with the
    /// same name is already registered for that event.
    pub fn add(&self, event_name: &str, listener: Arc<dyn OutboxListener>) -> OutboxResult<()> {
        let mut map = self.listeners.write();
        let entry = map.entry(event_name.to_string()).or_default();
        if entry.iter().any(|existing| existing.name() == listener.name()) {
            return Err(OutboxError::DuplicateListenerName {
                event: event_name.to_string(),
                listener: listener.name().to_string(),
            });
        }
        entry.push(listener);
        Ok(())
    }

    pub fn remove_all(&self, event_name: &str) {
        self.listeners.write().remove(event_name);
    }

    /// Snapshot of the listeners for `event_name`, in registration order.
    pub fn get(&self, event_name: &str) -> Vec<Arc<dyn OutboxListener>> {
        self.listeners
            .read()
            .get(event_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.listeners.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedListener(&'static str);

    #[async_trait]
    impl OutboxListener for NamedListener {
        fn name(&self) -> &str {
            self.0
        }

        async fn handle(&self, _payload: &Value, _event_name: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn listeners_are_returned_in_registration_order() {
        let registry = ListenerRegistry::new();
        registry.add("order.created", Arc::new(NamedListener("audit"))).unwrap();
        registry.add("order.created", Arc::new(NamedListener("billing"))).unwrap();
        registry.add("order.created", Arc::new(NamedListener("shipping"))).unwrap();

        let names: Vec<String> = registry
            .get("order.created")
            .iter()
            .map(|listener| listener.name().to_string())
            .collect();
        assert_eq!(names, ["audit", "billing", "shipping"]);
    }

    #[test]
    fn duplicate_listener_name_is_rejected() {
        let registry = ListenerRegistry::new();
        registry.add("order.created", Arc::new(NamedListener("audit"))).unwrap();
        let err = registry
            .add("order.created", Arc::new(NamedListener("audit")))
            .unwrap_err();
        assert!(matches!(err, OutboxError::DuplicateListenerName { .. }));

        // Same name under another event is fine.
        registry.add("order.cancelled", Arc::new(NamedListener("audit"))).unwrap();
    }

    #[test]
    fn remove_all_clears_one_event_only() {
        let registry = ListenerRegistry::new();
        registry.add("order.created", Arc::new(NamedListener("audit"))).unwrap();
        registry.add("order.cancelled", Arc::new(NamedListener("audit"))).unwrap();

        registry.remove_all("order.created");
        assert!(registry.get("order.created").is_empty());
        assert_eq!(registry.get("order.cancelled").len(), 1);
        assert_eq!(registry.event_names(), ["order.cancelled"]);
    }
}
