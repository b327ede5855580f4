//! Transient values handed to middlewares, filters, and listeners.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::error::OutboxResult;
use crate::record::OutboxRecord;

/// An event on its way into the outbox. `before_emit` middlewares may
/// transform it before the record is built; persistence always stores the
/// erased JSON form.
#[derive(Debug, Clone)]
pub struct EmittedEvent {
    pub name: String,
    pub payload: serde_json::Value,
}

impl EmittedEvent {
    /// Erase a typed payload to its JSON form.
    pub fn new(name: impl Into<String>, payload: &impl Serialize) -> OutboxResult<Self> {
        Ok(Self {
            name: name.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn from_value(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Per-listener invocation context. Built by the processor, passed to
/// pipeline hooks and exception filters; never persisted.
#[derive(Debug, Clone)]
pub struct OutboxEventContext {
    pub event_name: String,
    pub event_payload: serde_json::Value,
    pub event_id: i64,
    pub listener_name: String,
}

/// Delivered once per record that transitioned to `Failed` during a claim
/// cycle.
#[derive(Debug, Clone)]
pub struct DeadLetterContext {
    pub event_name: String,
    pub event_payload: serde_json::Value,
    pub event_id: i64,
    pub retry_count: u32,
    pub delivered_to_listeners: BTreeSet<String>,
}

impl DeadLetterContext {
    pub fn from_record(record: &OutboxRecord) -> Self {
        Self {
            event_name: record.event_name.clone(),
            event_payload: record.event_payload.clone(),
            event_id: record.id,
            retry_count: record.retry_count,
            delivered_to_listeners: record.delivered_to_listeners.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct OrderCreated {
        order_id: u64,
    }

    #[test]
    fn typed_payload_erases_to_json() {
        let event = EmittedEvent::new("order.created", &OrderCreated { order_id: 7 }).unwrap();
        assert_eq!(event.name, "order.created");
        assert_eq!(event.payload, json!({"order_id": 7}));
    }

    #[test]
    fn dead_letter_context_captures_delivery_state() {
        let mut record = OutboxRecord::new("order.created", json!({}), 1, 1, 0);
        record.id = 42;
        record.retry_count = 3;
        record.delivered_to_listeners.insert("audit".to_string());

        let ctx = DeadLetterContext::from_record(&record);
        assert_eq!(ctx.event_id, 42);
        assert_eq!(ctx.retry_count, 3);
        assert!(ctx.delivered_to_listeners.contains("audit"));
    }
}
