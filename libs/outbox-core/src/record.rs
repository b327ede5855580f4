//! The outbox record: the only persistent entity the engine owns.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Lifecycle state of an outbox record.
///
/// `Failed` is terminal: the record exceeded its retry budget, carries
/// `attempt_at = None`, and is never dispatched again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(OutboxStatus::Pending),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// One emitted event, persisted together with the business write that caused
/// it, carrying per-listener delivery state.
///
/// Created by the emitter inside the caller's transaction. Mutated only by
/// the processor (`delivered_to_listeners` grows; the record is deleted once
/// every listener acknowledged) and by the driver's claim operation
/// (`retry_count` increments, `attempt_at` is extended or nulled, `status`
/// may flip to `Failed`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Storage-assigned monotone id; `0` until the record is committed
    pub id: i64,

    /// Routing key; matches a configured event type
    pub event_name: String,

    /// Opaque JSON payload handed to listeners
    pub event_payload: serde_json::Value,

    /// Names of listeners that already succeeded. Stale entries (listeners
    /// since unregistered) are preserved on read.
    pub delivered_to_listeners: BTreeSet<String>,

    /// Earliest instant (epoch ms) of the next dispatch attempt;
    /// `None` iff `status == Failed`
    pub attempt_at: Option<i64>,

    /// Number of prior dispatch attempts by the poller
    pub retry_count: u32,

    pub status: OutboxStatus,

    /// Retention hint (epoch ms); never consulted on the dispatch path
    pub expire_at: i64,

    /// Creation time (epoch ms)
    pub inserted_at: i64,
}

impl OutboxRecord {
    /// Fresh, unpersisted record: `retry_count = 0`, `status = Pending`,
    /// empty delivered set. The id is assigned by storage at commit.
    pub fn new(
        event_name: impl Into<String>,
        event_payload: serde_json::Value,
        expire_at: i64,
        attempt_at: i64,
        inserted_at: i64,
    ) -> Self {
        Self {
            id: 0,
            event_name: event_name.into(),
            event_payload,
            delivered_to_listeners: BTreeSet::new(),
            attempt_at: Some(attempt_at),
            retry_count: 0,
            status: OutboxStatus::Pending,
            expire_at,
            inserted_at,
        }
    }

    /// Eligible for a dispatch attempt at `now_ms`.
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.status == OutboxStatus::Pending
            && self.attempt_at.map_or(false, |attempt_at| attempt_at <= now_ms)
    }

    pub fn is_delivered_to(&self, listener_name: &str) -> bool {
        self.delivered_to_listeners.contains(listener_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_record_is_pending_and_undelivered() {
        let record = OutboxRecord::new("order.created", json!({"order_id": 1}), 60_000, 5_000, 0);
        assert_eq!(record.id, 0);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.status, OutboxStatus::Pending);
        assert!(record.delivered_to_listeners.is_empty());
        assert_eq!(record.attempt_at, Some(5_000));
    }

    #[test]
    fn due_only_when_pending_and_deadline_elapsed() {
        let mut record = OutboxRecord::new("order.created", json!({}), 60_000, 5_000, 0);
        assert!(!record.is_due(4_999));
        assert!(record.is_due(5_000));

        record.status = OutboxStatus::Failed;
        record.attempt_at = None;
        assert!(!record.is_due(i64::MAX));
    }

    #[test]
    fn status_round_trips_as_lowercase_ascii() {
        assert_eq!(OutboxStatus::Pending.as_str(), "pending");
        assert_eq!(OutboxStatus::parse("failed"), Some(OutboxStatus::Failed));
        assert_eq!(OutboxStatus::parse("PENDING"), None);
    }
}
