//! Outbox entries and the typed event payload they carry.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{CheckoutId, EventId, ReservationId, UserId, to_millis};
use serde::{Deserialize, Serialize};

use crate::reservation::ReservationLine;

/// Bus topic of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "reservation.held")]
    ReservationHeld,
    #[serde(rename = "reservation.committed")]
    ReservationCommitted,
    #[serde(rename = "reservation.released")]
    ReservationReleased,
    #[serde(rename = "reservation.expired")]
    ReservationExpired,
    #[serde(rename = "order.created")]
    OrderCreated,
    #[serde(rename = "order.failed")]
    OrderFailed,
    #[serde(rename = "stock.received")]
    StockReceived,
    /// A failed checkout whose reservation was committed anyway; stock and
    /// payment need manual reconciliation.
    #[serde(rename = "reservation.repair_needed")]
    ReservationRepairNeeded,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ReservationHeld => "reservation.held",
            Topic::ReservationCommitted => "reservation.committed",
            Topic::ReservationReleased => "reservation.released",
            Topic::ReservationExpired => "reservation.expired",
            Topic::OrderCreated => "order.created",
            Topic::OrderFailed => "order.failed",
            Topic::StockReceived => "stock.received",
            Topic::ReservationRepairNeeded => "reservation.repair_needed",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reservation.held" => Ok(Topic::ReservationHeld),
            "reservation.committed" => Ok(Topic::ReservationCommitted),
            "reservation.released" => Ok(Topic::ReservationReleased),
            "reservation.expired" => Ok(Topic::ReservationExpired),
            "order.created" => Ok(Topic::OrderCreated),
            "order.failed" => Ok(Topic::OrderFailed),
            "stock.received" => Ok(Topic::StockReceived),
            "reservation.repair_needed" => Ok(Topic::ReservationRepairNeeded),
            other => Err(format!("unknown topic {other:?}")),
        }
    }
}

/// JSON body of every published event.
///
/// Absent fields are omitted on the wire; unknown fields are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventPayload {
    pub event_id: EventId,
    /// UTC epoch milliseconds.
    pub occurred_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<ReservationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkout_id: Option<CheckoutId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<Vec<ReservationLine>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EventPayload {
    /// Starts a payload with a fresh event id.
    pub fn new(occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_id: EventId::new(),
            occurred_at: to_millis(occurred_at),
            reservation_id: None,
            checkout_id: None,
            order_id: None,
            user_id: None,
            lines: None,
            reason: None,
        }
    }

    pub fn reservation(mut self, id: ReservationId) -> Self {
        self.reservation_id = Some(id);
        self
    }

    pub fn checkout(mut self, id: CheckoutId) -> Self {
        self.checkout_id = Some(id);
        self
    }

    pub fn order(mut self, id: impl Into<String>) -> Self {
        self.order_id = Some(id.into());
        self
    }

    pub fn user(mut self, id: UserId) -> Self {
        self.user_id = Some(id);
        self
    }

    pub fn lines(mut self, lines: Vec<ReservationLine>) -> Self {
        self.lines = Some(lines);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Serializes the payload into an entry for `topic` partitioned by `key`.
    pub fn into_entry(
        self,
        topic: Topic,
        key: impl Into<String>,
    ) -> Result<NewOutboxEntry, serde_json::Error> {
        Ok(NewOutboxEntry {
            topic,
            key: key.into(),
            payload: serde_json::to_vec(&self)?,
        })
    }

    /// Parses a payload back from its wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// An entry to append; the store assigns `seq` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxEntry {
    pub topic: Topic,
    /// Bus partition key: the reservation or checkout id.
    pub key: String,
    pub payload: Vec<u8>,
}

/// A persisted outbox entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    /// Dense, gap-free sequence number starting at 1.
    pub seq: i64,
    pub topic: Topic,
    pub key: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    pub fn is_dispatched(&self) -> bool {
        self.dispatched_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_match_bus_topics() {
        for topic in [
            Topic::ReservationHeld,
            Topic::ReservationCommitted,
            Topic::ReservationReleased,
            Topic::ReservationExpired,
            Topic::OrderCreated,
            Topic::OrderFailed,
            Topic::StockReceived,
            Topic::ReservationRepairNeeded,
        ] {
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
            let json = serde_json::to_string(&topic).unwrap();
            assert_eq!(json, format!("\"{}\"", topic.as_str()));
        }
    }

    #[test]
    fn payload_omits_absent_fields() {
        let reservation_id = ReservationId::new();
        let payload = EventPayload::new(Utc::now())
            .reservation(reservation_id)
            .lines(vec![ReservationLine::new("A", 2)]);
        let value: serde_json::Value =
            serde_json::from_slice(&serde_json::to_vec(&payload).unwrap()).unwrap();

        assert_eq!(value["reservation_id"], reservation_id.to_string());
        assert_eq!(value["lines"][0]["qty"], 2);
        assert!(value.get("checkout_id").is_none());
        assert!(value.get("reason").is_none());
    }

    #[test]
    fn payload_rejects_unknown_fields() {
        let raw = format!(
            r#"{{"event_id":"{}","occurred_at":1,"metadata":{{}}}}"#,
            EventId::new()
        );
        assert!(EventPayload::from_bytes(raw.as_bytes()).is_err());
    }

    #[test]
    fn into_entry_keeps_key_and_topic() {
        let checkout_id = CheckoutId::new();
        let entry = EventPayload::new(Utc::now())
            .checkout(checkout_id)
            .reason("payment declined")
            .into_entry(Topic::OrderFailed, checkout_id.to_string())
            .unwrap();

        assert_eq!(entry.topic, Topic::OrderFailed);
        assert_eq!(entry.key, checkout_id.to_string());
        let decoded = EventPayload::from_bytes(&entry.payload).unwrap();
        assert_eq!(decoded.reason.as_deref(), Some("payment declined"));
    }
}
