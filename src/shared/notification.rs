//! Notification records and delivery analytics.
//!
//! A notification is the durable trace of a delivery. It is written before
//! the push is attempted so a user who is offline can pick it up later from
//! the inbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::shared::envelope::{Envelope, EnvelopeType};
use crate::shared::error::SharedError;
use crate::shared::UserId;

/// A per-user inbox entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: UserId,
    pub kind: String,
    pub title: String,
    pub body: String,
    /// Opaque caller data, never introspected by the delivery path
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn new(
        user_id: UserId,
        kind: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        data: Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind: kind.into(),
            title: title.into(),
            body: body.into(),
            data,
            created_at,
            read_at: None,
            delivered_at: None,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }

    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }

    /// The `notification` envelope pushed to live sessions.
    ///
    /// `payload.id` is the record id, which is what clients echo back in
    /// their `ack` frame.
    pub fn to_envelope(&self, at: DateTime<Utc>) -> Envelope {
        let payload = serde_json::to_value(self).unwrap_or(Value::Null);
        Envelope::new(EnvelopeType::Notification, payload, at)
    }
}

/// Append-only delivery analytics event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsEvent {
    Sent,
    Delivered,
    Opened,
    Failed,
}

impl AnalyticsEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Opened => "opened",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for AnalyticsEvent {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "opened" => Ok(Self::Opened),
            "failed" => Ok(Self::Failed),
            other => Err(SharedError::validation(
                "event",
                format!("unknown analytics event: {}", other),
            )),
        }
    }
}

/// Event counts for one notification
pub type AnalyticsCounts = BTreeMap<AnalyticsEvent, u64>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_carries_record_id() {
        let now = Utc::now();
        let n = Notification::new(7, "order", "Shipped", "on its way", json!({"id": 42}), now);
        let env = n.to_envelope(now);
        assert_eq!(env.kind, EnvelopeType::Notification);
        assert_eq!(env.payload["id"], json!(n.id));
        assert_eq!(env.payload["data"]["id"], 42);
    }

    #[test]
    fn test_analytics_counts_serialize_as_names() {
        let mut counts = AnalyticsCounts::new();
        counts.insert(AnalyticsEvent::Sent, 1);
        counts.insert(AnalyticsEvent::Delivered, 2);
        let json = serde_json::to_value(&counts).unwrap();
        assert_eq!(json, json!({"sent": 1, "delivered": 2}));
    }

    #[test]
    fn test_event_round_trip_names() {
        for event in [
            AnalyticsEvent::Sent,
            AnalyticsEvent::Delivered,
            AnalyticsEvent::Opened,
            AnalyticsEvent::Failed,
        ] {
            assert_eq!(event.as_str().parse::<AnalyticsEvent>().unwrap(), event);
        }
    }
}
