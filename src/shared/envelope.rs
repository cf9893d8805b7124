/**
 * Realtime Envelopes and Inbound Frames
 *
 * Everything that travels over a hub session is one of two shapes:
 *
 * - `Envelope` - server → client. `{type, payload, server_ts}` where
 *   `server_ts` is RFC3339.
 * - `InboundFrame` - client → server. `{type, data}`.
 *
 * Envelopes are immutable once built; the hub clones them into every
 * target session's queue.
 */
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::shared::error::SharedError;

/// Type of an outbound envelope
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Notification,
    LiveUpdate,
    SystemMessage,
    Typing,
    Presence,
    DataUpdate,
    Ping,
    Pong,
    Ack,
}

impl EnvelopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Notification => "notification",
            Self::LiveUpdate => "live_update",
            Self::SystemMessage => "system_message",
            Self::Typing => "typing",
            Self::Presence => "presence",
            Self::DataUpdate => "data_update",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Ack => "ack",
        }
    }
}

/// A typed message frame pushed to a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Envelope type
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    /// Opaque payload
    pub payload: Value,
    /// Time the server built the envelope
    pub server_ts: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: EnvelopeType, payload: Value, server_ts: DateTime<Utc>) -> Self {
        Self {
            kind,
            payload,
            server_ts,
        }
    }

    pub fn ping(at: DateTime<Utc>) -> Self {
        Self::new(EnvelopeType::Ping, Value::Null, at)
    }

    pub fn pong(at: DateTime<Utc>) -> Self {
        Self::new(EnvelopeType::Pong, Value::Null, at)
    }

    /// A `system_message` carrying a machine-readable `kind`
    pub fn system_message(kind: &str, detail: Value, at: DateTime<Utc>) -> Self {
        Self::new(
            EnvelopeType::SystemMessage,
            json!({ "kind": kind, "detail": detail }),
            at,
        )
    }

    /// The reply a session gets for a frame the hub refused
    pub fn protocol_error(detail: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::system_message("protocol_error", Value::String(detail.into()), at)
    }

    pub fn typing(user_id: i64, room: &str, is_typing: bool, at: DateTime<Utc>) -> Self {
        Self::new(
            EnvelopeType::Typing,
            json!({ "user_id": user_id, "room": room, "is_typing": is_typing }),
            at,
        )
    }

    pub fn presence(user_id: i64, status: PresenceStatus, at: DateTime<Utc>) -> Self {
        Self::new(
            EnvelopeType::Presence,
            json!({ "user_id": user_id, "status": status }),
            at,
        )
    }

    pub fn live_update(kind: &str, payload: Value, at: DateTime<Utc>) -> Self {
        Self::new(
            EnvelopeType::LiveUpdate,
            json!({ "kind": kind, "data": payload }),
            at,
        )
    }

    pub fn data_update(kind: &str, payload: Value, at: DateTime<Utc>) -> Self {
        Self::new(
            EnvelopeType::DataUpdate,
            json!({ "kind": kind, "data": payload }),
            at,
        )
    }

    /// Confirmation that an inbound `ack` was recorded
    pub fn ack(notification_id: Uuid, at: DateTime<Utc>) -> Self {
        Self::new(
            EnvelopeType::Ack,
            json!({ "notification_id": notification_id }),
            at,
        )
    }

    pub fn to_json(&self) -> Result<String, SharedError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// User presence status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
    Away,
    Busy,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Away => "away",
            Self::Busy => "busy",
        }
    }
}

impl std::str::FromStr for PresenceStatus {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "away" => Ok(Self::Away),
            "busy" => Ok(Self::Busy),
            other => Err(SharedError::validation(
                "status",
                format!("unknown presence status: {}", other),
            )),
        }
    }
}

/// A frame sent by a client over its session
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Ping,
    Pong,
    JoinRoom { room: String },
    LeaveRoom { room: String },
    TypingIndicator { room: String, is_typing: bool },
    PresenceUpdate { status: PresenceStatus },
    Ack { notification_id: Uuid },
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct RoomData {
    room: String,
}

#[derive(Deserialize)]
struct TypingData {
    room: String,
    is_typing: bool,
}

#[derive(Deserialize)]
struct PresenceData {
    status: PresenceStatus,
}

#[derive(Deserialize)]
struct AckData {
    #[serde(alias = "id")]
    notification_id: Uuid,
}

impl InboundFrame {
    /// Decode a `{type, data}` text frame
    ///
    /// Unknown types and malformed `data` both come back as
    /// `SharedError::ProtocolError` so the hub can answer with a
    /// `protocol_error` system message.
    pub fn parse(text: &str) -> Result<Self, SharedError> {
        let raw: RawFrame = serde_json::from_str(text)
            .map_err(|e| SharedError::protocol(format!("invalid frame: {}", e)))?;

        fn data<T: serde::de::DeserializeOwned>(kind: &str, value: Value) -> Result<T, SharedError> {
            serde_json::from_value(value)
                .map_err(|e| SharedError::protocol(format!("invalid {} data: {}", kind, e)))
        }

        match raw.kind.as_str() {
            "ping" => Ok(Self::Ping),
            "pong" => Ok(Self::Pong),
            "join_room" => {
                let RoomData { room } = data(&raw.kind, raw.data)?;
                Ok(Self::JoinRoom { room })
            }
            "leave_room" => {
                let RoomData { room } = data(&raw.kind, raw.data)?;
                Ok(Self::LeaveRoom { room })
            }
            "typing_indicator" => {
                let TypingData { room, is_typing } = data(&raw.kind, raw.data)?;
                Ok(Self::TypingIndicator { room, is_typing })
            }
            "presence_update" => {
                let PresenceData { status } = data(&raw.kind, raw.data)?;
                Ok(Self::PresenceUpdate { status })
            }
            "ack" => {
                let AckData { notification_id } = data(&raw.kind, raw.data)?;
                Ok(Self::Ack { notification_id })
            }
            other => Err(SharedError::protocol(format!("unknown frame type: {}", other))),
        }
    }
}
