/**
 * Inbound Frame Dispatch
 *
 * Turns one client text frame into hub and delivery calls. Runs on the
 * session's read loop, so frames of one session are handled strictly in
 * arrival order.
 *
 * | frame              | effect                                          |
 * |--------------------|-------------------------------------------------|
 * | `ping`             | refresh heartbeat, reply `pong`                 |
 * | `pong`             | refresh heartbeat                               |
 * | `join_room`        | add the session to the room                     |
 * | `leave_room`       | remove the session from the room                |
 * | `typing_indicator` | `typing` to the room, sender excluded           |
 * | `presence_update`  | `presence` to joined rooms and sibling sessions |
 * | `ack`              | mark the notification delivered, reply `ack`    |
 *
 * Oversize frames, unknown types and malformed data are answered with a
 * `system_message { kind: protocol_error }` and counted against the
 * session; the session stays open until it becomes a repeat offender.
 */
use crate::backend::delivery::DeliveryService;
use crate::backend::error::BackendError;
use crate::backend::realtime::hub::{Hub, SessionId};
use crate::backend::runtime::SharedClock;
use crate::shared::{Envelope, InboundFrame, UserId};

/// What the read loop should do after a frame
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Nothing to send back
    Silent,
    /// Send this envelope to the originating session only
    Reply(Envelope),
    /// The session was reaped for repeated violations
    Reaped,
}

/// Per-session context for frame handling
#[derive(Clone)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub hub: Hub,
    pub delivery: DeliveryService,
    pub clock: SharedClock,
}

impl SessionContext {
    /// Handle one inbound text frame
    pub async fn handle_text(&self, text: &str) -> FrameOutcome {
        let limit = self.hub.config().max_message_bytes;
        if text.len() > limit {
            return self
                .violation(format!("message of {} bytes exceeds {} bytes", text.len(), limit))
                .await;
        }
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => return self.violation(e.to_string()).await,
        };
        match self.dispatch(frame).await {
            Ok(Some(reply)) => FrameOutcome::Reply(reply),
            Ok(None) => FrameOutcome::Silent,
            Err(e @ BackendError::Validation { .. }) | Err(e @ BackendError::NotFound { .. }) => {
                FrameOutcome::Reply(Envelope::protocol_error(e.message(), self.clock.now()))
            }
            Err(e) => {
                tracing::warn!(
                    "[Hub] Frame from session {} failed: {}",
                    self.session_id,
                    e.message()
                );
                FrameOutcome::Reply(Envelope::system_message(
                    "error",
                    serde_json::Value::String(e.message()),
                    self.clock.now(),
                ))
            }
        }
    }

    /// A binary frame is always a violation
    pub async fn handle_binary(&self) -> FrameOutcome {
        self.violation("binary frames are not supported").await
    }

    async fn violation(&self, detail: impl Into<String>) -> FrameOutcome {
        let detail = detail.into();
        tracing::debug!("[Hub] Protocol violation on session {}: {}", self.session_id, detail);
        match self.hub.record_violation(self.session_id).await {
            Ok(true) => FrameOutcome::Reaped,
            Ok(false) => FrameOutcome::Reply(Envelope::protocol_error(detail, self.clock.now())),
            Err(e) => {
                tracing::warn!("[Hub] Could not count violation: {}", e.message());
                FrameOutcome::Reply(Envelope::protocol_error(detail, self.clock.now()))
            }
        }
    }

    async fn dispatch(&self, frame: InboundFrame) -> Result<Option<Envelope>, BackendError> {
        match frame {
            InboundFrame::Ping => {
                self.hub.touch(self.session_id).await;
                Ok(Some(Envelope::pong(self.clock.now())))
            }
            InboundFrame::Pong => {
                self.hub.touch(self.session_id).await;
                Ok(None)
            }
            InboundFrame::JoinRoom { room } => {
                self.hub.join_room(self.session_id, &room).await?;
                Ok(None)
            }
            InboundFrame::LeaveRoom { room } => {
                self.hub.leave_room(self.session_id, &room).await?;
                Ok(None)
            }
            InboundFrame::TypingIndicator { room, is_typing } => {
                self.delivery.typing(self.user_id, &room, is_typing).await;
                Ok(None)
            }
            InboundFrame::PresenceUpdate { status } => {
                self.delivery
                    .presence(self.user_id, status, Some(self.session_id))
                    .await?;
                Ok(None)
            }
            InboundFrame::Ack { notification_id } => {
                self.delivery.acknowledge(self.user_id, notification_id).await?;
                Ok(Some(Envelope::ack(notification_id, self.clock.now())))
            }
        }
    }
}
