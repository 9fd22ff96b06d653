//! Consumers of the session event stream, one per delivery model.

mod one_shot;
mod reactive;
mod sse;

pub use one_shot::{run_one_shot, OneShotOutcome};
pub use reactive::run_reactive;
pub use sse::{run_push, PushSettings};

use crate::{
    dto::InferenceResponse,
    session::{AckPhase, SessionEvent},
};
use serde::Serialize;

/// One event delivered to a push client.
#[derive(Debug, Clone, Serialize)]
pub struct PushEvent {
    pub name: &'static str,
    pub payload: InferenceResponse,
}

impl PushEvent {
    pub const ACK: &'static str = "ack";
    pub const FRAME: &'static str = "frame";
    pub const ERROR: &'static str = "error";
    pub const COMPLETED: &'static str = "completed";
    pub const TIMEOUT: &'static str = "timeout";

    pub fn new(name: &'static str, payload: InferenceResponse) -> Self {
        Self { name, payload }
    }

    pub fn from_session(session_id: &str, event: SessionEvent) -> Self {
        match event {
            SessionEvent::Ack(ack) => {
                let phase = match ack.phase {
                    AckPhase::Open => "open",
                    AckPhase::Close => "close",
                    AckPhase::Unsolicited => "ack",
                };
                Self::new(
                    Self::ACK,
                    InferenceResponse::message(session_id, phase, ack.message),
                )
            }
            SessionEvent::Frame(outcome) => Self::new(
                Self::FRAME,
                InferenceResponse::from_frame(session_id, &outcome),
            ),
            SessionEvent::Failed(error) => Self::new(
                Self::ERROR,
                InferenceResponse::failure(error.to_string())
                    .with_session(session_id)
                    .with_event_type(Self::ERROR),
            ),
            SessionEvent::Completed => Self::new(
                Self::COMPLETED,
                InferenceResponse::message(session_id, Self::COMPLETED, "Stream completed"),
            ),
        }
    }

    pub fn timeout(session_id: &str) -> Self {
        Self::new(
            Self::TIMEOUT,
            InferenceResponse::failure("Request timeout")
                .with_session(session_id)
                .with_event_type(Self::TIMEOUT),
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.name, Self::ERROR | Self::COMPLETED | Self::TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::BridgeError, session::Acknowledgement};

    #[test]
    fn test_session_events_map_to_push_events() {
        let open = PushEvent::from_session(
            "s-1",
            SessionEvent::Ack(Acknowledgement {
                code: 0,
                message: "Stream opened".to_string(),
                phase: AckPhase::Open,
            }),
        );
        let failed = PushEvent::from_session("s-1", SessionEvent::Failed(BridgeError::Timeout));

        assert_eq!(open.name, "ack");
        assert_eq!(open.payload.message, "Stream opened");
        assert_eq!(open.payload.event_type.as_deref(), Some("open"));
        assert!(!open.is_terminal());
        assert_eq!(failed.name, "error");
        assert!(!failed.payload.success);
        assert!(failed.is_terminal());
        assert!(PushEvent::timeout("s-1").is_terminal());
    }
}
