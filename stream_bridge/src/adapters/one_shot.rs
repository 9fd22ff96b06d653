use crate::{
    decoder::FrameOutcome,
    errors::BridgeError,
    model::SessionPlan,
    session::{Acknowledgement, Bridge, SessionEvent},
};
use std::time::Duration;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tracing::instrument;

#[derive(Debug, Clone)]
pub struct OneShotOutcome {
    pub session_id: String,
    pub acks: Vec<Acknowledgement>,
    pub frame: FrameOutcome,
}

/// Runs a single-frame session and waits, at most `deadline`, for its
/// result. On timeout the session is dropped, which releases its channel.
#[instrument(skip(bridge, plan), fields(session_id = %plan.session_id()))]
pub async fn run_one_shot(
    bridge: &Bridge,
    plan: SessionPlan,
    deadline: Duration,
) -> Result<OneShotOutcome, BridgeError> {
    let session_id = plan.session_id().to_string();
    let events = bridge.session(plan);

    match timeout(deadline, collect_first_frame(events)).await {
        Ok(result) => result.map(|(acks, frame)| OneShotOutcome {
            session_id,
            acks,
            frame,
        }),
        Err(_) => {
            tracing::warn!("One-shot session timed out after {:?}", deadline);
            Err(BridgeError::Timeout)
        }
    }
}

async fn collect_first_frame(
    events: impl tokio_stream::Stream<Item = SessionEvent>,
) -> Result<(Vec<Acknowledgement>, FrameOutcome), BridgeError> {
    tokio::pin!(events);
    let mut acks = Vec::new();
    let mut first = None;

    while let Some(event) = events.next().await {
        match event {
            SessionEvent::Ack(ack) => acks.push(ack),
            SessionEvent::Frame(outcome) => {
                if first.is_none() {
                    first = Some(outcome);
                }
            }
            SessionEvent::Failed(error) => return Err(error),
            SessionEvent::Completed => break,
        }
    }

    first
        .map(|frame| (acks, frame))
        .ok_or_else(|| BridgeError::Protocol("No response received from inference service".to_string()))
}
