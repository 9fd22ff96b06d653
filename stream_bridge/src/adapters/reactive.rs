use super::PushEvent;
use crate::{model::SessionPlan, session::Bridge};
use async_stream::stream;
use futures::Stream;
use std::time::Duration;
use tokio::time::sleep;
use tokio_stream::StreamExt;

/// A cold sequence: the session starts on first poll and each call drives
/// exactly one session. Dropping the stream cancels the session.
pub fn run_reactive(
    bridge: Bridge,
    plan: SessionPlan,
    deadline: Duration,
) -> impl Stream<Item = PushEvent> + Send + 'static {
    stream! {
        let session_id = plan.session_id().to_string();
        let events = bridge.session(plan);
        tokio::pin!(events);
        let timer = sleep(deadline);
        tokio::pin!(timer);

        loop {
            let next = tokio::select! {
                _ = &mut timer => None,
                event = events.next() => Some(event),
            };
            let event = match next {
                None => {
                    tracing::warn!("Reactive session {} hit its {:?} deadline", session_id, deadline);
                    PushEvent::timeout(&session_id)
                }
                Some(Some(event)) => PushEvent::from_session(&session_id, event),
                Some(None) => break,
            };

            let terminal = event.is_terminal();
            yield event;
            if terminal {
                break;
            }
        }
    }
}
