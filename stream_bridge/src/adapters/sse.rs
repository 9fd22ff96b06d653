use super::PushEvent;
use crate::{model::SessionPlan, session::Bridge};
use futures::Stream;
use std::time::Duration;
use tokio::{
    sync::mpsc::{self, error::SendTimeoutError},
    time::sleep,
};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

#[derive(Debug, Clone)]
pub struct PushSettings {
    /// Upper bound on the whole session.
    pub deadline: Duration,
    /// Events buffered for a slow client.
    pub buffer: usize,
    /// How long a full buffer may hold up the session before the client is
    /// treated as gone.
    pub send_timeout: Duration,
}

/// Runs a session on its own task and pushes every event into a bounded
/// buffer. The returned stream ends after a terminal event. Dropping it
/// stops the task, which closes the session and releases its channel.
pub fn run_push(
    bridge: Bridge,
    plan: SessionPlan,
    settings: PushSettings,
) -> impl Stream<Item = PushEvent> + Send + 'static {
    let (tx, rx) = mpsc::channel(settings.buffer.max(1));
    let session_id = plan.session_id().to_string();

    tokio::spawn(async move {
        let events = bridge.session(plan);
        tokio::pin!(events);
        let deadline = sleep(settings.deadline);
        tokio::pin!(deadline);

        loop {
            let event = tokio::select! {
                _ = tx.closed() => {
                    tracing::info!("Push client for session {} disconnected", session_id);
                    break;
                }
                _ = &mut deadline => {
                    tracing::warn!("Push session {} hit its {:?} deadline", session_id, settings.deadline);
                    PushEvent::timeout(&session_id)
                }
                next = events.next() => match next {
                    Some(event) => PushEvent::from_session(&session_id, event),
                    None => break,
                },
            };

            let terminal = event.is_terminal();
            match tx.send_timeout(event, settings.send_timeout).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    tracing::warn!("Push client for session {} stalled, dropping session", session_id);
                    break;
                }
                Err(SendTimeoutError::Closed(_)) => break,
            }
            if terminal {
                break;
            }
        }
    });

    ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::ChannelManager,
        errors::BridgeError,
        model::{text_input, SessionHeader},
        resolver::{Endpoint, EndpointResolver},
        session::BridgeSettings,
    };
    use std::sync::Arc;
    use tonic::async_trait;

    struct EmptyResolver;

    #[async_trait]
    impl EndpointResolver for EmptyResolver {
        async fn resolve(&self, service: &str, _group: &str) -> Result<Endpoint, BridgeError> {
            Err(BridgeError::no_healthy_instance(service, "empty instance list"))
        }
    }

    #[tokio::test]
    async fn test_resolution_failure_is_pushed_as_error() {
        let bridge = Bridge::new(
            Arc::new(EmptyResolver),
            ChannelManager::new(Duration::from_millis(100)),
            BridgeSettings {
                service_name: "yolo-inference-service".to_string(),
                group: "DEFAULT_GROUP".to_string(),
                max_message_bytes: 1024,
                close_grace: Duration::from_millis(100),
            },
        );
        let plan = SessionPlan::single(
            SessionHeader::new("yolov8n", Default::default()),
            text_input("hi"),
        );
        let settings = PushSettings {
            deadline: Duration::from_secs(5),
            buffer: 4,
            send_timeout: Duration::from_secs(1),
        };

        let events: Vec<PushEvent> = run_push(bridge, plan, settings).collect().await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "error");
        assert!(events[0]
            .payload
            .message
            .contains("No healthy gRPC service instance found"));
    }
}
