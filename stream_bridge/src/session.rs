use crate::{
    channel::ChannelManager,
    decoder::{decode_frame_result, FrameOutcome},
    errors::BridgeError,
    model::SessionPlan,
    resolver::EndpointResolver,
};
use async_stream::stream;
use futures::Stream;
use std::{sync::Arc, time::Duration, time::SystemTime};
use stream_proto::{
    prost_types::Timestamp, stream_response, wkt, SessionMachine, StreamFrame, StreamRequest,
    StreamResponse,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_stream::wrappers::ReceiverStream;
use tonic::Code;

const OUTBOUND_BUFFER: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPhase {
    Open,
    Close,
    Unsolicited,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Acknowledgement {
    pub code: i32,
    pub message: String,
    pub phase: AckPhase,
}

impl Acknowledgement {
    pub fn is_success(&self) -> bool {
        self.code == Code::Ok as i32
    }
}

/// What a session reports to its adapter, in arrival order. `Failed` and
/// `Completed` are terminal and nothing follows them.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Ack(Acknowledgement),
    Frame(FrameOutcome),
    Failed(BridgeError),
    Completed,
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Failed(_) | SessionEvent::Completed)
    }
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub service_name: String,
    pub group: String,
    pub max_message_bytes: usize,
    pub close_grace: Duration,
}

/// Runs bridged sessions. Cheap to clone; every clone shares the resolver
/// and the channel accounting.
#[derive(Clone)]
pub struct Bridge {
    resolver: Arc<dyn EndpointResolver>,
    channels: ChannelManager,
    settings: Arc<BridgeSettings>,
}

impl Bridge {
    pub fn new(
        resolver: Arc<dyn EndpointResolver>,
        channels: ChannelManager,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            resolver,
            channels,
            settings: Arc::new(settings),
        }
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    /// Lazily runs one session for `plan`. Nothing happens until the stream
    /// is polled, and dropping it tears the session down and releases its
    /// channel.
    pub fn session(&self, plan: SessionPlan) -> impl Stream<Item = SessionEvent> + Send + 'static {
        let bridge = self.clone();

        stream! {
            let session_id = plan.session_id().to_string();
            let settings = bridge.settings.clone();

            let endpoint = match bridge
                .resolver
                .resolve(&settings.service_name, &settings.group)
                .await
            {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    tracing::warn!("Session {} could not resolve a backend: {}", session_id, e);
                    yield SessionEvent::Failed(e);
                    return;
                }
            };

            let mut channel = match bridge.channels.open(&endpoint, settings.max_message_bytes).await {
                Ok(channel) => channel,
                Err(e) => {
                    yield SessionEvent::Failed(e);
                    return;
                }
            };
            tracing::info!("Session {} started against {}", session_id, endpoint);

            let expected: Vec<usize> = plan.frames.iter().map(Vec::len).collect();
            let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
            let (results_tx, results_rx) = watch::channel(0usize);
            let (close_tx, close_rx) = watch::channel(false);
            let _sender = AbortOnDrop(tokio::spawn(send_session(
                tx,
                plan,
                results_rx,
                close_tx,
                settings.close_grace,
            )));

            let mut inbound = match channel.client.stream(ReceiverStream::new(rx)).await {
                Ok(response) => response.into_inner(),
                Err(status) => {
                    yield SessionEvent::Failed(status.into());
                    bridge.channels.close(channel);
                    return;
                }
            };

            let mut tracker = InboundTracker::new(expected, close_rx);
            loop {
                let event = match inbound.message().await {
                    Ok(Some(response)) => match tracker.accept(response) {
                        Some(event) => event,
                        None => continue,
                    },
                    Ok(None) => SessionEvent::Completed,
                    Err(status) => {
                        tracing::error!("Session {} stream error: {}", session_id, status);
                        SessionEvent::Failed(status.into())
                    }
                };
                results_tx.send_replace(tracker.frames_seen());

                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    break;
                }
            }

            tracing::info!(
                "Session {} finished with {} frame results",
                session_id,
                tracker.frames_seen()
            );
            bridge.channels.close(channel);
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Outbound half of a session: open, paced frames, then close once the
/// results are in or `close_grace` has passed.
async fn send_session(
    tx: mpsc::Sender<StreamRequest>,
    plan: SessionPlan,
    mut results: watch::Receiver<usize>,
    close_sent: watch::Sender<bool>,
    close_grace: Duration,
) {
    let session_id = plan.session_id().to_string();
    if let Err(e) = drive_outbound(&tx, plan, &mut results, &close_sent, close_grace).await {
        tracing::warn!("Session {} stopped sending: {}", session_id, e);
    }
}

async fn drive_outbound(
    tx: &mpsc::Sender<StreamRequest>,
    plan: SessionPlan,
    results: &mut watch::Receiver<usize>,
    close_sent: &watch::Sender<bool>,
    close_grace: Duration,
) -> Result<(), BridgeError> {
    let mut machine = SessionMachine::new();
    let interval = plan.frame_interval;

    machine.open().map_err(protocol)?;
    send(tx, StreamRequest::open(plan.header.to_proto())).await?;

    for (index, inputs) in plan.frames.into_iter().enumerate() {
        if index > 0 && !interval.is_zero() {
            sleep(interval).await;
        }
        machine.frame().map_err(protocol)?;
        let frame = StreamFrame {
            frame_index: index as u64,
            ts: Some(Timestamp::from(SystemTime::now())),
            inputs,
        };
        send(tx, StreamRequest::frame(frame)).await?;
    }

    let sent = machine.frames() as usize;
    let arrived = timeout(close_grace, async {
        results.wait_for(|seen| *seen >= sent).await.is_ok()
    })
    .await
    .unwrap_or(false);
    if !arrived {
        tracing::warn!("Closing session before all {} frame results arrived", sent);
    }

    machine.close();
    close_sent.send_replace(true);
    let meta = wkt::fields([("frames_sent", wkt::number(sent as f64))]);
    send(tx, StreamRequest::close(Some(meta))).await
}

async fn send(tx: &mpsc::Sender<StreamRequest>, request: StreamRequest) -> Result<(), BridgeError> {
    tx.send(request)
        .await
        .map_err(|_| BridgeError::Stream("outbound stream closed".to_string()))
}

fn protocol(violation: stream_proto::ProtocolViolation) -> BridgeError {
    BridgeError::Protocol(violation.to_string())
}

/// Classifies inbound messages. The first acknowledgement answers the open,
/// an acknowledgement after the close was sent answers the close.
struct InboundTracker {
    opened: bool,
    close_acked: bool,
    expected: Vec<usize>,
    frames_seen: usize,
    close_sent: watch::Receiver<bool>,
}

impl InboundTracker {
    fn new(expected: Vec<usize>, close_sent: watch::Receiver<bool>) -> Self {
        Self {
            opened: false,
            close_acked: false,
            expected,
            frames_seen: 0,
            close_sent,
        }
    }

    fn frames_seen(&self) -> usize {
        self.frames_seen
    }

    fn accept(&mut self, response: StreamResponse) -> Option<SessionEvent> {
        match response.event {
            Some(stream_response::Event::Ack(ack)) => {
                let status = ack.status.unwrap_or_default();
                Some(self.accept_ack(status.code, status.message))
            }
            Some(stream_response::Event::Frame(mut result)) => {
                if !self.opened {
                    return Some(SessionEvent::Failed(BridgeError::Protocol(
                        "frame result received before open acknowledgement".to_string(),
                    )));
                }
                if self.close_acked {
                    tracing::warn!("Dropping frame result {} received after close", result.frame_index);
                    return None;
                }
                let Some(&inputs) = self.expected.get(result.frame_index as usize) else {
                    tracing::warn!("Dropping result for unknown frame {}", result.frame_index);
                    return None;
                };

                // Envelopes are matched by input index; one input may yield several.
                let before = result.results.len();
                result.results.retain(|e| (e.input_index as usize) < inputs);
                if result.results.len() < before {
                    tracing::warn!(
                        "Frame {} carried {} envelopes outside its {} inputs, dropped",
                        result.frame_index,
                        before - result.results.len(),
                        inputs
                    );
                }

                self.frames_seen += 1;
                Some(SessionEvent::Frame(decode_frame_result(result)))
            }
            None => {
                tracing::warn!("Ignoring StreamResponse without an event");
                None
            }
        }
    }

    fn accept_ack(&mut self, code: i32, message: String) -> SessionEvent {
        if code == Code::Internal as i32 {
            return SessionEvent::Failed(BridgeError::Internal(message));
        }
        if code == Code::InvalidArgument as i32 {
            return SessionEvent::Failed(BridgeError::InvalidArgument(message));
        }
        if code != Code::Ok as i32 {
            return SessionEvent::Failed(BridgeError::Protocol(format!(
                "backend rejected the session (code {}): {}",
                code, message
            )));
        }

        let phase = if !self.opened {
            self.opened = true;
            AckPhase::Open
        } else if *self.close_sent.borrow() && !self.close_acked {
            self.close_acked = true;
            AckPhase::Close
        } else {
            AckPhase::Unsolicited
        };
        SessionEvent::Ack(Acknowledgement {
            code,
            message,
            phase,
        })
    }
}
