use crate::frame_processor::{FrameContext, FrameProcessor};
use std::sync::Arc;
use stream_proto::{
    stream_request::Event, SessionMachine, SessionState, StreamClose, StreamFrame, StreamOpen,
    StreamRequest, StreamResponse,
};
use tonic::Code;
use tracing::Span;

/// What the server sends back for one inbound message, and whether the
/// response stream ends afterwards.
#[derive(Debug, Default)]
pub struct Step {
    pub responses: Vec<StreamResponse>,
    pub terminate: bool,
}

impl Step {
    fn reply(response: StreamResponse) -> Self {
        Self {
            responses: vec![response],
            terminate: false,
        }
    }
}

/// Server side of one session. Owns the lifecycle and hands accepted frames
/// to the processor.
pub struct StreamHandler<P: FrameProcessor> {
    processor: Arc<P>,
    machine: SessionMachine,
    context: FrameContext,
    span: Span,
}

impl<P: FrameProcessor> StreamHandler<P> {
    pub fn new(processor: Arc<P>) -> Self {
        let span = tracing::info_span!(
            "stream_session",
            session_id = tracing::field::Empty,
            trace_id = tracing::field::Empty,
            model = tracing::field::Empty,
        );
        Self {
            processor,
            machine: SessionMachine::new(),
            context: FrameContext::default(),
            span,
        }
    }

    pub fn span(&self) -> Span {
        self.span.clone()
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn frames_received(&self) -> u64 {
        self.machine.frames()
    }

    pub async fn handle(&mut self, request: StreamRequest) -> Step {
        match request.event {
            Some(Event::Open(open)) => self.handle_open(open),
            Some(Event::Frame(frame)) => self.handle_frame(frame).await,
            Some(Event::Close(close)) => self.handle_close(close),
            None => {
                tracing::warn!("Received StreamRequest without an event");
                Step::reply(StreamResponse::ack(
                    Code::InvalidArgument,
                    "Unknown event in StreamRequest",
                ))
            }
        }
    }

    fn handle_open(&mut self, open: StreamOpen) -> Step {
        if let Err(violation) = self.machine.open() {
            tracing::warn!("Rejected open: {}", violation);
            return Step::reply(StreamResponse::ack(violation.code(), violation.to_string()));
        }

        let header = open.header.unwrap_or_default();
        self.context = FrameContext::from_header(&header);
        self.span
            .record("session_id", self.context.session_id.as_str());
        self.span.record("trace_id", self.context.trace_id.as_str());
        self.span.record("model", self.context.model_name.as_str());

        tracing::info!(
            "Stream opened: model={}, mode={}, target={}x{}, accept={:?}",
            self.context.model_name,
            self.context.mode,
            self.context.target_width,
            self.context.target_height,
            header.accept
        );
        Step::reply(StreamResponse::ack(Code::Ok, "Stream opened"))
    }

    async fn handle_frame(&mut self, frame: StreamFrame) -> Step {
        let frames = match self.machine.frame() {
            Ok(frames) => frames,
            Err(violation) => {
                tracing::warn!("Rejected frame {}: {}", frame.frame_index, violation);
                return Step::reply(StreamResponse::ack(violation.code(), violation.to_string()));
            }
        };

        tracing::debug!(
            "Frame {} received with {} inputs",
            frame.frame_index,
            frame.inputs.len()
        );
        self.context.frames_received = frames;

        match self.processor.process(&self.context, frame).await {
            Ok(results) => Step {
                responses: results.into_iter().map(StreamResponse::frame).collect(),
                terminate: false,
            },
            Err(status) => {
                tracing::error!("Frame processing failed: {}", status);
                self.machine.fail();
                Step {
                    responses: vec![StreamResponse::ack(
                        Code::Internal,
                        format!("Server error: {}", status.message()),
                    )],
                    terminate: true,
                }
            }
        }
    }

    fn handle_close(&mut self, close: StreamClose) -> Step {
        // Closing never fails, including before open and after a prior close.
        self.machine.close();
        tracing::info!(
            "Stream closed after {} frames, meta={:?}",
            self.machine.frames(),
            close.meta
        );
        Step::reply(StreamResponse::ack(Code::Ok, "Stream closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_proto::{
        stream_response, FrameResult, InferenceHeader, ModelSpec, StreamAck,
    };
    use tonic::{async_trait, Status};

    #[derive(Clone)]
    struct MockFrameProcessor {
        fail: bool,
    }

    #[async_trait]
    impl FrameProcessor for MockFrameProcessor {
        async fn process(
            &self,
            context: &FrameContext,
            frame: StreamFrame,
        ) -> Result<Vec<FrameResult>, Status> {
            if self.fail {
                return Err(Status::internal("model crashed"));
            }
            assert_eq!(context.model_name, "yolo-detection-nano");
            Ok(vec![FrameResult {
                frame_index: frame.frame_index,
                results: vec![],
                meta: None,
            }])
        }
    }

    fn handler(fail: bool) -> StreamHandler<MockFrameProcessor> {
        StreamHandler::new(Arc::new(MockFrameProcessor { fail }))
    }

    fn open() -> StreamRequest {
        StreamRequest::open(InferenceHeader {
            model: Some(ModelSpec {
                name: "yolo-detection-nano".to_string(),
                version: "v1".to_string(),
            }),
            ..Default::default()
        })
    }

    fn frame(index: u64) -> StreamRequest {
        StreamRequest::frame(StreamFrame {
            frame_index: index,
            ts: None,
            inputs: vec![],
        })
    }

    fn ack_of(response: &StreamResponse) -> (i32, String) {
        match &response.event {
            Some(stream_response::Event::Ack(StreamAck {
                status: Some(status),
            })) => (status.code, status.message.clone()),
            other => panic!("expected ack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_frame_close_sequence() {
        let mut handler = handler(false);

        let step = handler.handle(open()).await;
        assert_eq!(ack_of(&step.responses[0]), (0, "Stream opened".to_string()));

        let step = handler.handle(frame(7)).await;
        match &step.responses[0].event {
            Some(stream_response::Event::Frame(result)) => assert_eq!(result.frame_index, 7),
            other => panic!("expected frame, got {:?}", other),
        }

        let step = handler.handle(StreamRequest::close(None)).await;
        assert_eq!(ack_of(&step.responses[0]), (0, "Stream closed".to_string()));
        assert!(!step.terminate);
        assert_eq!(handler.state(), SessionState::Closed);
        assert_eq!(handler.frames_received(), 1);
    }

    #[tokio::test]
    async fn test_frame_before_open_is_rejected() {
        let mut handler = handler(false);

        let step = handler.handle(frame(0)).await;

        assert_eq!(
            ack_of(&step.responses[0]),
            (9, "Stream not opened yet".to_string())
        );
        assert!(!step.terminate);
        assert_eq!(handler.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_second_open_is_rejected() {
        let mut handler = handler(false);
        handler.handle(open()).await;

        let step = handler.handle(open()).await;

        assert_eq!(
            ack_of(&step.responses[0]),
            (9, "Stream already opened".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_event_is_invalid_argument() {
        let mut handler = handler(false);

        let step = handler.handle(StreamRequest { event: None }).await;

        assert_eq!(
            ack_of(&step.responses[0]),
            (3, "Unknown event in StreamRequest".to_string())
        );
    }

    #[tokio::test]
    async fn test_processing_error_terminates_session() {
        let mut handler = handler(true);
        handler.handle(open()).await;

        let step = handler.handle(frame(0)).await;

        let (code, message) = ack_of(&step.responses[0]);
        assert_eq!(code, 13);
        assert!(message.starts_with("Server error: "));
        assert!(step.terminate);
        assert_eq!(handler.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_close_twice_and_close_without_open_succeed() {
        let mut handler = handler(false);

        let first = handler.handle(StreamRequest::close(None)).await;
        let second = handler.handle(StreamRequest::close(None)).await;

        assert_eq!(ack_of(&first.responses[0]).0, 0);
        assert_eq!(ack_of(&second.responses[0]).0, 0);
        assert_eq!(handler.state(), SessionState::Closed);
    }
}
