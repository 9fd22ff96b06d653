use crate::{frame_processor::FrameProcessor, protocol::StreamHandler};
use async_stream::stream;
use futures::Stream;
use std::{pin::Pin, sync::Arc};
use stream_proto::{
    inference_stream_service_server::InferenceStreamService, StreamRequest, StreamResponse,
};
use tonic::{async_trait, Request, Response, Status, Streaming};
use tracing::Instrument;

#[derive(Debug, Clone)]
pub struct InferenceService<P: FrameProcessor> {
    processor: Arc<P>,
}

impl<P: FrameProcessor> InferenceService<P> {
    pub fn new(processor: P) -> Self {
        Self {
            processor: Arc::new(processor),
        }
    }
}

#[async_trait]
impl<P: FrameProcessor> InferenceStreamService for InferenceService<P> {
    type StreamStream = Pin<Box<dyn Stream<Item = Result<StreamResponse, Status>> + Send>>;

    async fn stream(
        &self,
        request: Request<Streaming<StreamRequest>>,
    ) -> Result<Response<Self::StreamStream>, Status> {
        let mut inbound = request.into_inner();
        let processor = self.processor.clone();

        let output_stream = stream! {
            let mut handler = StreamHandler::new(processor);
            let span = handler.span();
            while let Some(message) = inbound.message().await.transpose() {
                match message {
                    Ok(request) => {
                        let step = handler.handle(request).instrument(span.clone()).await;
                        for response in step.responses {
                            yield Ok(response);
                        }
                        if step.terminate {
                            break;
                        }
                    }
                    Err(status) => {
                        tracing::warn!(parent: &span, "Client stream error: {}", status);
                        break;
                    }
                }
            }
            tracing::info!(
                parent: &span,
                "Client completed sending, {} frames received, final state {}",
                handler.frames_received(),
                handler.state().as_str()
            );
        };

        Ok(Response::new(Box::pin(output_stream)))
    }
}
