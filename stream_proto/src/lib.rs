mod session;

pub mod wkt;

tonic::include_proto!("ai");

pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("inference_stream");

pub use prost_types;
pub use session::{ProtocolViolation, SessionMachine, SessionState};

impl StreamResponse {
    pub fn ack(code: tonic::Code, message: impl Into<String>) -> Self {
        Self {
            event: Some(stream_response::Event::Ack(StreamAck {
                status: Some(CustomStatus {
                    code: code as i32,
                    message: message.into(),
                }),
            })),
        }
    }

    pub fn frame(result: FrameResult) -> Self {
        Self {
            event: Some(stream_response::Event::Frame(result)),
        }
    }
}

impl StreamRequest {
    pub fn open(header: InferenceHeader) -> Self {
        Self {
            event: Some(stream_request::Event::Open(StreamOpen {
                header: Some(header),
            })),
        }
    }

    pub fn frame(frame: StreamFrame) -> Self {
        Self {
            event: Some(stream_request::Event::Frame(frame)),
        }
    }

    pub fn close(meta: Option<prost_types::Struct>) -> Self {
        Self {
            event: Some(stream_request::Event::Close(StreamClose { meta })),
        }
    }
}
