mod inference_service;
mod protocol;
mod server;

pub mod config;
pub mod frame_processor;
pub mod stub_detector;

pub use frame_processor::{FrameContext, FrameProcessor};
pub use inference_service::InferenceService;
pub use protocol::{Step, StreamHandler};
pub use server::{start_server, GrpcServer};
pub use stub_detector::StubDetector;
