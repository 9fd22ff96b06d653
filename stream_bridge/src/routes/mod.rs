mod camera;
mod health;
mod inference;
mod metrics;
mod stream;

use crate::{errors::BridgeError, server::SharedState};
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/api/v1/inference", post(inference::infer))
        .route("/api/v1/inference/raw", post(inference::infer_raw))
        .route("/api/v1/stream/inference/sse", post(stream::stream_image))
        .route(
            "/api/v1/stream/inference/reactive",
            post(stream::stream_image_reactive),
        )
        .route("/api/v1/stream/video/inference", post(stream::stream_video))
        .route("/api/v1/stream/batch/inference", post(stream::stream_batch))
        .route(
            "/api/v1/camera/frame/inference",
            post(camera::frame_inference),
        )
        .route(
            "/api/v1/camera/stream/inference",
            post(camera::stream_inference),
        )
        .route("/api/v1/camera/status", get(camera::status))
        .route("/api/v1/camera/config", post(camera::configure))
        .route("/api/v1/camera/stop", post(camera::stop))
        .route("/api/v1/camera/health", get(camera::health))
}

fn rejected(rejection: impl std::fmt::Display) -> BridgeError {
    BridgeError::InvalidArgument(rejection.to_string())
}
