use super::{
    rejected,
    stream::{push_events, sse},
};
use crate::{
    adapters::{run_one_shot, PushEvent},
    camera::{CameraSession, CameraSettings, CameraStatus},
    dto::{now_millis, InferenceResponse, StreamInferenceRequest},
    errors::BridgeError,
    model::SessionPlan,
    server::SharedState,
};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    response::{
        sse::{Event, Sse},
        Json,
    },
};
use futures::Stream;
use serde::Deserialize;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::instrument;

/// A camera frame request. Frames for a configured `session_id` update its
/// statistics.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CameraInferenceRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub request: StreamInferenceRequest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfigRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub settings: CameraSettings,
}

#[derive(Debug, Deserialize)]
pub struct StopQuery {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

async fn camera_session(state: &SharedState, session_id: Option<&str>) -> Option<Arc<CameraSession>> {
    match session_id {
        Some(id) => state.cameras.get(id).await,
        None => None,
    }
}

/// One frame, answered with a single `frame` or `error` event.
#[instrument(skip(state, payload))]
pub async fn frame_inference(
    State(state): State<SharedState>,
    payload: Result<Json<CameraInferenceRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, BridgeError> {
    state.metrics.record_request("/api/v1/camera/frame/inference");
    let Json(camera) = payload.map_err(rejected)?;
    let request = &camera.request;

    let plan = SessionPlan::single(request.header()?, request.image_input()?);
    let session = camera_session(&state, camera.session_id.as_deref()).await;
    state.metrics.record_session_started("camera");

    let event = match run_one_shot(&state.bridge, plan, state.session_config.one_shot_timeout()).await {
        Ok(outcome) => {
            let mut response = InferenceResponse::from_frame(&outcome.session_id, &outcome.frame);
            state
                .cameras
                .record_frame(session.as_deref(), response.detections.len());
            if let Some(id) = camera.session_id {
                response.session_id = Some(id);
            }
            state.metrics.record_session_outcome("camera", "success");
            PushEvent::new(PushEvent::FRAME, response)
        }
        Err(e) => {
            state.metrics.record_session_outcome("camera", e.kind());
            PushEvent::new(
                PushEvent::ERROR,
                InferenceResponse::failure(e.to_string()).with_event_type(PushEvent::ERROR),
            )
        }
    };

    Ok(sse(tokio_stream::once(event)))
}

/// A camera stream: a start acknowledgement followed by the session's push
/// events. `images` are paced like a batch; otherwise `image` is sent alone.
#[instrument(skip(state, payload))]
pub async fn stream_inference(
    State(state): State<SharedState>,
    payload: Result<Json<CameraInferenceRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, BridgeError> {
    state.metrics.record_request("/api/v1/camera/stream/inference");
    let Json(camera) = payload.map_err(rejected)?;
    let request = &camera.request;

    let header = request.header()?;
    let plan = if request.images.is_empty() {
        SessionPlan::single(header, request.image_input()?)
    } else {
        SessionPlan::paced(
            header,
            request.image_inputs()?,
            state.session_config.frame_interval(),
        )
    };
    let session_id = camera
        .session_id
        .clone()
        .unwrap_or_else(|| plan.session_id().to_string());
    let session = camera_session(&state, camera.session_id.as_deref()).await;

    let started = PushEvent::new(
        PushEvent::ACK,
        InferenceResponse::message(&session_id, "camera", "Camera stream started"),
    );
    let cameras = state.cameras.clone();
    let events = push_events(
        &state,
        "camera",
        plan,
        state.session_config.long_stream_timeout(),
    )
    .map(move |mut event: PushEvent| {
        if event.name == PushEvent::FRAME {
            cameras.record_frame(session.as_deref(), event.payload.detections.len());
        }
        event.payload.session_id = Some(session_id.clone());
        event
    });

    Ok(sse(tokio_stream::once(started).chain(events)))
}

#[instrument(skip(state))]
pub async fn status(State(state): State<SharedState>) -> Json<CameraStatus> {
    state.metrics.record_request("/api/v1/camera/status");
    Json(state.cameras.status().await)
}

#[instrument(skip(state, payload))]
pub async fn configure(
    State(state): State<SharedState>,
    payload: Result<Json<CameraConfigRequest>, JsonRejection>,
) -> Result<Json<InferenceResponse>, BridgeError> {
    state.metrics.record_request("/api/v1/camera/config");
    let Json(config) = payload.map_err(rejected)?;

    let session_id = state
        .cameras
        .configure(config.session_id, config.settings)
        .await?;
    Ok(Json(InferenceResponse::message(
        &session_id,
        "config",
        "Camera session configured successfully",
    )))
}

#[instrument(skip(state, query))]
pub async fn stop(
    State(state): State<SharedState>,
    query: Result<Query<StopQuery>, QueryRejection>,
) -> Result<Json<InferenceResponse>, BridgeError> {
    state.metrics.record_request("/api/v1/camera/stop");
    let Query(query) = query.map_err(rejected)?;

    state.cameras.stop(&query.session_id).await?;
    Ok(Json(InferenceResponse::message(
        &query.session_id,
        "stop",
        "Camera session stopped successfully",
    )))
}

pub async fn health() -> Json<InferenceResponse> {
    Json(InferenceResponse {
        success: true,
        message: "Camera service is running".to_string(),
        event_type: Some("health".to_string()),
        timestamp: now_millis(),
        ..Default::default()
    })
}
