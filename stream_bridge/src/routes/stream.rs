use super::rejected;
use crate::{
    adapters::{run_push, run_reactive, PushEvent, PushSettings},
    dto::StreamInferenceRequest,
    errors::BridgeError,
    model::{video_input, SessionPlan},
    server::SharedState,
};
use axum::{
    body::{Body, Bytes},
    extract::{rejection::JsonRejection, FromRequest, Multipart, Request, State},
    http::header,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use futures::Stream;
use std::{fmt::Display, str::FromStr, time::Duration};
use stream_proto::InputEnvelope;
use tokio_stream::StreamExt;
use tracing::instrument;

#[instrument(skip(state, payload))]
pub async fn stream_image(
    State(state): State<SharedState>,
    payload: Result<Json<StreamInferenceRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, BridgeError> {
    state.metrics.record_request("/api/v1/stream/inference/sse");
    let Json(request) = payload.map_err(rejected)?;

    let plan = SessionPlan::single(request.header()?, request.image_input()?);
    let deadline = state.session_config.stream_timeout();
    Ok(push_response(&state, "sse", plan, deadline))
}

/// Accepts the JSON body or `multipart/form-data`, where `video` is either a
/// Base64 text field or an uploaded file.
#[instrument(skip(state, request))]
pub async fn stream_video(
    State(state): State<SharedState>,
    request: Request,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, BridgeError> {
    state.metrics.record_request("/api/v1/stream/video/inference");
    let is_form = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/form-data"));

    let (request, input) = if is_form {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(rejected)?;
        video_form(multipart).await?
    } else {
        let Json(request) = Json::<StreamInferenceRequest>::from_request(request, &state)
            .await
            .map_err(rejected)?;
        let input = request.video_input()?;
        (request, input)
    };

    let plan = SessionPlan::single(request.header()?, input);
    let deadline = state.session_config.long_stream_timeout();
    Ok(push_response(&state, "sse_video", plan, deadline))
}

async fn video_form(
    mut multipart: Multipart,
) -> Result<(StreamInferenceRequest, InputEnvelope), BridgeError> {
    let mut request = StreamInferenceRequest::default();
    let mut upload = None;

    while let Some(field) = multipart.next_field().await.map_err(rejected)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "video" && field.file_name().is_some() {
            let content_type = field
                .content_type()
                .filter(|t| t.starts_with("video/"))
                .map(str::to_string);
            let bytes = field.bytes().await.map_err(rejected)?;
            upload = Some(video_input(bytes.to_vec(), content_type.as_deref()));
            continue;
        }

        let value = field.text().await.map_err(rejected)?;
        match name.as_str() {
            "video" => request.video = Some(value),
            "model" => request.model = Some(value),
            "target_width" => request.target_width = Some(form_value(&name, &value)?),
            "target_height" => request.target_height = Some(form_value(&name, &value)?),
            "keep_aspect_ratio" => request.keep_aspect_ratio = Some(form_value(&name, &value)?),
            "mode" => request.mode = Some(form_value(&name, &value)?),
            "return_overlay" => request.return_overlay = Some(form_value(&name, &value)?),
            _ => tracing::debug!("Ignoring form field {}", name),
        }
    }

    let input = match upload {
        Some(input) => input,
        None => request.video_input()?,
    };
    Ok((request, input))
}

fn form_value<T>(name: &str, value: &str) -> Result<T, BridgeError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| BridgeError::InvalidArgument(format!("{}: {}", name, e)))
}

#[instrument(skip(state, payload))]
pub async fn stream_batch(
    State(state): State<SharedState>,
    payload: Result<Json<StreamInferenceRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, BridgeError> {
    state.metrics.record_request("/api/v1/stream/batch/inference");
    let Json(request) = payload.map_err(rejected)?;

    let plan = SessionPlan::paced(
        request.header()?,
        request.image_inputs()?,
        state.session_config.frame_interval(),
    );
    let deadline = state.session_config.long_stream_timeout();
    Ok(push_response(&state, "sse_batch", plan, deadline))
}

/// Newline-delimited JSON, one line per event, driven by a cold stream.
#[instrument(skip(state, payload))]
pub async fn stream_image_reactive(
    State(state): State<SharedState>,
    payload: Result<Json<StreamInferenceRequest>, JsonRejection>,
) -> Result<Response, BridgeError> {
    state.metrics.record_request("/api/v1/stream/inference/reactive");
    let Json(request) = payload.map_err(rejected)?;

    let plan = SessionPlan::single(request.header()?, request.image_input()?);
    let deadline = state.session_config.stream_timeout();
    state.metrics.record_session_started("reactive");

    let metrics = state.metrics.clone();
    let lines = run_reactive(state.bridge.clone(), plan, deadline).map(move |event| {
        if event.is_terminal() {
            metrics.record_session_outcome("reactive", event.name);
        }
        serde_json::to_vec(&event).map(|mut line| {
            line.push(b'\n');
            Bytes::from(line)
        })
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

fn push_response(
    state: &SharedState,
    adapter: &'static str,
    plan: SessionPlan,
    deadline: Duration,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    sse(push_events(state, adapter, plan, deadline))
}

/// Runs `plan` on the push adapter and records its metrics.
pub(super) fn push_events(
    state: &SharedState,
    adapter: &'static str,
    plan: SessionPlan,
    deadline: Duration,
) -> impl Stream<Item = PushEvent> + Send + 'static {
    let settings = PushSettings {
        deadline,
        buffer: state.session_config.push_buffer,
        send_timeout: state.session_config.push_send_timeout(),
    };
    state.metrics.record_session_started(adapter);

    let metrics = state.metrics.clone();
    run_push(state.bridge.clone(), plan, settings).map(move |event: PushEvent| {
        if event.is_terminal() {
            metrics.record_session_outcome(adapter, event.name);
        }
        event
    })
}

pub(super) fn sse(
    events: impl Stream<Item = PushEvent> + Send + 'static,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let events = events.map(|event| Event::default().event(event.name).json_data(&event.payload));
    Sse::new(events).keep_alive(KeepAlive::default())
}
