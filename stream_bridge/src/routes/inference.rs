use super::rejected;
use crate::{
    adapters::run_one_shot,
    dto::{InferenceResponse, StreamInferenceRequest},
    errors::BridgeError,
    model::{image_input, SessionPlan},
    server::SharedState,
};
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    response::Json,
};
use std::time::Instant;
use tracing::instrument;

const ADAPTER: &str = "one_shot";

#[instrument(skip(state, payload))]
pub async fn infer(
    State(state): State<SharedState>,
    payload: Result<Json<StreamInferenceRequest>, JsonRejection>,
) -> Result<Json<InferenceResponse>, BridgeError> {
    state.metrics.record_request("/api/v1/inference");
    let Json(request) = payload.map_err(rejected)?;

    let plan = SessionPlan::single(request.header()?, request.image_input()?);
    run(&state, plan).await.map(Json)
}

/// Same as `infer`, with the image as the raw body and options in the query.
#[instrument(skip(state, query, body))]
pub async fn infer_raw(
    State(state): State<SharedState>,
    query: Result<Query<StreamInferenceRequest>, QueryRejection>,
    body: Bytes,
) -> Result<Json<InferenceResponse>, BridgeError> {
    state.metrics.record_request("/api/v1/inference/raw");
    let Query(request) = query.map_err(rejected)?;
    if body.is_empty() {
        return Err(BridgeError::InvalidArgument(
            "request body must contain an image".to_string(),
        ));
    }

    let plan = SessionPlan::single(request.header()?, image_input(body.to_vec()));
    run(&state, plan).await.map(Json)
}

async fn run(state: &SharedState, plan: SessionPlan) -> Result<InferenceResponse, BridgeError> {
    state.metrics.record_session_started(ADAPTER);
    let started = Instant::now();

    let result = run_one_shot(&state.bridge, plan, state.session_config.one_shot_timeout()).await;
    state
        .metrics
        .record_one_shot_duration(started.elapsed().as_millis() as u64);

    match result {
        Ok(outcome) => {
            state.metrics.record_session_outcome(ADAPTER, "success");
            Ok(InferenceResponse::from_frame(&outcome.session_id, &outcome.frame))
        }
        Err(e) => {
            state.metrics.record_session_outcome(ADAPTER, e.kind());
            Err(e)
        }
    }
}
