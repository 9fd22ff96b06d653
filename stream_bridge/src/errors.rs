use crate::dto::InferenceResponse;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("No healthy gRPC service instance found for {service}: {reason}")]
    NoHealthyInstance { service: String, reason: String },
    #[error("gRPC channel to {endpoint} unavailable: {reason}")]
    ChannelUnavailable { endpoint: String, reason: String },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("gRPC stream error: {0}")]
    Stream(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("{0}")]
    Internal(String),
    #[error("Request timeout")]
    Timeout,
}

impl BridgeError {
    pub fn no_healthy_instance(service: &str, reason: impl ToString) -> Self {
        BridgeError::NoHealthyInstance {
            service: service.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::NoHealthyInstance { .. } => "no_healthy_instance",
            BridgeError::ChannelUnavailable { .. } => "channel_unavailable",
            BridgeError::InvalidArgument(_) => "invalid_argument",
            BridgeError::Stream(_) => "stream",
            BridgeError::Protocol(_) => "protocol",
            BridgeError::Internal(_) => "internal",
            BridgeError::Timeout => "timeout",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            BridgeError::NoHealthyInstance { .. } | BridgeError::ChannelUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BridgeError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            BridgeError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::Stream(_) | BridgeError::Protocol(_) | BridgeError::Internal(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }
}

impl From<tonic::Status> for BridgeError {
    fn from(status: tonic::Status) -> Self {
        BridgeError::Stream(format!("{:?}: {}", status.code(), status.message()))
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        tracing::warn!("Request failed: {}", self);
        let status = self.status_code();
        (status, Json(InferenceResponse::failure(self.to_string()))).into_response()
    }
}
