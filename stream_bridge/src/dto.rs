use crate::{
    decoder::{ArtifactKind, Detection, FrameOutcome},
    errors::BridgeError,
    model::{image_input, video_input, Mode, SessionHeader, SessionOptions, DEFAULT_MODEL},
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use stream_proto::InputEnvelope;

/// Caller-facing request body shared by the one-shot and streaming routes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamInferenceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_aspect_ratio: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_overlay: Option<bool>,
}

impl StreamInferenceRequest {
    /// Fills unset options with defaults. Explicit zero dimensions are
    /// rejected rather than replaced.
    pub fn options(&self) -> Result<SessionOptions, BridgeError> {
        let defaults = SessionOptions::default();
        let options = SessionOptions {
            target_width: self.target_width.unwrap_or(defaults.target_width),
            target_height: self.target_height.unwrap_or(defaults.target_height),
            keep_aspect_ratio: self.keep_aspect_ratio.unwrap_or(defaults.keep_aspect_ratio),
            mode: self.mode.unwrap_or(defaults.mode),
            return_overlay: self.return_overlay.unwrap_or(defaults.return_overlay),
        };
        if options.target_width == 0 {
            return Err(BridgeError::InvalidArgument(
                "target_width must be greater than 0".to_string(),
            ));
        }
        if options.target_height == 0 {
            return Err(BridgeError::InvalidArgument(
                "target_height must be greater than 0".to_string(),
            ));
        }
        Ok(options)
    }

    pub fn header(&self) -> Result<SessionHeader, BridgeError> {
        let model = self
            .model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(DEFAULT_MODEL);
        Ok(SessionHeader::new(model, self.options()?))
    }

    pub fn image_input(&self) -> Result<InputEnvelope, BridgeError> {
        let image = self
            .image
            .as_deref()
            .ok_or_else(|| BridgeError::InvalidArgument("image is required".to_string()))?;
        Ok(image_input(decode_base64("image", image)?))
    }

    pub fn video_input(&self) -> Result<InputEnvelope, BridgeError> {
        let video = self
            .video
            .as_deref()
            .ok_or_else(|| BridgeError::InvalidArgument("video is required".to_string()))?;
        Ok(video_input(decode_base64("video", video)?, data_url_type(video)))
    }

    pub fn image_inputs(&self) -> Result<Vec<InputEnvelope>, BridgeError> {
        if self.images.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "images must not be empty".to_string(),
            ));
        }
        self.images
            .iter()
            .enumerate()
            .map(|(i, image)| decode_base64(&format!("images[{}]", i), image).map(image_input))
            .collect()
    }
}

/// Accepts plain Base64 or a `data:<type>;base64,` URL.
pub fn decode_base64(field: &str, value: &str) -> Result<Vec<u8>, BridgeError> {
    let encoded = match value.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => value,
    };
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| BridgeError::InvalidArgument(format!("{} is not valid Base64: {}", field, e)))
}

fn data_url_type(value: &str) -> Option<&str> {
    value
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"))
        .map(|(content_type, _)| content_type)
        .filter(|content_type| !content_type.is_empty())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_index: Option<u64>,
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered_video: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl InferenceResponse {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            timestamp: now_millis(),
            ..Default::default()
        }
    }

    pub fn message(session_id: &str, event_type: &str, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            session_id: Some(session_id.to_string()),
            timestamp: now_millis(),
            event_type: Some(event_type.to_string()),
            ..Default::default()
        }
    }

    pub fn from_frame(session_id: &str, outcome: &FrameOutcome) -> Self {
        let encode = |kind| {
            outcome
                .artifact(kind)
                .map(|artifact| STANDARD.encode(&artifact.data))
        };
        Self {
            success: true,
            message: "Inference completed".to_string(),
            frame_index: Some(outcome.frame_index),
            detections: outcome.detections(),
            overlay_image: encode(ArtifactKind::Overlay),
            rendered_video: encode(ArtifactKind::Video),
            runtime_ms: outcome.meta.runtime_ms,
            frame_count: outcome.meta.frame_count,
            session_id: Some(
                outcome
                    .meta
                    .session_id
                    .clone()
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| session_id.to_string()),
            ),
            timestamp: now_millis(),
            event_type: Some("frame".to_string()),
        }
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn with_event_type(mut self, event_type: &str) -> Self {
        self.event_type = Some(event_type.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{Artifact, DecodedEnvelope, FrameMeta};

    #[test]
    fn test_request_defaults() {
        let request: StreamInferenceRequest = serde_json::from_str(r#"{"image": "AAEC"}"#).unwrap();

        let header = request.header().unwrap();

        assert_eq!(header.model, "yolo-detection-nano");
        assert_eq!(header.options, SessionOptions::default());
        assert_eq!(request.image_input().unwrap().content_type, "application/octet-stream");
    }

    #[test]
    fn test_request_reads_mode_and_size() {
        let request: StreamInferenceRequest = serde_json::from_str(
            r#"{"model": "yolov8n", "mode": "track", "target_width": 320, "return_overlay": false}"#,
        )
        .unwrap();

        let options = request.options().unwrap();

        assert_eq!(options.mode, Mode::Track);
        assert_eq!(options.target_width, 320);
        assert_eq!(options.target_height, 640);
        assert!(!options.return_overlay);
        assert_eq!(request.header().unwrap().model, "yolov8n");
    }

    #[test]
    fn test_zero_dimensions_are_rejected() {
        let request: StreamInferenceRequest =
            serde_json::from_str(r#"{"image": "AAEC", "target_height": 0}"#).unwrap();

        match request.header() {
            Err(BridgeError::InvalidArgument(message)) => {
                assert!(message.contains("target_height"))
            }
            other => panic!("unexpected result: {:?}", other.map(|h| h.options)),
        }
    }

    #[test]
    fn test_decode_base64_accepts_data_urls() {
        assert_eq!(decode_base64("image", "data:image/png;base64,AAEC").unwrap(), vec![0, 1, 2]);
        assert_eq!(decode_base64("image", "AAEC").unwrap(), vec![0, 1, 2]);
        assert!(matches!(
            decode_base64("image", "not base64!"),
            Err(BridgeError::InvalidArgument(_))
        ));
        assert_eq!(data_url_type("data:video/webm;base64,AA"), Some("video/webm"));
    }

    #[test]
    fn test_missing_inputs_are_invalid_arguments() {
        let request = StreamInferenceRequest::default();

        assert!(matches!(request.image_input(), Err(BridgeError::InvalidArgument(_))));
        assert!(matches!(request.video_input(), Err(BridgeError::InvalidArgument(_))));
        assert!(matches!(request.image_inputs(), Err(BridgeError::InvalidArgument(_))));
    }

    #[test]
    fn test_frame_response_encodes_overlay() {
        let outcome = FrameOutcome {
            frame_index: 2,
            envelopes: vec![DecodedEnvelope {
                kind: "overlay".to_string(),
                artifact: Some(Artifact {
                    kind: ArtifactKind::Overlay,
                    content_type: "image/jpeg".to_string(),
                    data: vec![0, 1, 2],
                }),
                ..Default::default()
            }],
            meta: FrameMeta {
                runtime_ms: Some(3.5),
                ..Default::default()
            },
        };

        let response = InferenceResponse::from_frame("s-1", &outcome);

        assert!(response.success);
        assert_eq!(response.overlay_image.as_deref(), Some("AAEC"));
        assert!(response.rendered_video.is_none());
        assert_eq!(response.session_id.as_deref(), Some("s-1"));
        assert_eq!(response.runtime_ms, Some(3.5));
    }
}
