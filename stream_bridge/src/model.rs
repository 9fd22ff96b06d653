use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr, time::Duration};
use stream_proto::{
    input_envelope, prost_types::Struct, wkt, InferenceHeader, InputEnvelope, ModelSpec,
    TraceContext,
};

pub const DEFAULT_MODEL: &str = "yolo-detection-nano";
pub const MODEL_VERSION: &str = "v1";
pub const DEFAULT_TARGET_SIZE: u32 = 640;
pub const ACCEPT_DETECTIONS: &str = "application/x-protobuf;type=\"google.protobuf.Struct\"";
pub const ACCEPT_OVERLAY: &str = "image/jpeg;kind=\"overlay\"";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Detect,
    Track,
    Segment,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Detect => "detect",
            Mode::Track => "track",
            Mode::Segment => "segment",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "detect" => Ok(Mode::Detect),
            "track" => Ok(Mode::Track),
            "segment" => Ok(Mode::Segment),
            other => Err(format!(
                "{} is not a supported mode. Use `detect`, `track` or `segment`.",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub target_width: u32,
    pub target_height: u32,
    pub keep_aspect_ratio: bool,
    pub mode: Mode,
    pub return_overlay: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            target_width: DEFAULT_TARGET_SIZE,
            target_height: DEFAULT_TARGET_SIZE,
            keep_aspect_ratio: true,
            mode: Mode::Detect,
            return_overlay: true,
        }
    }
}

impl SessionOptions {
    pub fn to_struct(&self) -> Struct {
        wkt::fields([
            ("target_w", wkt::number(self.target_width as f64)),
            ("target_h", wkt::number(self.target_height as f64)),
            ("keep_aspect_ratio", wkt::boolean(self.keep_aspect_ratio)),
            ("mode", wkt::string(self.mode.as_str())),
            ("persist", wkt::boolean(false)),
            ("return_overlay", wkt::boolean(self.return_overlay)),
        ])
    }
}

/// Everything the open message carries for one session.
#[derive(Debug, Clone)]
pub struct SessionHeader {
    pub session_id: String,
    pub model: String,
    pub version: String,
    pub options: SessionOptions,
    pub accept: Vec<String>,
}

impl SessionHeader {
    pub fn new(model: impl Into<String>, options: SessionOptions) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            model: model.into(),
            version: MODEL_VERSION.to_string(),
            options,
            accept: vec![ACCEPT_DETECTIONS.to_string(), ACCEPT_OVERLAY.to_string()],
        }
    }

    pub fn to_proto(&self) -> InferenceHeader {
        let span_id = uuid::Uuid::new_v4().simple().to_string()[..16].to_string();
        InferenceHeader {
            model: Some(ModelSpec {
                name: self.model.clone(),
                version: self.version.clone(),
            }),
            options: Some(self.options.to_struct()),
            accept: self.accept.clone(),
            trace: Some(TraceContext {
                trace_id: self.session_id.clone(),
                span_id,
                parent_span_id: String::new(),
            }),
            tenant: None,
            session_id: self.session_id.clone(),
        }
    }
}

pub fn image_input(bytes: Vec<u8>) -> InputEnvelope {
    InputEnvelope {
        kind: "image".to_string(),
        content_type: sniff_image_type(&bytes).to_string(),
        payload: Some(input_envelope::Payload::Binary(bytes)),
        tags: HashMap::new(),
    }
}

pub fn video_input(bytes: Vec<u8>, content_type: Option<&str>) -> InputEnvelope {
    InputEnvelope {
        kind: "video".to_string(),
        content_type: content_type.unwrap_or("video/mp4").to_string(),
        payload: Some(input_envelope::Payload::Binary(bytes)),
        tags: HashMap::new(),
    }
}

pub fn text_input(text: impl Into<String>) -> InputEnvelope {
    InputEnvelope {
        kind: "text".to_string(),
        content_type: "text/plain".to_string(),
        payload: Some(input_envelope::Payload::Text(text.into())),
        tags: HashMap::new(),
    }
}

pub fn sniff_image_type(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream")
}

/// What one session will send: the header, then each entry of `frames` as
/// one frame, `frame_interval` apart.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub header: SessionHeader,
    pub frames: Vec<Vec<InputEnvelope>>,
    pub frame_interval: Duration,
}

impl SessionPlan {
    pub fn single(header: SessionHeader, input: InputEnvelope) -> Self {
        Self {
            header,
            frames: vec![vec![input]],
            frame_interval: Duration::ZERO,
        }
    }

    /// One input per frame.
    pub fn paced(header: SessionHeader, inputs: Vec<InputEnvelope>, interval: Duration) -> Self {
        Self {
            header,
            frames: inputs.into_iter().map(|input| vec![input]).collect(),
            frame_interval: interval,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.header.session_id
    }
}
