use stream_proto::{wkt, FrameResult, InferenceHeader, StreamFrame};
use tonic::{async_trait, Status};

const DEFAULT_TARGET_SIZE: u32 = 640;

/// Per-session settings taken from the open header, handed to every frame.
#[derive(Debug, Clone)]
pub struct FrameContext {
    pub session_id: String,
    pub model_name: String,
    pub mode: String,
    pub target_width: u32,
    pub target_height: u32,
    pub return_overlay: bool,
    pub trace_id: String,
    pub span_id: String,
    pub frames_received: u64,
}

impl Default for FrameContext {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            model_name: String::new(),
            mode: "detect".to_string(),
            target_width: DEFAULT_TARGET_SIZE,
            target_height: DEFAULT_TARGET_SIZE,
            return_overlay: true,
            trace_id: String::new(),
            span_id: String::new(),
            frames_received: 0,
        }
    }
}

impl FrameContext {
    pub fn from_header(header: &InferenceHeader) -> Self {
        let mut context = Self {
            session_id: header.session_id.clone(),
            ..Self::default()
        };
        if let Some(model) = &header.model {
            context.model_name = model.name.clone();
        }
        if let Some(trace) = &header.trace {
            context.trace_id = trace.trace_id.clone();
            context.span_id = trace.span_id.clone();
        }
        if let Some(options) = &header.options {
            if let Some(mode) = wkt::get_string(options, "mode") {
                context.mode = mode.to_string();
            }
            if let Some(w) = wkt::get_number(options, "target_w").filter(|w| *w > 0.0) {
                context.target_width = w as u32;
            }
            if let Some(h) = wkt::get_number(options, "target_h").filter(|h| *h > 0.0) {
                context.target_height = h as u32;
            }
            if let Some(overlay) = wkt::get_bool(options, "return_overlay") {
                context.return_overlay = overlay;
            }
        }
        context
    }

    pub fn is_tracking(&self) -> bool {
        self.mode.eq_ignore_ascii_case("track")
    }
}

#[async_trait]
pub trait FrameProcessor: Send + Sync + Clone + 'static {
    async fn process(
        &self,
        context: &FrameContext,
        frame: StreamFrame,
    ) -> Result<Vec<FrameResult>, Status>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_proto::{ModelSpec, TraceContext};

    #[test]
    fn test_context_reads_header_options() {
        let header = InferenceHeader {
            model: Some(ModelSpec {
                name: "yolo-detection-nano".to_string(),
                version: "v1".to_string(),
            }),
            options: Some(wkt::fields([
                ("target_w", wkt::number(320.0)),
                ("target_h", wkt::number(240.0)),
                ("mode", wkt::string("track")),
                ("return_overlay", wkt::boolean(false)),
            ])),
            trace: Some(TraceContext {
                trace_id: "abc".to_string(),
                span_id: "def".to_string(),
                parent_span_id: String::new(),
            }),
            session_id: "session-1".to_string(),
            ..Default::default()
        };

        let context = FrameContext::from_header(&header);

        assert_eq!(context.model_name, "yolo-detection-nano");
        assert_eq!((context.target_width, context.target_height), (320, 240));
        assert!(context.is_tracking());
        assert!(!context.return_overlay);
        assert_eq!(context.trace_id, "abc");
        assert_eq!(context.session_id, "session-1");
    }

    #[test]
    fn test_context_defaults_without_options() {
        let context = FrameContext::from_header(&InferenceHeader::default());

        assert_eq!((context.target_width, context.target_height), (640, 640));
        assert_eq!(context.mode, "detect");
        assert!(context.return_overlay);
    }
}
