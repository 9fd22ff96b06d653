use crate::{
    config::ModelConfig,
    frame_processor::{FrameContext, FrameProcessor},
};
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
use std::{io::Cursor, sync::Arc, time::Instant};
use stream_proto::{
    input_envelope, prost_types::Struct, result_envelope, wkt, FrameResult, InputEnvelope,
    ResultEnvelope, StreamFrame,
};
use tonic::{async_trait, Status};

const DETECTIONS_CONTENT_TYPE: &str = "application/x-protobuf;type=\"google.protobuf.Struct\"";
const TEXT_PREVIEW_CHARS: usize = 64;

// Boxes as fractions of the input: (class_id, score, x, y, width, height).
const CANNED_BOXES: [(u32, f32, f32, f32, f32, f32); 2] = [
    (0, 0.95, 0.10, 0.15, 0.30, 0.50),
    (1, 0.88, 0.55, 0.40, 0.35, 0.45),
];

#[derive(Debug, Clone, PartialEq)]
pub struct StubDetection {
    pub class_id: u32,
    pub class_name: String,
    pub score: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub track_id: Option<u32>,
}

impl StubDetection {
    fn to_struct(&self) -> Struct {
        let mut value = wkt::fields([
            ("class_name", wkt::string(self.class_name.clone())),
            ("class_id", wkt::number(self.class_id as f64)),
            ("score", wkt::number(self.score as f64)),
            ("x", wkt::number(self.x as f64)),
            ("y", wkt::number(self.y as f64)),
            ("width", wkt::number(self.width as f64)),
            ("height", wkt::number(self.height as f64)),
        ]);
        if let Some(track_id) = self.track_id {
            value
                .fields
                .insert("track_id".to_string(), wkt::number(track_id as f64));
        }
        value
    }
}

/// Deterministic stand-in for a detection model. It answers every image with
/// the same boxes scaled to the image, which keeps the wire format honest
/// without shipping weights.
#[derive(Clone)]
pub struct StubDetector {
    labels: Arc<Vec<String>>,
    model_name: String,
}

impl StubDetector {
    pub fn new(model_config: &ModelConfig) -> Self {
        tracing::info!(
            "Stub detector ready for {} v{} with {} labels",
            model_config.name,
            model_config.version,
            model_config.class_labels.len()
        );
        Self {
            labels: Arc::new(model_config.class_labels.clone()),
            model_name: model_config.name.clone(),
        }
    }

    pub fn detect(&self, width: u32, height: u32, tracking: bool) -> Vec<StubDetection> {
        let (w, h) = (width as f32, height as f32);
        CANNED_BOXES
            .iter()
            .enumerate()
            .map(|(i, &(class_id, score, x, y, bw, bh))| StubDetection {
                class_id,
                class_name: self
                    .labels
                    .get(class_id as usize)
                    .cloned()
                    .unwrap_or_else(|| format!("class_{}", class_id)),
                score,
                x: x * w,
                y: y * h,
                width: bw * w,
                height: bh * h,
                track_id: tracking.then_some(i as u32 + 1),
            })
            .collect()
    }
}

fn decode_image(bytes: &[u8]) -> Option<DynamicImage> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .decode()
        .ok()
}

fn render_overlay(
    image: &DynamicImage,
    detections: &[StubDetection],
) -> Result<Vec<u8>, image::ImageError> {
    let mut canvas = image.to_rgb8();
    for detection in detections {
        draw_box(&mut canvas, detection, Rgb([0, 255, 0]));
    }

    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(canvas).write_to(&mut buffer, ImageFormat::Jpeg)?;
    Ok(buffer.into_inner())
}

fn draw_box(canvas: &mut RgbImage, detection: &StubDetection, color: Rgb<u8>) {
    let (w, h) = canvas.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let clamp_x = |v: f32| (v.max(0.0) as u32).min(w - 1);
    let clamp_y = |v: f32| (v.max(0.0) as u32).min(h - 1);
    let (x0, x1) = (
        clamp_x(detection.x),
        clamp_x(detection.x + detection.width),
    );
    let (y0, y1) = (
        clamp_y(detection.y),
        clamp_y(detection.y + detection.height),
    );

    for x in x0..=x1 {
        canvas.put_pixel(x, y0, color);
        canvas.put_pixel(x, y1, color);
    }
    for y in y0..=y1 {
        canvas.put_pixel(x0, y, color);
        canvas.put_pixel(x1, y, color);
    }
}

fn detections_envelope(
    index: u32,
    detections: &[StubDetection],
    width: u32,
    height: u32,
) -> ResultEnvelope {
    let items = detections
        .iter()
        .map(|d| wkt::structure(d.to_struct()))
        .collect();
    let payload = wkt::fields([
        ("items", wkt::list(items)),
        ("coord_type", wkt::string("pixel")),
        ("input_w", wkt::number(width as f64)),
        ("input_h", wkt::number(height as f64)),
    ]);

    ResultEnvelope {
        kind: "detections".to_string(),
        content_type: DETECTIONS_CONTENT_TYPE.to_string(),
        payload: Some(result_envelope::Payload::Message(wkt::pack_struct(&payload))),
        meta: None,
        input_index: index,
    }
}

fn binary_envelope(index: u32, kind: &str, content_type: &str, bytes: Vec<u8>) -> ResultEnvelope {
    ResultEnvelope {
        kind: kind.to_string(),
        content_type: content_type.to_string(),
        payload: Some(result_envelope::Payload::Binary(bytes)),
        meta: None,
        input_index: index,
    }
}

fn echo_envelope(index: u32, input: &InputEnvelope) -> ResultEnvelope {
    let mut echo = wkt::fields([
        ("input_kind", wkt::string(input.kind.clone())),
        ("content_type", wkt::string(input.content_type.clone())),
        ("index_in_frame", wkt::number(index as f64)),
    ]);
    match &input.payload {
        Some(input_envelope::Payload::Text(text)) => {
            let preview: String = text.chars().take(TEXT_PREVIEW_CHARS).collect();
            echo.fields
                .insert("text_len".to_string(), wkt::number(text.len() as f64));
            echo.fields
                .insert("text_preview".to_string(), wkt::string(preview));
        }
        Some(input_envelope::Payload::Binary(bytes)) => {
            echo.fields
                .insert("binary_size".to_string(), wkt::number(bytes.len() as f64));
        }
        Some(input_envelope::Payload::Json(json)) => {
            let keys = json.fields.keys().map(|k| wkt::string(k.clone())).collect();
            echo.fields.insert("json_keys".to_string(), wkt::list(keys));
        }
        Some(input_envelope::Payload::Message(any)) => {
            echo.fields
                .insert("type_url".to_string(), wkt::string(any.type_url.clone()));
        }
        None => {}
    }

    let tags = input
        .tags
        .iter()
        .map(|(k, v)| (k.as_str(), wkt::string(v.clone())));
    let meta = wkt::fields([("echo_tags", wkt::structure(wkt::fields(tags)))]);

    ResultEnvelope {
        kind: "echo".to_string(),
        content_type: "application/json".to_string(),
        payload: Some(result_envelope::Payload::Json(echo)),
        meta: Some(meta),
        input_index: index,
    }
}

#[async_trait]
impl FrameProcessor for StubDetector {
    async fn process(
        &self,
        context: &FrameContext,
        frame: StreamFrame,
    ) -> Result<Vec<FrameResult>, Status> {
        let started = Instant::now();
        let mut input_size = (context.target_width, context.target_height);
        let mut results = Vec::new();

        for (index, input) in frame.inputs.iter().enumerate() {
            let index = index as u32;
            match (input.kind.as_str(), &input.payload) {
                ("image", Some(input_envelope::Payload::Binary(bytes))) => {
                    let decoded = decode_image(bytes);
                    if let Some(image) = &decoded {
                        input_size = image.dimensions();
                    }
                    let detections =
                        self.detect(input_size.0, input_size.1, context.is_tracking());
                    results.push(detections_envelope(
                        index,
                        &detections,
                        input_size.0,
                        input_size.1,
                    ));

                    if context.return_overlay {
                        if let Some(image) = &decoded {
                            let overlay = render_overlay(image, &detections).map_err(|e| {
                                Status::internal(format!("overlay rendering failed: {}", e))
                            })?;
                            results.push(binary_envelope(index, "overlay", "image/jpeg", overlay));
                        }
                    }
                }
                ("video", Some(input_envelope::Payload::Binary(bytes))) => {
                    let detections =
                        self.detect(input_size.0, input_size.1, context.is_tracking());
                    results.push(detections_envelope(
                        index,
                        &detections,
                        input_size.0,
                        input_size.1,
                    ));
                    if context.return_overlay {
                        let content_type = if input.content_type.starts_with("video/") {
                            input.content_type.as_str()
                        } else {
                            "video/mp4"
                        };
                        results.push(binary_envelope(index, "video", content_type, bytes.clone()));
                    }
                }
                _ => results.push(echo_envelope(index, input)),
            }
        }

        let runtime_ms = started.elapsed().as_secs_f64() * 1000.0;
        let model = if context.model_name.is_empty() {
            self.model_name.clone()
        } else {
            context.model_name.clone()
        };
        let meta = wkt::fields([
            ("runtime_ms", wkt::number(runtime_ms)),
            ("coord_type", wkt::string("pixel")),
            ("input_w", wkt::number(input_size.0 as f64)),
            ("input_h", wkt::number(input_size.1 as f64)),
            ("session_id", wkt::string(context.session_id.clone())),
            ("frame_count", wkt::number(context.frames_received as f64)),
            ("trace_id", wkt::string(context.trace_id.clone())),
            ("span_id", wkt::string(context.span_id.clone())),
            ("model", wkt::string(model)),
        ]);

        tracing::debug!(
            "Frame {} produced {} envelopes in {:.2} ms",
            frame.frame_index,
            results.len(),
            runtime_ms
        );

        Ok(vec![FrameResult {
            frame_index: frame.frame_index,
            results,
            meta: Some(meta),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageBuffer;
    use std::collections::HashMap;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(width, height, Rgb([255, 0, 0]));
        let mut image_data: Vec<u8> = Vec::new();
        let mut cursor = Cursor::new(&mut image_data);
        img.write_to(&mut cursor, ImageFormat::Png).unwrap();
        cursor.get_ref().to_vec()
    }

    fn image_input(bytes: Vec<u8>) -> InputEnvelope {
        InputEnvelope {
            kind: "image".to_string(),
            content_type: "image/png".to_string(),
            payload: Some(input_envelope::Payload::Binary(bytes)),
            tags: HashMap::new(),
        }
    }

    fn detector() -> StubDetector {
        StubDetector::new(&ModelConfig::default())
    }

    #[test]
    fn test_detections_scale_with_image() {
        let detections = detector().detect(200, 100, false);

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class_name, "person");
        assert_eq!(detections[1].class_name, "bicycle");
        assert!((detections[0].x - 20.0).abs() < 1e-3);
        assert!((detections[0].height - 50.0).abs() < 1e-3);
        assert!(detections.iter().all(|d| d.track_id.is_none()));
    }

    #[test]
    fn test_tracking_assigns_ids() {
        let detections = detector().detect(640, 640, true);

        assert_eq!(detections[0].track_id, Some(1));
        assert_eq!(detections[1].track_id, Some(2));
    }

    #[tokio::test]
    async fn test_image_frame_yields_detections_and_overlay() {
        let context = FrameContext {
            session_id: "s-1".to_string(),
            frames_received: 1,
            ..FrameContext::default()
        };
        let frame = StreamFrame {
            frame_index: 4,
            ts: None,
            inputs: vec![image_input(png(100, 80))],
        };

        let results = detector().process(&context, frame).await.unwrap();

        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.frame_index, 4);
        assert_eq!(result.results.len(), 2);
        assert_eq!(result.results[0].kind, "detections");
        assert_eq!(result.results[1].kind, "overlay");
        assert_eq!(result.results[1].content_type, "image/jpeg");

        let payload = match &result.results[0].payload {
            Some(result_envelope::Payload::Message(any)) => wkt::unpack_struct(any).unwrap(),
            other => panic!("unexpected payload: {:?}", other),
        };
        assert_eq!(wkt::get_number(&payload, "input_w"), Some(100.0));
        let meta = result.meta.as_ref().unwrap();
        assert_eq!(wkt::get_string(meta, "session_id"), Some("s-1"));
        assert_eq!(wkt::get_number(meta, "frame_count"), Some(1.0));
    }

    #[tokio::test]
    async fn test_overlay_can_be_disabled() {
        let context = FrameContext {
            return_overlay: false,
            ..FrameContext::default()
        };
        let frame = StreamFrame {
            frame_index: 0,
            ts: None,
            inputs: vec![image_input(png(32, 32))],
        };

        let results = detector().process(&context, frame).await.unwrap();

        assert_eq!(results[0].results.len(), 1);
        assert_eq!(results[0].results[0].kind, "detections");
    }

    #[tokio::test]
    async fn test_text_input_is_echoed() {
        let mut tags = HashMap::new();
        tags.insert("source".to_string(), "test".to_string());
        let frame = StreamFrame {
            frame_index: 0,
            ts: None,
            inputs: vec![InputEnvelope {
                kind: "text".to_string(),
                content_type: "text/plain".to_string(),
                payload: Some(input_envelope::Payload::Text("hello".to_string())),
                tags,
            }],
        };

        let results = detector()
            .process(&FrameContext::default(), frame)
            .await
            .unwrap();

        let envelope = &results[0].results[0];
        assert_eq!(envelope.kind, "echo");
        let echo = match &envelope.payload {
            Some(result_envelope::Payload::Json(json)) => json,
            other => panic!("unexpected payload: {:?}", other),
        };
        assert_eq!(wkt::get_number(echo, "text_len"), Some(5.0));
        assert_eq!(wkt::get_string(echo, "input_kind"), Some("text"));
    }
}
