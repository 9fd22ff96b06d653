//! Turns backend result envelopes into detections, binary artifacts and
//! frame metadata.
//!
//! Decoding never fails a session. A malformed detection record is dropped
//! on its own and its siblings are still returned.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use stream_proto::{
    prost_types::{value::Kind, Struct, Value},
    result_envelope::Payload,
    wkt, FrameResult, ResultEnvelope,
};
use thiserror::Error;

const DETECTION_KINDS: [&str; 2] = ["detections", "tracks"];
const DETECTION_LIST_KEYS: [&str; 2] = ["items", "detections"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_name: String,
    pub class_id: i32,
    pub score: f64,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<i32>,
}

/// Why a single detection record was dropped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeSkipped {
    #[error("detection record is not an object")]
    NotAnObject,
    #[error("missing or non-numeric field `{0}`")]
    MissingField(&'static str),
    #[error("score {0} outside [0, 1]")]
    ScoreOutOfRange(f64),
    #[error("negative box size {0}x{1}")]
    NegativeSize(f64, f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Overlay,
    Video,
    Binary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedEnvelope {
    pub input_index: u32,
    pub kind: String,
    pub content_type: String,
    pub detections: Option<Vec<Detection>>,
    pub artifact: Option<Artifact>,
    pub data: Option<JsonValue>,
    pub meta: Option<JsonValue>,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameMeta {
    pub runtime_ms: Option<f64>,
    pub frame_count: Option<u64>,
    pub session_id: Option<String>,
    pub raw: JsonValue,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameOutcome {
    pub frame_index: u64,
    pub envelopes: Vec<DecodedEnvelope>,
    pub meta: FrameMeta,
}

impl FrameOutcome {
    pub fn detections(&self) -> Vec<Detection> {
        self.envelopes
            .iter()
            .filter_map(|e| e.detections.as_ref())
            .flatten()
            .cloned()
            .collect()
    }

    /// Detection lists keyed by the input they came from.
    pub fn detections_by_input(&self) -> BTreeMap<u32, Vec<Detection>> {
        let mut by_input: BTreeMap<u32, Vec<Detection>> = BTreeMap::new();
        for envelope in &self.envelopes {
            if let Some(detections) = &envelope.detections {
                by_input
                    .entry(envelope.input_index)
                    .or_default()
                    .extend(detections.iter().cloned());
            }
        }
        by_input
    }

    pub fn artifact(&self, kind: ArtifactKind) -> Option<&Artifact> {
        self.envelopes
            .iter()
            .filter_map(|e| e.artifact.as_ref())
            .find(|a| a.kind == kind)
    }
}

pub fn decode_frame_result(result: FrameResult) -> FrameOutcome {
    let meta = result.meta.as_ref().map(decode_meta).unwrap_or_default();
    FrameOutcome {
        frame_index: result.frame_index,
        envelopes: result.results.into_iter().map(decode_envelope).collect(),
        meta,
    }
}

fn decode_meta(meta: &Struct) -> FrameMeta {
    FrameMeta {
        runtime_ms: wkt::get_number(meta, "runtime_ms"),
        frame_count: wkt::get_number(meta, "frame_count").map(|n| n as u64),
        session_id: wkt::get_string(meta, "session_id").map(str::to_string),
        raw: struct_to_json(meta),
    }
}

pub fn decode_envelope(envelope: ResultEnvelope) -> DecodedEnvelope {
    let mut decoded = DecodedEnvelope {
        input_index: envelope.input_index,
        kind: envelope.kind,
        content_type: envelope.content_type,
        meta: envelope.meta.as_ref().map(struct_to_json),
        ..Default::default()
    };

    let value = match envelope.payload {
        None => return decoded,
        Some(Payload::Binary(data)) => {
            decoded.artifact = Some(Artifact {
                kind: artifact_kind(&decoded.kind, &decoded.content_type),
                content_type: decoded.content_type.clone(),
                data,
            });
            return decoded;
        }
        Some(Payload::Json(value)) => struct_to_json(&value),
        Some(Payload::Message(any)) => match wkt::unpack_struct(&any) {
            Ok(value) => struct_to_json(&value),
            Err(e) => {
                tracing::warn!("Skipping {} envelope: {}", decoded.kind, e);
                return decoded;
            }
        },
        Some(Payload::Text(text)) => {
            serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
        }
    };

    if DETECTION_KINDS.contains(&decoded.kind.as_str()) {
        let mut detections = Vec::new();
        for record in detection_records(&value) {
            match decode_detection(record) {
                Ok(detection) => detections.push(detection),
                Err(reason) => {
                    tracing::debug!("Dropping detection record: {}", reason);
                    decoded.skipped += 1;
                }
            }
        }
        decoded.detections = Some(detections);
    } else {
        decoded.data = Some(value);
    }
    decoded
}

fn artifact_kind(kind: &str, content_type: &str) -> ArtifactKind {
    if content_type.starts_with("video/") || kind == "video" {
        ArtifactKind::Video
    } else if content_type.starts_with("image/") || kind == "overlay" {
        ArtifactKind::Overlay
    } else {
        ArtifactKind::Binary
    }
}

fn detection_records(value: &JsonValue) -> &[JsonValue] {
    match value {
        JsonValue::Array(items) => items,
        JsonValue::Object(map) => DETECTION_LIST_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(JsonValue::as_array))
            .map(Vec::as_slice)
            .unwrap_or_default(),
        _ => &[],
    }
}

/// Numbers arrive as f64. Identifier fields are narrowed by truncation.
pub fn decode_detection(record: &JsonValue) -> Result<Detection, DecodeSkipped> {
    let map = record.as_object().ok_or(DecodeSkipped::NotAnObject)?;
    let number = |key: &'static str| -> Result<f64, DecodeSkipped> {
        map.get(key)
            .and_then(JsonValue::as_f64)
            .ok_or(DecodeSkipped::MissingField(key))
    };

    let class_id = number("class_id")?;
    let score = number("score")?;
    let x = number("x")?;
    let y = number("y")?;
    let width = number("width")?;
    let height = number("height")?;

    if !(0.0..=1.0).contains(&score) {
        return Err(DecodeSkipped::ScoreOutOfRange(score));
    }
    if width < 0.0 || height < 0.0 {
        return Err(DecodeSkipped::NegativeSize(width, height));
    }

    Ok(Detection {
        class_name: map
            .get("class_name")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string(),
        class_id: class_id as i32,
        score,
        x,
        y,
        width,
        height,
        track_id: map
            .get("track_id")
            .and_then(JsonValue::as_f64)
            .map(|id| id as i32),
    })
}

pub fn struct_to_json(value: &Struct) -> JsonValue {
    JsonValue::Object(
        value
            .fields
            .iter()
            .map(|(key, value)| (key.clone(), value_to_json(value)))
            .collect::<Map<String, JsonValue>>(),
    )
}

fn value_to_json(value: &Value) -> JsonValue {
    match &value.kind {
        None | Some(Kind::NullValue(_)) => JsonValue::Null,
        Some(Kind::NumberValue(n)) => serde_json::Number::from_f64(*n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Some(Kind::StringValue(s)) => JsonValue::String(s.clone()),
        Some(Kind::BoolValue(b)) => JsonValue::Bool(*b),
        Some(Kind::StructValue(s)) => struct_to_json(s),
        Some(Kind::ListValue(list)) => {
            JsonValue::Array(list.values.iter().map(value_to_json).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(entries: Vec<(&str, Value)>) -> Value {
        wkt::structure(wkt::fields(entries))
    }

    fn person() -> Value {
        item(vec![
            ("class_name", wkt::string("person")),
            ("class_id", wkt::number(0.0)),
            ("score", wkt::number(0.9)),
            ("x", wkt::number(10.0)),
            ("y", wkt::number(20.0)),
            ("width", wkt::number(30.0)),
            ("height", wkt::number(40.0)),
        ])
    }

    fn detections_envelope(items: Vec<Value>, index: u32) -> ResultEnvelope {
        ResultEnvelope {
            kind: "detections".to_string(),
            content_type: "application/x-protobuf".to_string(),
            payload: Some(Payload::Message(wkt::pack_struct(&wkt::fields([(
                "items",
                wkt::list(items),
            )])))),
            meta: None,
            input_index: index,
        }
    }

    #[test]
    fn test_malformed_item_does_not_drop_siblings() {
        let missing_score = item(vec![
            ("class_id", wkt::number(1.0)),
            ("x", wkt::number(0.0)),
            ("y", wkt::number(0.0)),
            ("width", wkt::number(5.0)),
            ("height", wkt::number(5.0)),
        ]);

        let decoded = decode_envelope(detections_envelope(vec![missing_score, person()], 0));

        let detections = decoded.detections.unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_name, "person");
        assert_eq!(decoded.skipped, 1);
    }

    #[test]
    fn test_identifiers_are_truncated_not_rounded() {
        let record = serde_json::json!({
            "class_id": 2.9,
            "track_id": 7.99,
            "score": 0.5,
            "x": 0.0, "y": 0.0, "width": 1.0, "height": 1.0
        });

        let detection = decode_detection(&record).unwrap();

        assert_eq!(detection.class_id, 2);
        assert_eq!(detection.track_id, Some(7));
        assert_eq!(detection.class_name, "");
    }

    #[test]
    fn test_invariant_violations_are_skipped() {
        let high_score = serde_json::json!({
            "class_id": 0, "score": 1.5, "x": 0, "y": 0, "width": 1, "height": 1
        });
        let negative = serde_json::json!({
            "class_id": 0, "score": 0.5, "x": 0, "y": 0, "width": -1, "height": 1
        });

        assert_eq!(
            decode_detection(&high_score),
            Err(DecodeSkipped::ScoreOutOfRange(1.5))
        );
        assert_eq!(
            decode_detection(&negative),
            Err(DecodeSkipped::NegativeSize(-1.0, 1.0))
        );
        assert_eq!(
            decode_detection(&serde_json::json!([1, 2])),
            Err(DecodeSkipped::NotAnObject)
        );
    }

    #[test]
    fn test_binary_payload_becomes_artifact() {
        let overlay = decode_envelope(ResultEnvelope {
            kind: "overlay".to_string(),
            content_type: "image/jpeg".to_string(),
            payload: Some(Payload::Binary(vec![0xFF, 0xD8])),
            meta: None,
            input_index: 0,
        });
        let video = decode_envelope(ResultEnvelope {
            kind: "rendered".to_string(),
            content_type: "video/mp4".to_string(),
            payload: Some(Payload::Binary(vec![0, 0, 0, 0x18])),
            meta: None,
            input_index: 0,
        });

        assert_eq!(overlay.artifact.unwrap().kind, ArtifactKind::Overlay);
        assert_eq!(video.artifact.unwrap().kind, ArtifactKind::Video);
        assert!(overlay.detections.is_none());
    }

    #[test]
    fn test_text_and_json_detection_payloads() {
        let text = decode_envelope(ResultEnvelope {
            kind: "tracks".to_string(),
            content_type: "application/json".to_string(),
            payload: Some(Payload::Text(
                r#"[{"class_id": 3, "score": 0.7, "x": 1, "y": 2, "width": 3, "height": 4, "track_id": 11}]"#
                    .to_string(),
            )),
            meta: None,
            input_index: 1,
        });
        let echo = decode_envelope(ResultEnvelope {
            kind: "echo".to_string(),
            content_type: "application/json".to_string(),
            payload: Some(Payload::Json(wkt::fields([("text_len", wkt::number(5.0))]))),
            meta: None,
            input_index: 0,
        });

        assert_eq!(text.detections.unwrap()[0].track_id, Some(11));
        assert_eq!(echo.data.unwrap()["text_len"], serde_json::json!(5.0));
        assert!(echo.detections.is_none());
    }

    #[test]
    fn test_frame_result_groups_detections_by_input() {
        let result = FrameResult {
            frame_index: 3,
            results: vec![
                detections_envelope(vec![person()], 1),
                detections_envelope(vec![person(), person()], 0),
            ],
            meta: Some(wkt::fields([
                ("runtime_ms", wkt::number(12.5)),
                ("frame_count", wkt::number(4.0)),
                ("session_id", wkt::string("abc")),
            ])),
        };

        let outcome = decode_frame_result(result);

        assert_eq!(outcome.frame_index, 3);
        assert_eq!(outcome.detections().len(), 3);
        let by_input = outcome.detections_by_input();
        assert_eq!(by_input[&0].len(), 2);
        assert_eq!(by_input[&1].len(), 1);
        assert_eq!(outcome.meta.runtime_ms, Some(12.5));
        assert_eq!(outcome.meta.frame_count, Some(4));
        assert_eq!(outcome.meta.session_id.as_deref(), Some("abc"));
    }
}
