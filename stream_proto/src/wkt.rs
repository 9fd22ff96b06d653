//! Helpers around the protobuf well-known types carried by the protocol.

use prost::Message;
use prost_types::{value::Kind, Any, ListValue, Struct, Value};
use thiserror::Error;

pub const STRUCT_TYPE_URL: &str = "type.googleapis.com/google.protobuf.Struct";

#[derive(Error, Debug)]
pub enum UnpackError {
    #[error("unexpected message type: {0}")]
    UnexpectedType(String),
    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),
}

pub fn pack_struct(value: &Struct) -> Any {
    Any {
        type_url: STRUCT_TYPE_URL.to_string(),
        value: value.encode_to_vec(),
    }
}

pub fn unpack_struct(any: &Any) -> Result<Struct, UnpackError> {
    if !any.type_url.ends_with("google.protobuf.Struct") {
        return Err(UnpackError::UnexpectedType(any.type_url.clone()));
    }
    Ok(Struct::decode(any.value.as_slice())?)
}

pub fn number(value: f64) -> Value {
    Value {
        kind: Some(Kind::NumberValue(value)),
    }
}

pub fn string(value: impl Into<String>) -> Value {
    Value {
        kind: Some(Kind::StringValue(value.into())),
    }
}

pub fn boolean(value: bool) -> Value {
    Value {
        kind: Some(Kind::BoolValue(value)),
    }
}

pub fn list(values: Vec<Value>) -> Value {
    Value {
        kind: Some(Kind::ListValue(ListValue { values })),
    }
}

pub fn structure(value: Struct) -> Value {
    Value {
        kind: Some(Kind::StructValue(value)),
    }
}

pub fn fields<'a>(entries: impl IntoIterator<Item = (&'a str, Value)>) -> Struct {
    Struct {
        fields: entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect(),
    }
}

pub fn get_number(value: &Struct, key: &str) -> Option<f64> {
    match value.fields.get(key)?.kind.as_ref()? {
        Kind::NumberValue(n) => Some(*n),
        _ => None,
    }
}

pub fn get_string<'a>(value: &'a Struct, key: &str) -> Option<&'a str> {
    match value.fields.get(key)?.kind.as_ref()? {
        Kind::StringValue(s) => Some(s.as_str()),
        _ => None,
    }
}

pub fn get_bool(value: &Struct, key: &str) -> Option<bool> {
    match value.fields.get(key)?.kind.as_ref()? {
        Kind::BoolValue(b) => Some(*b),
        _ => None,
    }
}
