//! Field codecs applied between in-memory values and encoded records.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;
use std::sync::Arc;

/// Transforms one field between its in-memory and encoded forms.
///
/// `decode(encode(x)) == x` must hold for every value the codec accepts.
/// Values a codec does not understand pass through unchanged.
pub trait FieldCodec: Send + Sync {
    fn encode(&self, value: &Value) -> Value;
    fn decode(&self, value: &Value) -> Value;
}

/// Shared codec handle.
pub type SharedCodec = Arc<dyn FieldCodec>;

/// RFC 3339 timestamps in memory, epoch milliseconds when encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateCodec;

impl FieldCodec for DateCodec {
    fn encode(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => match DateTime::parse_from_rfc3339(s) {
                Ok(date) => Value::from(date.timestamp_millis()),
                Err(_) => value.clone(),
            },
            _ => value.clone(),
        }
    }

    fn decode(&self, value: &Value) -> Value {
        match value.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()) {
            Some(date) => Value::from(date.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => value.clone(),
        }
    }
}

/// Codec built from a pair of closures.
pub struct FnCodec<E, D> {
    encode: E,
    decode: D,
}

impl<E, D> FnCodec<E, D>
where
    E: Fn(&Value) -> Value + Send + Sync,
    D: Fn(&Value) -> Value + Send + Sync,
{
    pub fn new(encode: E, decode: D) -> Self {
        Self { encode, decode }
    }
}

impl<E, D> FieldCodec for FnCodec<E, D>
where
    E: Fn(&Value) -> Value + Send + Sync,
    D: Fn(&Value) -> Value + Send + Sync,
{
    fn encode(&self, value: &Value) -> Value {
        (self.encode)(value)
    }

    fn decode(&self, value: &Value) -> Value {
        (self.decode)(value)
    }
}

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
