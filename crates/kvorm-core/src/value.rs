//! Scalar values and the tagged string codec.
//!
//! Every scalar is stored as a string carrying a two-character type tag:
//!
//! | Value            | Encoding          |
//! |------------------|-------------------|
//! | number           | `i:<value>`       |
//! | string           | `s:<value>`       |
//! | boolean          | `b:1` / `b:0`     |
//! | date             | `d:<epochMillis>` |
//! | JSON object/array| `j:<json>`        |
//! | null             | `null`            |
//!
//! The tags `e:`, `a:` and `m:` mark references to other records (entity
//! hashes, set records, map records). [`decode`] hands those back untouched as
//! [`Decoded::Reference`] so the caller can resolve them.
//!
//! The tag format is a wire contract shared with any pre-existing stored data
//! and must not change.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const NULL_LITERAL: &str = "null";
pub const TAG_NUMBER: &str = "i:";
pub const TAG_STRING: &str = "s:";
pub const TAG_BOOL: &str = "b:";
pub const TAG_DATE: &str = "d:";
pub const TAG_JSON: &str = "j:";
pub const TAG_ENTITY: &str = "e:";
pub const TAG_SET: &str = "a:";
pub const TAG_MAP: &str = "m:";

/// A scalar field value.
///
/// `Int` and `Float` share the `i:` tag. Decoding produces `Int` whenever the
/// stored text parses as an `i64`, so `Float(2.0)` comes back as `Int(2)`; the
/// two compare equal. Floats beyond `f64` precision lose digits on the way
/// through, which is a documented ceiling rather than an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    Json(serde_json::Value),
}

impl Value {
    /// Builds a [`Value::Date`] from a wall-clock time.
    pub fn date(time: SystemTime) -> Self {
        let millis = match time.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis() as i64,
            Err(e) => -(e.duration().as_millis() as i64),
        };
        Value::Date(millis)
    }

    /// Converts a [`Value::Date`] back into a wall-clock time.
    pub fn as_system_time(&self) -> Option<SystemTime> {
        match self {
            Value::Date(ms) if *ms >= 0 => Some(UNIX_EPOCH + Duration::from_millis(*ms as u64)),
            Value::Date(ms) => UNIX_EPOCH.checked_sub(Duration::from_millis(ms.unsigned_abs())),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

/// A value in its stored string form: a tagged scalar, the `null` literal, or
/// a record key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodedValue(String);

impl EncodedValue {
    /// Wraps a string read back from storage without validating it.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        EncodedValue(raw.into())
    }

    /// The encoded `null` literal.
    pub fn null() -> Self {
        EncodedValue(NULL_LITERAL.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == NULL_LITERAL
    }

    /// True for `e:`, `a:` and `m:` values.
    pub fn is_reference(&self) -> bool {
        is_reference(&self.0)
    }
}

impl fmt::Display for EncodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<EncodedValue> for String {
    fn from(v: EncodedValue) -> Self {
        v.0
    }
}

/// Returns true when `raw` carries one of the record reference tags.
pub fn is_reference(raw: &str) -> bool {
    raw.starts_with(TAG_ENTITY) || raw.starts_with(TAG_SET) || raw.starts_with(TAG_MAP)
}

/// Encodes a scalar into its tagged string form.
///
/// Every [`Value`] is representable. A field with no value at all (the
/// "undefined" state) is represented by the field's absence and never reaches
/// the codec.
pub fn encode(value: &Value) -> EncodedValue {
    let raw = match value {
        Value::Null => NULL_LITERAL.to_string(),
        Value::Int(n) => format!("{TAG_NUMBER}{n}"),
        Value::Float(f) => format!("{TAG_NUMBER}{f}"),
        Value::Str(s) => format!("{TAG_STRING}{s}"),
        Value::Bool(b) => format!("{TAG_BOOL}{}", if *b { 1 } else { 0 }),
        Value::Date(ms) => format!("{TAG_DATE}{ms}"),
        Value::Json(json) => format!("{TAG_JSON}{json}"),
    };
    EncodedValue(raw)
}

/// Result of decoding one stored string.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Value(Value),
    /// An `e:`, `a:` or `m:` key, returned verbatim for the caller to resolve.
    Reference(String),
}

/// Decodes a stored string by reading its two-character tag.
pub fn decode(raw: &str) -> Result<Decoded, CoreError> {
    if raw == NULL_LITERAL {
        return Ok(Decoded::Value(Value::Null));
    }
    if is_reference(raw) {
        return Ok(Decoded::Reference(raw.to_string()));
    }
    let (tag, body) = match (raw.get(..2), raw.get(2..)) {
        (Some(tag), Some(body)) => (tag, body),
        _ => return Err(codec_error(raw, "missing type tag")),
    };
    let value = match tag {
        TAG_NUMBER => decode_number(raw, body)?,
        TAG_STRING => Value::Str(body.to_string()),
        TAG_BOOL => match body {
            "1" => Value::Bool(true),
            "0" => Value::Bool(false),
            _ => return Err(codec_error(raw, "boolean must be 1 or 0")),
        },
        TAG_DATE => match body.parse::<i64>() {
            Ok(ms) => Value::Date(ms),
            Err(_) => match body.parse::<f64>() {
                Ok(ms) if ms.is_finite() => Value::Date(ms as i64),
                _ => return Err(codec_error(raw, "date must be epoch milliseconds")),
            },
        },
        TAG_JSON => Value::Json(
            serde_json::from_str(body).map_err(|e| codec_error(raw, &e.to_string()))?,
        ),
        _ => return Err(codec_error(raw, "unknown type tag")),
    };
    Ok(Decoded::Value(value))
}

/// Decodes a stored string that must be a scalar, rejecting references.
pub fn decode_scalar(raw: &str) -> Result<Value, CoreError> {
    match decode(raw)? {
        Decoded::Value(v) => Ok(v),
        Decoded::Reference(_) => Err(codec_error(raw, "expected a scalar, found a reference")),
    }
}

fn decode_number(raw: &str, body: &str) -> Result<Value, CoreError> {
    if let Ok(n) = body.parse::<i64>() {
        return Ok(Value::Int(n));
    }
    body.parse::<f64>()
        .map(Value::Float)
        .map_err(|_| codec_error(raw, "not a number"))
}

fn codec_error(raw: &str, reason: &str) -> CoreError {
    CoreError::Codec {
        encoded: raw.to_string(),
        reason: reason.to_string(),
    }
}
