//! Recover JSON values from output that may be truncated or mixed with noise.
//!
//! Tester processes run learner code, so their stdout can contain stray
//! prints, or stop halfway through a value when a process is killed. Every
//! complete value that can be found is still reported.

use serde_json::{Deserializer, Value};

/// Shape a decoded value must have to be kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonKind {
    Object,
    Array,
    String,
    Number,
    Bool,
    Null,
}

impl JsonKind {
    pub fn matches(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (JsonKind::Object, Value::Object(_))
                | (JsonKind::Array, Value::Array(_))
                | (JsonKind::String, Value::String(_))
                | (JsonKind::Number, Value::Number(_))
                | (JsonKind::Bool, Value::Bool(_))
                | (JsonKind::Null, Value::Null)
        )
    }
}

/// Decode every complete JSON value in `text`.
///
/// Returns the values in order and whether any non-whitespace part of the
/// input could not be attributed to a kept value. When `expected` is set,
/// values of another kind are dropped and count as malformed.
pub fn decode(text: &str, expected: Option<JsonKind>) -> (Vec<Value>, bool) {
    let text = text.trim();
    let mut values = Vec::new();
    let mut malformed = false;
    let mut pos = 0;

    while pos < text.len() {
        let rest = &text[pos..];
        let mut stream = Deserializer::from_str(rest).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let consumed = stream.byte_offset();
                if expected.map_or(true, |kind| kind.matches(&value)) {
                    values.push(value);
                } else if !rest[..consumed].trim().is_empty() {
                    malformed = true;
                }
                pos += consumed.max(1);
            }
            Some(Err(_)) => {
                let skipped = rest.chars().next().unwrap_or(' ');
                if !skipped.is_whitespace() {
                    malformed = true;
                }
                pos += skipped.len_utf8();
            }
            None => break,
        }
    }

    (values, malformed)
}
