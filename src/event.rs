//! Decoding of raw function input into log records.
//!
//! OCI Service Connector Hub delivers log events to the function as a JSON
//! array of objects. Anything else is rejected so the run aborts before any
//! worker is started.

use serde_json::Value;

use crate::record::Record;

/// Kind of event detected in the raw input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// A batch of OCI Logging entries
    OciLogging,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::OciLogging => write!(f, "ociLogging"),
        }
    }
}

/// A decoded function invocation payload.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub records: Vec<Record>,
}

/// Errors raised while decoding the raw input.
#[derive(Debug)]
pub enum ParseError {
    /// Input is not valid JSON
    Json(serde_json::Error),

    /// Input is JSON but not an array of log entries
    UnexpectedShape(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Json(e) => write!(f, "failed to decode log events payload: {}", e),
            ParseError::UnexpectedShape(msg) => {
                write!(f, "unexpected log events payload: {}", msg)
            }
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ParseError::Json(e) => Some(e),
            ParseError::UnexpectedShape(_) => None,
        }
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::Json(err)
    }
}

/// Decode raw input bytes into an [`Event`].
pub fn parse_event(input: &[u8]) -> Result<Event, ParseError> {
    let value: Value = serde_json::from_slice(input)?;

    let entries = match value {
        Value::Array(entries) => entries,
        other => {
            return Err(ParseError::UnexpectedShape(format!(
                "expected an array of log entries, found {}",
                json_kind(&other)
            )))
        }
    };

    let records = entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| match entry {
            Value::Object(record) => Ok(record),
            other => Err(ParseError::UnexpectedShape(format!(
                "log entry {} is {}, expected an object",
                index,
                json_kind(&other)
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Event {
        event_type: EventType::OciLogging,
        records,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
