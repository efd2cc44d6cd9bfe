//! Frames and body codecs. Bodies are JSON; the adapter and coordinator layers
//! each decode with their own configured encoding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::CONNECTED_COMMAND;

pub type Headers = BTreeMap<String, String>;

/// One frame as delivered by the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub command: Option<String>,
    pub headers: Headers,
    pub body: Option<String>,
}

impl Frame {
    /// Broker-level connect acknowledgment.
    pub fn connected() -> Self {
        Self {
            command: Some(CONNECTED_COMMAND.to_owned()),
            ..Self::default()
        }
    }

    /// Broker-level error, e.g. a refused connection.
    pub fn error(message: impl Into<String>) -> Self {
        let mut headers = Headers::new();
        headers.insert("message".to_owned(), message.into());
        Self {
            command: Some("ERROR".to_owned()),
            headers,
            body: None,
        }
    }

    pub fn message(destination: &str, body: String) -> Self {
        let mut headers = Headers::new();
        headers.insert("destination".to_owned(), destination.to_owned());
        Self {
            command: Some("MESSAGE".to_owned()),
            headers,
            body: Some(body),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.command.as_deref() == Some(CONNECTED_COMMAND)
    }
}

/// How many times a body is JSON-encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    /// The body is the JSON payload.
    #[default]
    Single,
    /// The body is a JSON string whose content is the JSON payload.
    Double,
}

impl std::str::FromStr for BodyEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(BodyEncoding::Single),
            "double" => Ok(BodyEncoding::Double),
            other => Err(format!("unknown body encoding: {}", other)),
        }
    }
}

/// Decode a frame body into its envelope object.
pub fn decode_body(body: &str, encoding: BodyEncoding) -> Result<Map<String, Value>, BodyDecodeError> {
    let value: Value = match encoding {
        BodyEncoding::Single => serde_json::from_str(body)?,
        BodyEncoding::Double => {
            let inner: String = serde_json::from_str(body)?;
            serde_json::from_str(&inner)?
        }
    };
    match value {
        Value::Object(map) => Ok(map),
        Value::String(_) => Err(BodyDecodeError::StillEncoded),
        _ => Err(BodyDecodeError::NotAnObject),
    }
}

/// Encode an outbound message. Outbound bodies are always single-encoded.
pub fn encode_body<T: Serialize + ?Sized>(message: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Encode with an explicit encoding; used by broker implementations that emit inbound frames.
pub fn encode_body_as<T: Serialize + ?Sized>(
    message: &T,
    encoding: BodyEncoding,
) -> Result<String, serde_json::Error> {
    let once = serde_json::to_string(message)?;
    match encoding {
        BodyEncoding::Single => Ok(once),
        BodyEncoding::Double => serde_json::to_string(&once),
    }
}

/// Error decoding a frame body (bad JSON or wrong envelope shape).
#[derive(Debug, thiserror::Error)]
pub enum BodyDecodeError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("body decoded to a JSON string; the configured encoding is probably one level short")]
    StillEncoded,
    #[error("envelope is not a JSON object")]
    NotAnObject,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_and_double_decode() {
        let payload = json!({"type": "init", "uuid": "a"});
        let single = encode_body_as(&payload, BodyEncoding::Single).unwrap();
        let double = encode_body_as(&payload, BodyEncoding::Double).unwrap();
        assert!(double.starts_with('"'));

        let a = decode_body(&single, BodyEncoding::Single).unwrap();
        let b = decode_body(&double, BodyEncoding::Double).unwrap();
        assert_eq!(a, b);
        assert_eq!(a["uuid"], "a");
    }

    #[test]
    fn encoding_mismatch_is_reported() {
        let payload = json!({"type": "init"});
        let double = encode_body_as(&payload, BodyEncoding::Double).unwrap();
        assert!(matches!(
            decode_body(&double, BodyEncoding::Single),
            Err(BodyDecodeError::StillEncoded)
        ));
        let single = encode_body_as(&payload, BodyEncoding::Single).unwrap();
        assert!(matches!(
            decode_body(&single, BodyEncoding::Double),
            Err(BodyDecodeError::Json(_))
        ));
    }

    #[test]
    fn malformed_bodies() {
        assert!(matches!(
            decode_body("not json", BodyEncoding::Single),
            Err(BodyDecodeError::Json(_))
        ));
        assert!(matches!(
            decode_body("[1,2]", BodyEncoding::Single),
            Err(BodyDecodeError::NotAnObject)
        ));
    }

    #[test]
    fn encoding_from_str() {
        assert_eq!("Double".parse::<BodyEncoding>().unwrap(), BodyEncoding::Double);
        assert_eq!(" single ".parse::<BodyEncoding>().unwrap(), BodyEncoding::Single);
        assert!("triple".parse::<BodyEncoding>().is_err());
    }

    #[test]
    fn connected_frame() {
        assert!(Frame::connected().is_connected());
        assert!(!Frame::error("refused").is_connected());
        assert!(!Frame::message("/topic/x", "{}".into()).is_connected());
    }
}
