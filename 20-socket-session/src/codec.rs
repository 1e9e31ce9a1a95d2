//! JSON envelope exchanged with the server.
//!
//! Every outbound frame is a [`Package`], every inbound frame a
//! [`PackageResponse`]. Both carry a [`PackageInfo`] header that says what kind
//! of message it is and, for correlated calls, which sequence number it answers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DecodeError, ServerError};

/// Coarse category of a protocol message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Auth,
    Call,
    Group,
    Broadcast,
    Channel,
}

/// Name of a request, or the subject of a broadcast. The server may use numbers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestName {
    Name(String),
    Number(i64),
}

impl fmt::Display for RequestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestName::Name(name) => f.write_str(name),
            RequestName::Number(number) => write!(f, "{number}"),
        }
    }
}

impl From<&str> for RequestName {
    fn from(name: &str) -> Self {
        RequestName::Name(name.to_string())
    }
}

impl From<String> for RequestName {
    fn from(name: String) -> Self {
        RequestName::Name(name)
    }
}

impl From<i64> for RequestName {
    fn from(number: i64) -> Self {
        RequestName::Number(number)
    }
}

impl RequestName {
    /// True when this is the textual name `name`.
    pub fn is(&self, name: &str) -> bool {
        matches!(self, RequestName::Name(own) if own == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageInfo {
    pub action: Action,
    pub request: RequestName,
    /// Target group for `group` actions, destination client for `channel`
    /// relays, empty otherwise.
    #[serde(default)]
    pub group: String,
    /// Broadcast pushes carry no meaningful sequence; it defaults to 0.
    #[serde(default)]
    pub sequence: u64,
}

/// Outbound envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Package {
    pub info: PackageInfo,
    pub data: Value,
}

/// Inbound envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageResponse {
    pub info: PackageInfo,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub response: Value,
}

impl PackageResponse {
    /// Splits the envelope into the server's verdict: the error when one is
    /// set, the response otherwise. `false`, `0` and `""` count as unset,
    /// just like `null` or a missing field.
    pub fn into_outcome(self) -> Result<Value, ServerError> {
        match self.error {
            Some(error) if is_set(&error) => Err(ServerError(error)),
            _ => Ok(self.response),
        }
    }
}

fn is_set(error: &Value) -> bool {
    match error {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64() != Some(0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Reply shape of the `echo` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EchoReply<T> {
    #[serde(rename = "echoAt")]
    pub echo_at: f64,
    pub received: T,
}

/// Reply shape of the group membership calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupAck {
    pub done: bool,
}

/// Serializes a package to a text frame. No shape validation happens here.
pub fn encode(package: &Package) -> Result<String, serde_json::Error> {
    serde_json::to_string(package)
}

/// Parses a text frame into a response envelope.
pub fn decode(frame: &str) -> Result<PackageResponse, DecodeError> {
    serde_json::from_str(frame).map_err(|source| DecodeError {
        frame: frame.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn outbound_frame_uses_wire_field_names() {
        let package = Package {
            info: PackageInfo {
                action: Action::Group,
                request: "join".into(),
                group: "g1".into(),
                sequence: 4,
            },
            data: Value::Null,
        };

        let frame: Value = serde_json::from_str(&encode(&package).expect("encode")).expect("json");
        assert_eq!(
            frame,
            json!({
                "info": {"action": "group", "request": "join", "group": "g1", "sequence": 4},
                "data": null
            })
        );
    }

    #[test]
    fn response_roundtrip_preserves_error_and_numeric_request() {
        let response = PackageResponse {
            info: PackageInfo {
                action: Action::Call,
                request: RequestName::Number(7),
                group: String::new(),
                sequence: 12,
            },
            error: Some(json!({"code": 403})),
            response: json!({"nested": [1, 2, 3]}),
        };

        let frame = serde_json::to_string(&response).expect("encode");
        assert_eq!(decode(&frame).expect("decode"), response);
    }

    #[test]
    fn broadcast_push_without_sequence_or_group_decodes() {
        let frame = r#"{"info":{"action":"broadcast","request":"news"},"error":null,"response":{"x":1}}"#;
        let decoded = decode(frame).expect("decode");

        assert_eq!(decoded.info.action, Action::Broadcast);
        assert!(decoded.info.request.is("news"));
        assert_eq!(decoded.info.sequence, 0);
        assert_eq!(decoded.info.group, "");
        assert_eq!(decoded.into_outcome(), Ok(json!({"x": 1})));
    }

    #[test]
    fn malformed_frames_are_decode_errors() {
        let err = decode("not json").expect_err("garbage must fail");
        assert_eq!(err.frame, "not json");

        assert!(decode(r#"{"info":{"action":"teleport","request":"x"}}"#).is_err());
        assert!(decode(r#"{"error":null}"#).is_err());
    }

    #[test]
    fn error_field_turns_into_server_error() {
        let frame = r#"{"info":{"action":"call","request":"x","group":"","sequence":0},"error":"boom","response":null}"#;
        let outcome = decode(frame).expect("decode").into_outcome();
        assert_eq!(outcome, Err(ServerError(json!("boom"))));
    }

    #[test]
    fn falsy_error_values_leave_the_response_intact() {
        for error in [json!(null), json!(false), json!(0), json!(""), json!(0.0)] {
            let frame = json!({
                "info": {"action": "call", "request": "x", "group": "", "sequence": 1},
                "error": error,
                "response": "ok",
            });
            let outcome = decode(&frame.to_string()).expect("decode").into_outcome();
            assert_eq!(outcome, Ok(json!("ok")), "error field {error}");
        }
        for error in [json!(true), json!(1), json!("no"), json!([]), json!({})] {
            let frame = json!({
                "info": {"action": "call", "request": "x", "group": "", "sequence": 1},
                "error": error,
                "response": "ok",
            });
            let outcome = decode(&frame.to_string()).expect("decode").into_outcome();
            assert_eq!(outcome, Err(ServerError(error.clone())), "error field {error}");
        }
    }
}
