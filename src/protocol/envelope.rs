//! Wire envelope and payload types.
//!
//! Every frame carries one envelope: `{ id, type, payload }`. Requests carry
//! either a tool call `{ tool, arguments }` or a control method
//! `{ method, params }`; responses carry `{ result }` or `{ error }`.

use crate::error::{DbError, DbResult, ErrorPayload};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::fmt;

/// Protocol revision reported by `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-01";

/// Correlation id, echoed verbatim on the response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationId {
    Number(i64),
    String(String),
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for CorrelationId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Notification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub payload: JsonValue,
}

impl Envelope {
    pub fn request(id: impl Into<CorrelationId>, payload: JsonValue) -> Self {
        Self {
            id: Some(id.into()),
            kind: MessageType::Request,
            payload,
        }
    }

    pub fn notification(payload: JsonValue) -> Self {
        Self {
            id: None,
            kind: MessageType::Notification,
            payload,
        }
    }

    pub fn success(id: Option<CorrelationId>, result: JsonValue) -> Self {
        Self {
            id,
            kind: MessageType::Response,
            payload: json!({ "result": result }),
        }
    }

    pub fn failure(id: Option<CorrelationId>, error: &DbError) -> Self {
        Self::failure_payload(id, error.to_payload())
    }

    pub fn failure_payload(id: Option<CorrelationId>, error: ErrorPayload) -> Self {
        Self {
            id,
            kind: MessageType::Response,
            payload: json!({ "error": error }),
        }
    }

    pub fn response(id: Option<CorrelationId>, outcome: DbResult<JsonValue>) -> Self {
        match outcome {
            Ok(result) => Self::success(id, result),
            Err(err) => Self::failure(id, &err),
        }
    }

    /// Decode one frame.
    pub fn decode(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// `result` of a response envelope.
    pub fn result(&self) -> Option<&JsonValue> {
        self.payload.get("result")
    }

    /// `error` of a response envelope.
    pub fn error(&self) -> Option<&JsonValue> {
        self.payload.get("error")
    }
}

/// Best-effort correlation id from a frame that did not decode as an envelope.
pub fn recover_id(frame: &[u8]) -> Option<CorrelationId> {
    let value: JsonValue = serde_json::from_slice(frame).ok()?;
    serde_json::from_value(value.get("id")?.clone()).ok()
}

/// Control methods understood in any state.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    Initialize,
    Ping,
    ListTools,
    Cancel { id: CorrelationId },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestPayload {
    ToolCall { tool: String, arguments: JsonValue },
    Method(Method),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CancelParams {
    id: CorrelationId,
}

impl RequestPayload {
    pub fn parse(payload: &JsonValue) -> DbResult<Self> {
        let object = payload
            .as_object()
            .ok_or_else(|| DbError::protocol("Request payload must be an object"))?;

        if let Some(tool) = object.get("tool") {
            let tool = tool
                .as_str()
                .ok_or_else(|| DbError::protocol("'tool' must be a string"))?;
            let arguments = object.get("arguments").cloned().unwrap_or(JsonValue::Null);
            return Ok(Self::ToolCall {
                tool: tool.to_string(),
                arguments,
            });
        }

        let method = object
            .get("method")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| DbError::protocol("Request payload needs 'tool' or 'method'"))?;
        let params = object.get("params").cloned().unwrap_or(JsonValue::Null);

        let method = match method {
            "initialize" => Method::Initialize,
            "ping" => Method::Ping,
            "listTools" => Method::ListTools,
            "shutdown" => Method::Shutdown,
            "cancel" => {
                let params: CancelParams = serde_json::from_value(params)
                    .map_err(|e| DbError::protocol(format!("Invalid cancel params: {e}")))?;
                Method::Cancel { id: params.id }
            }
            other => return Err(DbError::protocol(format!("Unknown method '{other}'"))),
        };
        Ok(Self::Method(method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_echo_verbatim() {
        let env = Envelope::decode(br#"{"id":"abc-1","type":"request","payload":{}}"#).unwrap();
        assert_eq!(env.id, Some(CorrelationId::from("abc-1")));

        let env = Envelope::decode(br#"{"id":42,"type":"request","payload":{}}"#).unwrap();
        let out = Envelope::success(env.id, json!({}));
        let encoded: JsonValue = serde_json::from_slice(&out.encode().unwrap()).unwrap();
        assert_eq!(encoded["id"], 42);
        assert_eq!(encoded["type"], "response");
    }

    #[test]
    fn test_recover_id_from_bad_envelope() {
        assert_eq!(
            recover_id(br#"{"id":7,"type":"bogus"}"#),
            Some(CorrelationId::Number(7))
        );
        assert_eq!(recover_id(b"{not json"), None);
        assert_eq!(recover_id(br#"{"id":[1]}"#), None);
    }

    #[test]
    fn test_parse_tool_call() {
        let payload = json!({"tool": "listTables", "arguments": {"datasource": "main"}});
        match RequestPayload::parse(&payload).unwrap() {
            RequestPayload::ToolCall { tool, arguments } => {
                assert_eq!(tool, "listTables");
                assert_eq!(arguments["datasource"], "main");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_methods() {
        assert_eq!(
            RequestPayload::parse(&json!({"method": "initialize"})).unwrap(),
            RequestPayload::Method(Method::Initialize)
        );
        assert_eq!(
            RequestPayload::parse(&json!({"method": "cancel", "params": {"id": "q1"}})).unwrap(),
            RequestPayload::Method(Method::Cancel { id: "q1".into() })
        );
        assert!(RequestPayload::parse(&json!({"method": "reboot"})).is_err());
        assert!(RequestPayload::parse(&json!({"method": "cancel"})).is_err());
        assert!(RequestPayload::parse(&json!("ping")).is_err());
    }

    #[test]
    fn test_failure_payload_shape() {
        let env = Envelope::failure(Some(1.into()), &DbError::unknown_tool("dropAll"));
        let error = env.error().unwrap();
        assert_eq!(error["kind"], "UnknownTool");
        assert!(error["message"].as_str().unwrap().contains("dropAll"));
        assert!(env.result().is_none());
    }
}
