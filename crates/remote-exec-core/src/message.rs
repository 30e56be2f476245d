//! JSON-RPC 2.0 message model.
//!
//! Every frame on the wire is one [`Message`]. The enum is converted to and
//! from a flat envelope so that the tagged Rust shape never leaks into the
//! JSON, which stays `{jsonrpc, id?, method?, params?, result?, error?}`.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Protocol version carried in every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard and implementation-defined error codes.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Synthesized locally for calls outstanding when a session closes.
    pub const CONNECTION_CLOSED: i64 = -32000;
}

/// Correlation identifier of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Create an error without attached data.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    #[must_use]
    pub fn invalid_params(detail: impl fmt::Display) -> Self {
        Self::new(codes::INVALID_PARAMS, format!("Invalid params: {detail}"))
    }

    #[must_use]
    pub fn internal(detail: impl fmt::Display) -> Self {
        Self::new(codes::INTERNAL_ERROR, format!("Internal error: {detail}"))
    }

    #[must_use]
    pub fn connection_closed() -> Self {
        Self::new(codes::CONNECTION_CLOSED, "connection closed")
    }
}

/// Request expecting exactly one response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

/// Fire-and-forget message; never answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// Outcome half of a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Result(Value),
    Error(RpcError),
}

/// Response correlated to a request by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub payload: ResponsePayload,
}

impl Response {
    /// Successful response.
    #[must_use]
    pub const fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            payload: ResponsePayload::Result(result),
        }
    }

    /// Failed response.
    #[must_use]
    pub const fn error(id: RequestId, error: RpcError) -> Self {
        Self {
            id,
            payload: ResponsePayload::Error(error),
        }
    }

    /// Split into the result value or the remote error.
    ///
    /// # Errors
    /// Returns the remote error when the response carries one.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.payload {
            ResponsePayload::Result(value) => Ok(value),
            ResponsePayload::Error(err) => Err(err),
        }
    }
}

/// One JSON-RPC frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Envelope", into = "Envelope")]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    /// Build a request frame.
    #[must_use]
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    /// Build a notification frame.
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    /// Correlation id, if the frame has one.
    #[must_use]
    pub const fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Response(r) => Some(&r.id),
            Self::Notification(_) => None,
        }
    }

    /// Method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }
}

impl From<Response> for Message {
    fn from(value: Response) -> Self {
        Self::Response(value)
    }
}

/// Flat wire shape shared by all three message kinds.
#[derive(Serialize, Deserialize)]
struct Envelope {
    jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

/// `"result": null` is a valid result and must not collapse into "absent".
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<Envelope> for Message {
    type Error = String;

    fn try_from(env: Envelope) -> Result<Self, Self::Error> {
        if env.jsonrpc != JSONRPC_VERSION {
            return Err(format!("unsupported jsonrpc version: {}", env.jsonrpc));
        }
        match (env.id, env.method) {
            (Some(id), Some(method)) => Ok(Self::Request(Request {
                id,
                method,
                params: env.params,
            })),
            (None, Some(method)) => Ok(Self::Notification(Notification {
                method,
                params: env.params,
            })),
            (Some(id), None) => {
                let payload = match (env.error, env.result) {
                    (Some(error), _) => ResponsePayload::Error(error),
                    (None, Some(result)) => ResponsePayload::Result(result),
                    (None, None) => return Err(format!("response {id} has neither result nor error")),
                };
                Ok(Self::Response(Response { id, payload }))
            }
            (None, None) => Err("message has neither id nor method".to_owned()),
        }
    }
}

impl From<Message> for Envelope {
    fn from(msg: Message) -> Self {
        let mut env = Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        };
        match msg {
            Message::Request(r) => {
                env.id = Some(r.id);
                env.method = Some(r.method);
                env.params = r.params;
            }
            Message::Notification(n) => {
                env.method = Some(n.method);
                env.params = n.params;
            }
            Message::Response(r) => {
                env.id = Some(r.id);
                match r.payload {
                    ResponsePayload::Result(v) => env.result = Some(v),
                    ResponsePayload::Error(e) => env.error = Some(e),
                }
            }
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let msg = Message::request(7, "tools/call", Some(json!({"name": "x"})));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": 7, "method": "tools/call", "params": {"name": "x"}})
        );
    }

    #[test]
    fn test_notification_has_no_id() {
        let msg = Message::notification("notifications/initialized", None);
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#);
    }

    #[test]
    fn test_null_result_is_a_result() {
        let msg: Message = serde_json::from_str(r#"{"jsonrpc":"2.0","id":"a","result":null}"#).unwrap();
        assert_eq!(
            msg,
            Message::Response(Response::success(RequestId::from("a"), Value::Null))
        );
    }

    #[test]
    fn test_error_response_parses() {
        let msg: Message = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"nope"}}"#,
        )
        .unwrap();
        let Message::Response(resp) = msg else {
            panic!("expected response");
        };
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.code, codes::METHOD_NOT_FOUND);
        assert_eq!(err.message, "nope");
    }

    #[test]
    fn test_rejects_malformed_envelopes() {
        assert!(serde_json::from_str::<Message>(r#"{"jsonrpc":"2.0","id":1}"#).is_err());
        assert!(serde_json::from_str::<Message>(r#"{"jsonrpc":"1.0","id":1,"method":"x"}"#).is_err());
        assert!(serde_json::from_str::<Message>(r#"{"jsonrpc":"2.0"}"#).is_err());
    }

    #[test]
    fn test_string_and_number_ids_are_distinct() {
        assert_ne!(RequestId::from(1), RequestId::from("1"));
    }
}
