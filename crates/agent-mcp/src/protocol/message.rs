//! JSON-RPC 2.0 message model.
//!
//! A [`Message`] is one of three variants distinguished by field presence:
//!
//! - [`Request`]: `method` and `id` present, expects a response
//! - [`Notification`]: `method` present, no `id`
//! - [`Response`]: `id` present (possibly `null`) and exactly one of
//!   `result` / `error`
//!
//! Conversion from raw JSON is strict: anything ambiguous is rejected with a
//! [`DecodeError`] instead of being guessed at.

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use super::codec::DecodeError;
use super::error::JsonRpcError;

/// Protocol version carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Canonical version field.
const VERSION_FIELD: &str = "jsonrpc";
/// Alternate spelling of the version field accepted on decode.
const VERSION_FIELD_ALIAS: &str = "protocolVersion";

/// Request identifier: an integer or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric identifier
    Number(i64),
    /// String identifier
    String(String),
}

impl RequestId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

/// A call that expects a response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

/// A one-way call.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// Outcome half of a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Result(Value),
    Error(JsonRpcError),
}

/// Reply to a [`Request`].
///
/// `id` is `None` only when the request id could not be determined, which
/// serializes as `"id": null`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Option<RequestId>,
    pub payload: ResponsePayload,
}

impl Response {
    /// Successful response
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            payload: ResponsePayload::Result(result),
        }
    }

    /// Error response
    pub fn error(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            id,
            payload: ResponsePayload::Error(error),
        }
    }

    /// Returns the result value, if this is a success
    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            ResponsePayload::Result(v) => Some(v),
            ResponsePayload::Error(_) => None,
        }
    }

    /// Returns the error, if this is a failure
    pub fn error_object(&self) -> Option<&JsonRpcError> {
        match &self.payload {
            ResponsePayload::Error(e) => Some(e),
            ResponsePayload::Result(_) => None,
        }
    }
}

/// A validated JSON-RPC 2.0 envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    /// Build a request message.
    ///
    /// ```
    /// use agent_mcp::protocol::Message;
    /// use serde_json::json;
    ///
    /// let msg = Message::request(1, "tools/list", None);
    /// assert_eq!(msg.method(), Some("tools/list"));
    /// let msg = Message::request("abc", "tools/call", Some(json!({"name": "launch_agent"})));
    /// assert!(msg.is_request());
    /// ```
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request(Request {
            id: id.into(),
            method: method.into(),
            params: params.filter(|p| !p.is_null()),
        })
    }

    /// Build a notification message.
    ///
    /// `Some(Value::Null)` params are the same as no params, as on the wire.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification(Notification {
            method: method.into(),
            params: params.filter(|p| !p.is_null()),
        })
    }

    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) => None,
        }
    }

    /// Identifier for requests and responses.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(r) => Some(&r.id),
            Message::Response(r) => r.id.as_ref(),
            Message::Notification(_) => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, Message::Notification(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Message::Response(_))
    }

    /// Validate a parsed JSON document as an envelope.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut obj) = value else {
            return Err(DecodeError::InvalidShape("top level is not an object"));
        };

        check_version(&obj)?;

        let has_result = obj.contains_key("result");
        let has_error = obj.contains_key("error");

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(DecodeError::InvalidShape("method is not a string"));
            };
            if method.is_empty() {
                return Err(DecodeError::InvalidShape("method is empty"));
            }
            if has_result || has_error {
                return Err(DecodeError::InvalidShape("method alongside result or error"));
            }
            let params = take_params(&mut obj)?;

            return match obj.get("id") {
                None => Ok(Message::Notification(Notification { method, params })),
                Some(raw) => {
                    let id = RequestId::from_value(raw)
                        .ok_or(DecodeError::InvalidShape("request id is not a string or integer"))?;
                    Ok(Message::Request(Request { id, method, params }))
                }
            };
        }

        let Some(raw_id) = obj.get("id") else {
            return Err(DecodeError::InvalidShape("neither method nor id present"));
        };
        let id = match raw_id {
            Value::Null => None,
            other => Some(
                RequestId::from_value(other)
                    .ok_or(DecodeError::InvalidShape("response id is not a string or integer"))?,
            ),
        };

        let payload = match (obj.remove("result"), obj.remove("error")) {
            (Some(result), None) => ResponsePayload::Result(result),
            (None, Some(error)) => {
                let error: JsonRpcError = serde_json::from_value(error)
                    .map_err(|_| DecodeError::InvalidShape("error object is malformed"))?;
                ResponsePayload::Error(error)
            }
            (Some(_), Some(_)) => {
                return Err(DecodeError::InvalidShape("both result and error present"));
            }
            (None, None) => {
                return Err(DecodeError::InvalidShape("response without result or error"));
            }
        };

        Ok(Message::Response(Response { id, payload }))
    }

    /// Render as a JSON document with the canonical `jsonrpc` field.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert(VERSION_FIELD.to_string(), Value::from(JSONRPC_VERSION));
        match self {
            Message::Request(r) => {
                obj.insert("id".to_string(), id_value(Some(&r.id)));
                obj.insert("method".to_string(), Value::from(r.method.clone()));
                if let Some(params) = r.params.as_ref().filter(|p| !p.is_null()) {
                    obj.insert("params".to_string(), params.clone());
                }
            }
            Message::Notification(n) => {
                obj.insert("method".to_string(), Value::from(n.method.clone()));
                if let Some(params) = n.params.as_ref().filter(|p| !p.is_null()) {
                    obj.insert("params".to_string(), params.clone());
                }
            }
            Message::Response(r) => {
                obj.insert("id".to_string(), id_value(r.id.as_ref()));
                match &r.payload {
                    ResponsePayload::Result(v) => {
                        obj.insert("result".to_string(), v.clone());
                    }
                    ResponsePayload::Error(e) => {
                        let error = serde_json::to_value(e).unwrap_or(Value::Null);
                        obj.insert("error".to_string(), error);
                    }
                }
            }
        }
        Value::Object(obj)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let Value::Object(obj) = self.to_value() else {
            return serializer.serialize_none();
        };
        let mut map = serializer.serialize_map(Some(obj.len()))?;
        for (k, v) in &obj {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Message::from_value(value).map_err(D::Error::custom)
    }
}

fn check_version(obj: &Map<String, Value>) -> Result<(), DecodeError> {
    let canonical = obj.get(VERSION_FIELD);
    let alias = obj.get(VERSION_FIELD_ALIAS);
    if canonical.is_none() && alias.is_none() {
        return Err(DecodeError::UnsupportedVersion);
    }
    for field in [canonical, alias].into_iter().flatten() {
        if field.as_str() != Some(JSONRPC_VERSION) {
            return Err(DecodeError::UnsupportedVersion);
        }
    }
    Ok(())
}

fn take_params(obj: &mut Map<String, Value>) -> Result<Option<Value>, DecodeError> {
    match obj.remove("params") {
        None | Some(Value::Null) => Ok(None),
        Some(p @ (Value::Object(_) | Value::Array(_))) => Ok(Some(p)),
        Some(_) => Err(DecodeError::InvalidShape("params is not an object or array")),
    }
}

fn id_value(id: Option<&RequestId>) -> Value {
    match id {
        Some(RequestId::Number(n)) => Value::from(*n),
        Some(RequestId::String(s)) => Value::from(s.clone()),
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_is_recognized() {
        let msg = Message::from_value(json!({
            "jsonrpc": "2.0", "id": 7, "method": "tools/list"
        }))
        .unwrap();
        assert_eq!(msg, Message::request(7, "tools/list", None));
    }

    #[test]
    fn test_notification_is_recognized() {
        let msg = Message::from_value(json!({
            "jsonrpc": "2.0", "method": "notifications/initialized", "params": {}
        }))
        .unwrap();
        assert!(msg.is_notification());
        assert_eq!(msg.id(), None);
    }

    #[test]
    fn test_protocol_version_alias_is_accepted() {
        let msg = Message::from_value(json!({
            "protocolVersion": "2.0", "id": "a", "method": "ping"
        }))
        .unwrap();
        assert_eq!(msg.id(), Some(&RequestId::String("a".into())));
    }

    #[test]
    fn test_response_variants() {
        let ok = Message::from_value(json!({"jsonrpc": "2.0", "id": 1, "result": {"x": 1}})).unwrap();
        let Message::Response(ok) = ok else { panic!("expected response") };
        assert_eq!(ok.result(), Some(&json!({"x": 1})));

        let err = Message::from_value(json!({
            "jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "Parse error"}
        }))
        .unwrap();
        let Message::Response(err) = err else { panic!("expected response") };
        assert_eq!(err.id, None);
        assert_eq!(err.error_object().map(|e| e.code), Some(-32700));
    }

    #[test]
    fn test_wrong_version_is_rejected() {
        let err = Message::from_value(json!({"jsonrpc": "1.0", "id": 1, "method": "x"})).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedVersion));
        let err = Message::from_value(json!({"id": 1, "method": "x"})).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedVersion));
    }

    #[test]
    fn test_ambiguous_shapes_are_rejected() {
        let cases = [
            json!([1, 2, 3]),
            json!("2.0"),
            json!({"jsonrpc": "2.0"}),
            json!({"jsonrpc": "2.0", "id": 1}),
            json!({"jsonrpc": "2.0", "id": 1, "result": 1, "error": {"code": 1, "message": "m"}}),
            json!({"jsonrpc": "2.0", "id": 1, "method": "x", "result": {}}),
            json!({"jsonrpc": "2.0", "id": 1.5, "method": "x"}),
            json!({"jsonrpc": "2.0", "id": {}, "method": "x"}),
            json!({"jsonrpc": "2.0", "method": 42}),
            json!({"jsonrpc": "2.0", "method": ""}),
            json!({"jsonrpc": "2.0", "method": "x", "params": "str"}),
            json!({"jsonrpc": "2.0", "id": 1, "error": "boom"}),
        ];
        for case in cases {
            assert!(
                matches!(Message::from_value(case.clone()), Err(DecodeError::InvalidShape(_))),
                "accepted {case}"
            );
        }
    }

    #[test]
    fn test_prototype_keys_are_plain_data() {
        let msg = Message::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"__proto__": {"admin": true}, "constructor": {"prototype": {"x": 1}}}
        }))
        .unwrap();
        let Message::Request(req) = msg else { panic!("expected request") };
        let params = req.params.unwrap();
        assert_eq!(params["__proto__"]["admin"], json!(true));
        assert!(params.get("admin").is_none());
    }

    #[test]
    fn test_serialize_uses_canonical_field() {
        let value = serde_json::to_value(Message::notification("ping", None)).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "method": "ping"}));

        let value = serde_json::to_value(Message::from(Response::error(
            None,
            JsonRpcError::parse_error(),
        )))
        .unwrap();
        assert_eq!(value["id"], Value::Null);
        assert_eq!(value["error"]["code"], json!(-32700));
    }

    #[test]
    fn test_null_params_round_trip_as_absent() {
        use crate::protocol::{decode, encode};

        let notification = Message::notification("notifications/initialized", Some(Value::Null));
        assert_eq!(notification, Message::notification("notifications/initialized", None));
        assert_eq!(decode(&encode(&notification)).unwrap(), notification);

        let request = Message::request(3, "ping", Some(Value::Null));
        assert_eq!(decode(&encode(&request)).unwrap(), request);

        let raw = Message::Notification(Notification {
            method: "x".into(),
            params: Some(Value::Null),
        });
        assert_eq!(raw.to_value(), json!({"jsonrpc": "2.0", "method": "x"}));
        let parsed = decode(br#"{"jsonrpc":"2.0","method":"x","params":null}"#).unwrap();
        assert_eq!(parsed, Message::notification("x", None));
    }

    #[test]
    fn test_deserialize_runs_validation() {
        let parsed: Result<Message, _> = serde_json::from_str(r#"{"jsonrpc":"2.0"}"#);
        assert!(parsed.is_err());
        let parsed: Message = serde_json::from_str(r#"{"jsonrpc":"2.0","id":"x","result":null}"#).unwrap();
        assert!(parsed.is_response());
    }
}
