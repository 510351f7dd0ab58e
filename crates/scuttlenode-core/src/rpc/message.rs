//! Request and body types carried in RPC packets

use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::codec::BodyType;
use crate::error::{NodeError, NodeResult};

/// Dotted procedure name, e.g. `ebt.replicate`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcedureName(Vec<String>);

impl ProcedureName {
    pub fn new(parts: &[&str]) -> Self {
        Self(parts.iter().map(|p| p.to_string()).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for ProcedureName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl From<&str> for ProcedureName {
    fn from(dotted: &str) -> Self {
        Self(dotted.split('.').map(str::to_string).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureType {
    Source,
    Sink,
    Duplex,
    Async,
}

impl ProcedureType {
    /// Whether requests of this type open a stream.
    pub fn is_stream(&self) -> bool {
        !matches!(self, ProcedureType::Async)
    }
}

impl fmt::Display for ProcedureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcedureType::Source => "source",
            ProcedureType::Sink => "sink",
            ProcedureType::Duplex => "duplex",
            ProcedureType::Async => "async",
        };
        f.write_str(name)
    }
}

fn default_type() -> ProcedureType {
    ProcedureType::Async
}

/// Body of the packet that opens a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub name: ProcedureName,
    #[serde(rename = "type", default = "default_type")]
    pub typ: ProcedureType,
    #[serde(default)]
    pub args: Value,
}

impl Request {
    pub fn new(name: ProcedureName, typ: ProcedureType, args: Value) -> Self {
        Self { name, typ, args }
    }

    /// First element of `args`, the convention for single-argument calls.
    pub fn first_arg<T: DeserializeOwned>(&self) -> NodeResult<T> {
        let arg = match &self.args {
            Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
            other => other.clone(),
        };
        serde_json::from_value(arg)
            .map_err(|e| NodeError::Validation(format!("bad arguments for {}: {}", self.name, e)))
    }
}

/// Error payload sent when a request fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: "Error".to_string(),
            message: message.into(),
            stack: None,
        }
    }

    /// Error text of the reply to a procedure nobody serves.
    pub fn method_not_supported(name: &ProcedureName) -> Self {
        Self::new(format!("method not supported: {}", name))
    }
}

/// Payload of one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Binary(Bytes),
    Utf8(String),
    /// Raw JSON text
    Json(Bytes),
}

impl Body {
    pub fn json<T: Serialize>(value: &T) -> NodeResult<Self> {
        Ok(Body::Json(Bytes::from(serde_json::to_vec(value)?)))
    }

    pub fn body_type(&self) -> BodyType {
        match self {
            Body::Binary(_) => BodyType::Binary,
            Body::Utf8(_) => BodyType::Utf8,
            Body::Json(_) => BodyType::Json,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Binary(b) | Body::Json(b) => b,
            Body::Utf8(s) => s.as_bytes(),
        }
    }

    pub fn parse_json<T: DeserializeOwned>(&self) -> NodeResult<T> {
        serde_json::from_slice(self.as_bytes())
            .map_err(|e| NodeError::Protocol(format!("unexpected body: {}", e)))
    }

    pub(crate) fn from_packet(body_type: BodyType, body: Bytes) -> NodeResult<Self> {
        Ok(match body_type {
            BodyType::Binary => Body::Binary(body),
            BodyType::Json => Body::Json(body),
            BodyType::Utf8 => Body::Utf8(
                String::from_utf8(body.to_vec())
                    .map_err(|_| NodeError::Protocol("utf8 body is not valid UTF-8".to_string()))?,
            ),
        })
    }

    pub(crate) fn into_bytes(self) -> Bytes {
        match self {
            Body::Binary(b) | Body::Json(b) => b,
            Body::Utf8(s) => Bytes::from(s),
        }
    }
}

/// Turn the body of an end-or-error packet into the stream's outcome.
pub(crate) fn termination(body: &Body) -> NodeError {
    match body {
        Body::Json(bytes) => match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Bool(true)) | Ok(Value::Null) => NodeError::RemoteEnd,
            Ok(value) => {
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                NodeError::Remote(message)
            }
            Err(_) => NodeError::Remote(String::from_utf8_lossy(bytes).into_owned()),
        },
        Body::Utf8(text) => NodeError::Remote(text.clone()),
        Body::Binary(bytes) if bytes.is_empty() => NodeError::RemoteEnd,
        Body::Binary(bytes) => NodeError::Remote(String::from_utf8_lossy(bytes).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_json_shape() {
        let req = Request::new(
            ProcedureName::from("ebt.replicate"),
            ProcedureType::Duplex,
            json!([{"version": 3, "format": "classic"}]),
        );
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({"name": ["ebt", "replicate"], "type": "duplex", "args": [{"version": 3, "format": "classic"}]})
        );
        assert_eq!(req.name.to_string(), "ebt.replicate");
    }

    #[test]
    fn test_request_without_type_is_async() {
        let req: Request = serde_json::from_value(json!({"name": ["whoami"], "args": []})).unwrap();
        assert_eq!(req.typ, ProcedureType::Async);
    }

    #[test]
    fn test_termination_bodies() {
        assert!(termination(&Body::Json(Bytes::from_static(b"true"))).is_remote_end());
        let err = termination(&Body::json(&ErrorBody::method_not_supported(&"ebt.replicate".into())).unwrap());
        assert!(err.is_method_not_supported());
    }

    #[test]
    fn test_first_arg() {
        #[derive(Deserialize)]
        struct Args {
            id: String,
        }
        let req: Request =
            serde_json::from_value(json!({"name": ["x"], "type": "source", "args": [{"id": "a"}]})).unwrap();
        assert_eq!(req.first_arg::<Args>().unwrap().id, "a");
    }
}
