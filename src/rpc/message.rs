use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    #[serde(rename = "requestID")]
    pub request_id: String,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// An empty `error` means the call succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "requestID")]
    pub request_id: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub error: String,
}

impl Response {
    pub fn from_result(request_id: String, result: Result<Value, RpcError>) -> Self {
        match result {
            Ok(value) => Response {
                request_id,
                value,
                error: String::new(),
            },
            Err(e) => Response {
                request_id,
                value: Value::Null,
                error: e.to_string(),
            },
        }
    }
}

/// An envelope read off the wire. A call is recognised by its `name` field,
/// so a call with bad fields is still answered as a call.
#[derive(Debug)]
pub enum Inbound {
    Call(Call),
    Response(Response),
    Malformed { request_id: String, error: RpcError },
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        let Some(name) = value.get("name").and_then(Value::as_str).map(str::to_string) else {
            return Ok(Inbound::Response(serde_json::from_value(value)?));
        };

        let request_id = match value.get("requestID") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        match serde_json::from_value::<Call>(value) {
            Ok(call) => Ok(Inbound::Call(call)),
            Err(e) => Ok(Inbound::Malformed {
                request_id,
                error: RpcError::Unprocessable {
                    name,
                    reason: e.to_string(),
                },
            }),
        }
    }
}
