//! Wire envelope types: every frame on the control channel is one
//! JSON object, length-prefixed on the socket by [`crate::transport`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request frame sent by the controller.
#[derive(Debug, Deserialize)]
pub struct Request {
    pub command: String,
    pub request_id: String,
    #[serde(default)]
    pub payload: Value,
}

/// A response frame sent back for exactly one request, matched by
/// `request_id`.
#[derive(Debug, Serialize)]
pub struct Response {
    pub request_id: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "success")]
    Ok,
    #[serde(rename = "error")]
    Error,
}

impl Response {
    pub fn ok(request_id: String, data: Value) -> Response {
        Response {
            request_id,
            status: Status::Ok,
            data: Some(data),
            error_message: None,
        }
    }

    pub fn error(request_id: String, message: String) -> Response {
        Response {
            request_id,
            status: Status::Error,
            data: None,
            error_message: Some(message),
        }
    }
}

/// An asynchronous, un-requested frame — currently only
/// `invoke_callback`.
#[derive(Debug, Serialize)]
pub struct Event {
    pub event: String,
    pub payload: Value,
}
