// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol for client-server communication.
//!
//! Every exchange is a JSON object. Requests carry a `requestId` used as the
//! correlation key; responses echo it back in their routing `room` field.
//! The field names are a compatibility contract with the remote service and
//! must not change.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Routing coordinates of a request: which controller/action handles it and,
/// optionally, which index/collection it targets.
///
/// This is the only shape resource helpers need to build; the engine fills
/// in everything else (requestId, volatile, token).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestArgs {
    pub controller: String,
    pub action: String,
    pub index: Option<String>,
    pub collection: Option<String>,
}

impl RequestArgs {
    /// Creates routing args for a controller-level action.
    pub fn new(controller: impl Into<String>, action: impl Into<String>) -> Self {
        RequestArgs {
            controller: controller.into(),
            action: action.into(),
            index: None,
            collection: None,
        }
    }

    /// Creates routing args scoped to an index and collection.
    pub fn scoped(
        controller: impl Into<String>,
        action: impl Into<String>,
        index: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        RequestArgs {
            controller: controller.into(),
            action: action.into(),
            index: Some(index.into()),
            collection: Some(collection.into()),
        }
    }
}

/// One request to the remote service.
///
/// `request_id` is generated once, when the request is first queued or sent,
/// and never changes afterwards: it is the correlation key matching the
/// eventual response. The subscription fields (`scope`, `state`, `users`)
/// are only present on realtime subscribe requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub request_id: String,
    pub controller: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volatile: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<String>,
}

impl Request {
    /// Builds a request from routing args and a body, with a caller-supplied
    /// id. Everything else starts empty and is filled by the engine.
    pub fn new(request_id: impl Into<String>, args: RequestArgs, body: Option<Value>) -> Self {
        Request {
            request_id: request_id.into(),
            controller: args.controller,
            action: args.action,
            index: args.index,
            collection: args.collection,
            body,
            volatile: None,
            jwt: None,
            refresh: None,
            scope: None,
            state: None,
            users: None,
        }
    }

    /// Merges default volatile metadata under the request's own: keys
    /// already present on the request win.
    pub fn merge_volatile(&mut self, defaults: &Map<String, Value>) {
        let volatile = self
            .volatile
            .get_or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(own) = volatile {
            for (key, value) in defaults {
                if !own.contains_key(key) {
                    own.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Sets one volatile entry, overwriting any previous value.
    pub fn set_volatile(&mut self, key: impl Into<String>, value: Value) {
        let volatile = self
            .volatile
            .get_or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(own) = volatile {
            own.insert(key.into(), value);
        }
    }

    /// Serializes the request to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes a request from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Error payload carried by a failed response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseError {
    pub message: String,
    #[serde(default)]
    pub status: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// One response from the remote service, matched to its request by
/// `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub status: Option<i64>,
    #[serde(default)]
    pub error: Option<ResponseError>,
    #[serde(default)]
    pub result: Value,
}

impl Response {
    /// Deserializes a response from an arbitrary JSON payload.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Reads `result.roomId` and `result.channel` from a subscribe
    /// response, when both are present.
    pub fn subscription(&self) -> Option<(String, String)> {
        let room_id = self.result.get("roomId")?.as_str()?.to_string();
        let channel = self.result.get("channel")?.as_str()?.to_string();
        Some((room_id, channel))
    }
}

/// A realtime notification delivered on a subscription channel.
///
/// `from_self` is computed locally by the engine: it is true when the
/// notification is an echo of a request this very instance issued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub volatile: Option<Value>,
    #[serde(default)]
    pub from_self: bool,
}

impl Notification {
    /// Deserializes a notification from an arbitrary JSON payload.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
