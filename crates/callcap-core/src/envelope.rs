//! Bridge envelopes exchanged with the mini-app script host.
//!
//! Inbound traffic is an [`AppRequest`] addressed to a topic (`event`).
//! Replies go back as an [`AppResponse`]; unsolicited host-to-mini pushes
//! are [`NotifyEvent`]s.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Topic names carried in [`AppRequest::event`].
pub mod topic {
    pub const CALL_APP_EVENT: &str = "callAppEvent";
    pub const COMMON_APP_EVENT: &str = "commonAppEvent";
    pub const SCREEN_APP_EVENT: &str = "screenAppEvent";
    pub const EC_EVENT: &str = "ECEvent";
}

/// Action names carried in [`AppRequest::action`].
pub mod action {
    // ECEvent
    pub const QUERY_EC: &str = "queryEC";
    pub const REGISTER_EC: &str = "registerEC";
    pub const REQUEST_EC: &str = "requestEC";

    // commonAppEvent
    pub const REFRESH_PERMISSION: &str = "refreshPermission";
    pub const STOP_APP: &str = "stopApp";

    // callAppEvent
    pub const GET_CALL_STATE: &str = "getCallState";
    pub const HANG_UP: &str = "hangUp";
    pub const ANSWER: &str = "answer";
    pub const SET_MUTED: &str = "setMuted";

    // screenAppEvent
    pub const START_SCREEN_SHARE: &str = "startScreenShare";
    pub const STOP_SCREEN_SHARE: &str = "stopScreenShare";
    pub const REQUEST_SCREEN_SHARE_ABILITY: &str = "requestScreenShareAbility";
}

/// Action names carried in [`NotifyEvent::action`].
pub mod notify {
    pub const EC_CALLBACK: &str = "ecCallback";
    pub const REFRESH_MINI_PERMISSION: &str = "refreshMiniPermission";
    pub const CALL_STATE_NOTIFY: &str = "callStateNotify";
}

pub const CODE_SUCCESS: i32 = 0;
pub const CODE_FAILED: i32 = -1;
pub const MESSAGE_SUCCESS: &str = "success";
pub const MESSAGE_FAILED: &str = "failed";

/// A request from a mini-app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRequest {
    pub event: String,
    pub action: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl AppRequest {
    pub fn new(event: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            action: action.into(),
            params: Map::new(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Decode a request from its JSON text form.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Envelope(e.to_string()))
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(Value::as_bool)
    }

    /// String entries of an array parameter; non-string elements are skipped.
    pub fn param_str_list(&self, key: &str) -> Vec<String> {
        self.params
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The result wrapper returned for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppResponse {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl AppResponse {
    pub fn success(data: Value) -> Self {
        Self {
            code: CODE_SUCCESS,
            message: MESSAGE_SUCCESS.to_string(),
            data,
        }
    }

    /// Generic failure. Carries no reason.
    pub fn failure() -> Self {
        Self {
            code: CODE_FAILED,
            message: MESSAGE_FAILED.to_string(),
            data: Value::Null,
        }
    }

    /// Map a status code onto the success/failure wrapper, keeping the code.
    pub fn from_status(code: i32) -> Self {
        if code == CODE_FAILED {
            Self::failure()
        } else {
            Self {
                code,
                message: MESSAGE_SUCCESS.to_string(),
                data: Value::Null,
            }
        }
    }

    pub const fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }
}

/// A host-to-mini push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyEvent {
    pub action: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl NotifyEvent {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params: Map::new(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
