//! Envelope types for front end ↔ backend messaging.
//!
//! Uses one UTF-8 JSON object per frame. Requests carry `msg_id`,
//! `timestamp`, `action`, `params` and `user_id`; replies carry a `status`
//! plus `message`/`data`; published notifications carry `type` and `data`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Key-value payload carried by every envelope.
pub type Params = Map<String, Value>;

/// Request sent from the front end to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique message ID (UUID, no braces).
    pub msg_id: String,
    /// Seconds since Unix epoch at build time.
    pub timestamp: i64,
    /// Dot-namespaced action name (e.g., "task.create").
    pub action: String,
    /// Action parameters.
    #[serde(default)]
    pub params: Params,
    /// Identity of the user issuing the request.
    pub user_id: String,
}

/// Reply status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// Request handled. The backend also spells this "success".
    #[serde(alias = "success")]
    Ok,
    /// Request rejected or failed on the backend.
    Error,
}

/// Reply sent from the backend for exactly one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: ResponseStatus,
    /// Human-readable message, present on error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Action-specific result.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub data: Params,
    /// Echo of the request's msg_id, when the backend provides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// HTTP-like status code, when the backend provides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl ResponseEnvelope {
    /// Create a success reply.
    pub fn ok(data: Params) -> Self {
        Self {
            status: ResponseStatus::Ok,
            message: None,
            data,
            msg_id: None,
            timestamp: None,
            code: None,
        }
    }

    /// Create an error reply.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: Some(message.into()),
            data: Params::new(),
            msg_id: None,
            timestamp: None,
            code: None,
        }
    }

    /// Attach the id of the request this reply answers.
    pub fn with_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.msg_id = Some(msg_id.into());
        self
    }

    /// Check if this reply indicates success.
    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Error message, falling back to a generic one when the backend sent none.
    pub fn error_message(&self) -> Option<String> {
        match self.status {
            ResponseStatus::Ok => None,
            ResponseStatus::Error => Some(
                self.message
                    .clone()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "Unknown backend error".to_string()),
            ),
        }
    }

    /// Deserialize `data` into an action-specific type.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(Value::Object(self.data.clone()))
    }
}

/// Notification published by the backend (no request ID).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Topic prefix the frame was published under, if any.
    #[serde(skip)]
    pub topic: Option<String>,
    /// Notification type (e.g., "progress").
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub data: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Notification {
    /// Create a new notification.
    pub fn new(kind: impl Into<String>, data: Params) -> Self {
        Self {
            topic: None,
            kind: kind.into(),
            data,
            timestamp: None,
        }
    }

    /// Typed view of a `progress` notification.
    pub fn progress(&self) -> Option<Progress> {
        if self.kind != NotificationTypes::PROGRESS {
            return None;
        }
        serde_json::from_value(Value::Object(self.data.clone())).ok()
    }
}

/// Payload of a `progress` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
    #[serde(default)]
    pub message: String,
}

impl Progress {
    /// Completed fraction in `[0.0, 1.0]`; zero when `total` is zero.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.current as f64 / self.total as f64).clamp(0.0, 1.0)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Params, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Params>::deserialize(deserializer)?.unwrap_or_default())
}

/// Known action names as constants.
pub struct Actions;

impl Actions {
    pub const PING: &'static str = "test.ping";

    // Tasks
    pub const TASK_CREATE: &'static str = "task.create";
    pub const TASK_LIST: &'static str = "task.list";

    // Auth
    pub const AUTH_LOGIN: &'static str = "auth.login";
    pub const AUTH_LOGOUT: &'static str = "auth.logout";
    pub const AUTH_VERIFY: &'static str = "auth.verify";
}

/// Known notification types as constants.
pub struct NotificationTypes;

impl NotificationTypes {
    pub const PROGRESS: &'static str = "progress";
    pub const TEST: &'static str = "test";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_request_serialize_field_set() {
        let req = RequestEnvelope {
            msg_id: "abc".into(),
            timestamp: 1_700_000_000,
            action: "task.create".into(),
            params: params(json!({"task_name": "Q3"})),
            user_id: "admin".into(),
        };
        let value = serde_json::to_value(&req).unwrap();
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 5);
        assert_eq!(value["msg_id"], "abc");
        assert_eq!(value["timestamp"], 1_700_000_000);
        assert_eq!(value["action"], "task.create");
        assert_eq!(value["params"]["task_name"], "Q3");
        assert_eq!(value["user_id"], "admin");
    }

    #[test]
    fn test_response_ok() {
        let resp = ResponseEnvelope::ok(params(json!({"pong": true})));
        assert!(resp.is_ok());
        assert!(resp.error_message().is_none());
        assert_eq!(resp.data["pong"], true);
    }

    #[test]
    fn test_response_error_message() {
        let resp = ResponseEnvelope::error("Unknown action: x");
        assert!(!resp.is_ok());
        assert_eq!(resp.error_message().as_deref(), Some("Unknown action: x"));

        let mut blank = ResponseEnvelope::error("");
        blank.message = Some(String::new());
        assert_eq!(blank.error_message().as_deref(), Some("Unknown backend error"));
    }

    #[test]
    fn test_status_accepts_success_alias() {
        let resp: ResponseEnvelope =
            serde_json::from_str(r#"{"status":"success","data":{"message":"pong"}}"#).unwrap();
        assert_eq!(resp.status, ResponseStatus::Ok);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""status":"ok""#));
    }

    #[test]
    fn test_response_null_data_is_empty() {
        let resp: ResponseEnvelope =
            serde_json::from_str(r#"{"status":"error","message":"boom","data":null}"#).unwrap();
        assert!(resp.data.is_empty());
    }

    #[test]
    fn test_response_ignores_unknown_fields() {
        let resp: ResponseEnvelope = serde_json::from_str(
            r#"{"msg_id":"m1","timestamp":5,"status":"success","code":200,"data":{},"message":"","error":null}"#,
        )
        .unwrap();
        assert_eq!(resp.msg_id.as_deref(), Some("m1"));
        assert_eq!(resp.code, Some(200));
        assert_eq!(resp.timestamp, Some(5));
    }

    #[test]
    fn test_data_as() {
        #[derive(Deserialize)]
        struct Created {
            task_id: String,
        }
        let resp = ResponseEnvelope::ok(params(json!({"task_id": "task_1", "task_name": "x"})));
        let created: Created = resp.data_as().unwrap();
        assert_eq!(created.task_id, "task_1");
    }

    #[test]
    fn test_notification_progress() {
        let n = Notification::new(
            "progress",
            params(json!({"current": 3, "total": 10, "message": "scanning"})),
        );
        let progress = n.progress().unwrap();
        assert_eq!(progress.current, 3);
        assert_eq!(progress.total, 10);
        assert_eq!(progress.message, "scanning");
        assert!((progress.ratio() - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn test_notification_progress_wrong_type() {
        let n = Notification::new("test", params(json!({"current": 1, "total": 2})));
        assert!(n.progress().is_none());
    }

    #[test]
    fn test_progress_ratio_zero_total() {
        let p = Progress {
            current: 5,
            total: 0,
            message: String::new(),
        };
        assert_eq!(p.ratio(), 0.0);
    }

    #[test]
    fn test_notification_type_field_name() {
        let n = Notification::new("progress", Params::new());
        let json = serde_json::to_string(&n).unwrap();
        assert!(json.contains(r#""type":"progress""#));
        assert!(!json.contains("topic"));
    }

    #[test]
    fn test_actions_constants() {
        assert_eq!(Actions::PING, "test.ping");
        assert_eq!(Actions::TASK_CREATE, "task.create");
        assert_eq!(Actions::AUTH_VERIFY, "auth.verify");
        assert_eq!(NotificationTypes::PROGRESS, "progress");
    }
}
