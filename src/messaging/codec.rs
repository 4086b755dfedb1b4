//! Envelope codec.
//!
//! Builds request envelopes and parses reply/notification payloads. Nothing
//! here touches a socket; decoding never panics and reports every problem as
//! a [`DecodeError`].

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::DecodeError;
use crate::id::{generate_msg_id, now_secs};
use crate::messaging::messages::{Notification, Params, RequestEnvelope, ResponseEnvelope};

/// Identity used before the session owner provides a real one.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Builds and parses envelopes for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageCodec {
    user_id: String,
}

impl MessageCodec {
    /// Create a codec stamping `user_id` into every request.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    /// Identity stamped into requests.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Replace the identity stamped into requests.
    pub fn set_user_id(&mut self, user_id: impl Into<String>) {
        self.user_id = user_id.into();
    }

    /// Build a request with a fresh msg_id and the current time.
    pub fn build_request(&self, action: &str, params: Params) -> RequestEnvelope {
        RequestEnvelope {
            msg_id: generate_msg_id(),
            timestamp: now_secs(),
            action: action.to_string(),
            params,
            user_id: self.user_id.clone(),
        }
    }

    /// Serialize a request to a compact JSON frame.
    pub fn encode_request(request: &RequestEnvelope) -> serde_json::Result<Bytes> {
        serde_json::to_vec(request).map(Bytes::from)
    }

    /// Parse a reply payload. Requires a `status` field.
    pub fn parse_response(payload: &[u8]) -> Result<ResponseEnvelope, DecodeError> {
        parse_envelope(payload, "status")
    }

    /// Parse a published payload. Requires a `type` field.
    ///
    /// Frames published under a topic look like `<topic>:<json>`; the topic
    /// is split off and kept on the notification.
    pub fn parse_notification(payload: &[u8]) -> Result<Notification, DecodeError> {
        let (topic, body) = split_topic(payload);
        let mut notification: Notification = parse_envelope(body, "type")?;
        notification.topic = topic;
        Ok(notification)
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(ANONYMOUS_USER)
    }
}

fn parse_envelope<T: DeserializeOwned>(payload: &[u8], required: &'static str) -> Result<T, DecodeError> {
    let value: Value = serde_json::from_slice(payload)?;
    let object = value.as_object().ok_or(DecodeError::NotAnObject)?;
    if !object.contains_key(required) {
        return Err(DecodeError::MissingField(required));
    }
    serde_json::from_value(value).map_err(|e| DecodeError::InvalidEnvelope(e.to_string()))
}

fn split_topic(payload: &[u8]) -> (Option<String>, &[u8]) {
    let start = payload
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(payload.len());
    if payload.get(start) == Some(&b'{') {
        return (None, payload);
    }
    match payload.iter().position(|&b| b == b':') {
        Some(pos) => {
            let topic = String::from_utf8_lossy(&payload[..pos]).into_owned();
            (Some(topic), &payload[pos + 1..])
        }
        None => (None, payload),
    }
}
