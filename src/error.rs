//! Error types for fundlink
//!
//! Centralized error handling using thiserror. Transport and protocol
//! failures are values returned to the immediate caller; nothing here is
//! ever raised across the listener task boundary.

use thiserror::Error;

/// Failure to establish either channel of a session.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Endpoint string is not `tcp://<host>:<port>`
    #[error("Invalid endpoint '{0}': expected tcp://<host>:<port>")]
    InvalidEndpoint(String),

    /// Socket-level failure while connecting
    #[error("Failed to connect to {endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Peer did not accept the connection in time
    #[error("Timed out connecting to {0}")]
    Timeout(String),
}

/// Failure of a single request on the lockstep channel.
///
/// Every variant is recoverable: the session stays connected and the caller
/// may retry.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Session (or client) is not in the connected state
    #[error("Not connected to server")]
    NotConnected,

    /// Request could not be written to the channel
    #[error("Failed to send request: {0}")]
    SendFailed(String),

    /// No reply arrived within the per-call timeout
    #[error("Request timeout: {action} (after {timeout_ms} ms)")]
    Timeout { action: String, timeout_ms: u64 },

    /// Reply arrived but could not be decoded
    #[error("Malformed response ({} bytes): {source}", .raw.len())]
    MalformedResponse {
        raw: Vec<u8>,
        #[source]
        source: DecodeError,
    },

    /// Peer closed or broke the channel before replying
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

impl RequestError {
    /// Whether the lockstep channel must be discarded after this error.
    ///
    /// A malformed reply still completes the send/receive pair, so the
    /// channel stays in step. Everything else leaves an exchange half done.
    pub fn resets_channel(&self) -> bool {
        matches!(
            self,
            RequestError::SendFailed(_) | RequestError::Timeout { .. } | RequestError::ConnectionLost(_)
        )
    }

    /// Raw payload of a malformed reply, kept for diagnostics.
    pub fn raw_payload(&self) -> Option<&[u8]> {
        match self {
            RequestError::MalformedResponse { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

/// Payload that is not a well-formed envelope.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not valid JSON at all
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Valid JSON, but not an object
    #[error("Envelope is not a JSON object")]
    NotAnObject,

    /// Required envelope field is absent
    #[error("Envelope is missing required field '{0}'")]
    MissingField(&'static str),

    /// Fields present but with the wrong shape
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),
}

/// All error types surfaced by the crate-level API
#[derive(Debug, Error)]
pub enum FundlinkError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Backend answered with `status: error`
    #[error("Backend error: {0}")]
    Remote(String),

    /// Invalid configuration value
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML config parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for fundlink operations
pub type Result<T> = std::result::Result<T, FundlinkError>;
