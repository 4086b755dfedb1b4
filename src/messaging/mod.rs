//! Messaging layer - front end ↔ backend channels
//!
//! This module provides:
//! - Envelope types for requests, replies and notifications
//! - Length-prefixed TCP framing
//! - Request client with timeout and msg_id correlation
//! - Notification listener with topic filters
//! - Session owning both channels
//! - Stub backend for tests and demos

pub mod client;
pub mod codec;
pub mod listener;
pub mod messages;
pub mod session;
pub mod stub;
pub mod transport;

pub use client::{RequestClient, RequestClientConfig};
pub use codec::{ANONYMOUS_USER, MessageCodec};
pub use listener::{NotificationListener, POLL_INTERVAL, TopicFilter};
pub use messages::{
    Actions, Notification, NotificationTypes, Params, Progress, RequestEnvelope, ResponseEnvelope,
    ResponseStatus,
};
pub use session::{AuthSession, ConnectionState, MessagingSession, SessionOptions, TaskSummary, password_digest};
pub use stub::{StubBackend, StubReply};
pub use transport::{Endpoint, FrameCodec};
