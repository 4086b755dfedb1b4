//! Request client for the lockstep command channel.
//!
//! One send is always followed by exactly one receive before the next send.
//! Callers are serialized behind an async mutex, so a second concurrent
//! caller waits for the first exchange to finish instead of failing.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::error::{ConnectError, RequestError};
use crate::messaging::codec::MessageCodec;
use crate::messaging::messages::{Params, RequestEnvelope, ResponseEnvelope};
use crate::messaging::transport::{Endpoint, FramedStream, connect_stream};

/// Default request timeout (30 s).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default connect timeout (5 s).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Configuration for the request client.
#[derive(Debug, Clone)]
pub struct RequestClientConfig {
    /// Timeout used when a call does not specify one.
    pub request_timeout: Duration,
    /// Timeout for establishing the channel.
    pub connect_timeout: Duration,
}

impl Default for RequestClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Channel state guarded by the request mutex.
#[derive(Default)]
struct Channel {
    /// Set while connected; cleared only by `disconnect`.
    endpoint: Option<Endpoint>,
    /// Live stream; dropped after a broken exchange and reopened lazily.
    stream: Option<FramedStream>,
}

/// Client owning one lockstep request channel.
pub struct RequestClient {
    config: RequestClientConfig,
    codec: RwLock<MessageCodec>,
    channel: Mutex<Channel>,
}

impl RequestClient {
    /// Create a new request client.
    pub fn new(config: RequestClientConfig, codec: MessageCodec) -> Self {
        Self {
            config,
            codec: RwLock::new(codec),
            channel: Mutex::new(Channel::default()),
        }
    }

    /// Create client with default config and anonymous identity.
    pub fn with_default_config() -> Self {
        Self::new(RequestClientConfig::default(), MessageCodec::default())
    }

    /// Get the client configuration.
    pub fn config(&self) -> &RequestClientConfig {
        &self.config
    }

    /// Replace the identity stamped into subsequent requests.
    pub async fn set_user_id(&self, user_id: impl Into<String>) {
        self.codec.write().await.set_user_id(user_id);
    }

    /// Identity stamped into requests.
    pub async fn user_id(&self) -> String {
        self.codec.read().await.user_id().to_string()
    }

    /// Connect to the request endpoint.
    ///
    /// Calling this while connected tears the old channel down first.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<(), ConnectError> {
        let mut channel = self.channel.lock().await;
        if channel.endpoint.take().is_some() {
            log::info!("Request channel reconnecting, closing previous channel");
        }
        channel.stream = None;

        let stream = connect_stream(endpoint, self.config.connect_timeout).await?;
        channel.stream = Some(stream);
        channel.endpoint = Some(endpoint.clone());

        log::info!("Request channel connected: {}", endpoint);
        Ok(())
    }

    /// Close the channel. No-op when already disconnected.
    pub async fn disconnect(&self) {
        let mut channel = self.channel.lock().await;
        channel.stream = None;
        if let Some(endpoint) = channel.endpoint.take() {
            log::info!("Request channel disconnected: {}", endpoint);
        }
    }

    /// Check if connected.
    pub async fn is_connected(&self) -> bool {
        self.channel.lock().await.endpoint.is_some()
    }

    /// Send a request and wait for its reply.
    ///
    /// `timeout` defaults to the configured request timeout. It bounds the
    /// whole exchange once the channel is ours: lazy reopen, send and
    /// receive.
    pub async fn request(
        &self,
        action: &str,
        params: Params,
        timeout: Option<Duration>,
    ) -> Result<ResponseEnvelope, RequestError> {
        let timeout = timeout.unwrap_or(self.config.request_timeout);
        let mut channel = self.channel.lock().await;
        let deadline = Deadline::after(timeout);

        let endpoint = channel.endpoint.clone().ok_or(RequestError::NotConnected)?;
        if channel.stream.is_none() {
            log::debug!("Reopening request channel to {}", endpoint);
            let stream = deadline
                .run(connect_stream(&endpoint, self.config.connect_timeout))
                .await
                .ok_or_else(|| timed_out(action, timeout))?
                .map_err(|e| RequestError::SendFailed(e.to_string()))?;
            channel.stream = Some(stream);
        }
        let Some(stream) = channel.stream.as_mut() else {
            return Err(RequestError::NotConnected);
        };

        let request = self.codec.read().await.build_request(action, params);
        let result = exchange(stream, &request, timeout, deadline).await;

        match &result {
            Ok(response) => log::debug!("Received response for {}: {:?}", action, response.status),
            Err(e) => {
                log::warn!("Request {} failed: {}", action, e);
                if e.resets_channel() {
                    channel.stream = None;
                }
            }
        }
        result
    }

    /// Send a request with no parameters and the default timeout.
    pub async fn request_no_params(&self, action: &str) -> Result<ResponseEnvelope, RequestError> {
        self.request(action, Params::new(), None).await
    }
}

/// Point in time an exchange must finish by; `None` when the timeout is too
/// large to represent.
#[derive(Debug, Clone, Copy)]
struct Deadline(Option<Instant>);

impl Deadline {
    fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// Run `fut` until the deadline. `None` means time ran out.
    async fn run<F: Future>(self, fut: F) -> Option<F::Output> {
        match self.0 {
            Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
            None => Some(fut.await),
        }
    }
}

fn timed_out(action: &str, timeout: Duration) -> RequestError {
    RequestError::Timeout {
        action: action.to_string(),
        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    }
}

/// One send followed by one receive.
async fn exchange(
    stream: &mut FramedStream,
    request: &RequestEnvelope,
    timeout: Duration,
    deadline: Deadline,
) -> Result<ResponseEnvelope, RequestError> {
    let (action, msg_id) = (request.action.as_str(), request.msg_id.as_str());
    let payload = MessageCodec::encode_request(request).map_err(|e| RequestError::SendFailed(e.to_string()))?;

    log::debug!("Sending request: {} ({})", action, msg_id);
    match deadline.run(stream.send(payload)).await {
        Some(Ok(())) => {}
        Some(Err(e)) => return Err(RequestError::SendFailed(e.to_string())),
        None => return Err(timed_out(action, timeout)),
    }

    loop {
        let frame = match deadline.run(stream.next()).await {
            None => return Err(timed_out(action, timeout)),
            Some(None) => return Err(RequestError::ConnectionLost("peer closed the channel".into())),
            Some(Some(Err(e))) => return Err(RequestError::ConnectionLost(e.to_string())),
            Some(Some(Ok(frame))) => frame,
        };

        let response = MessageCodec::parse_response(&frame).map_err(|source| RequestError::MalformedResponse {
            raw: frame.to_vec(),
            source,
        })?;

        match response.msg_id.as_deref() {
            Some(reply_to) if reply_to != msg_id => {
                log::debug!("Discarding stale reply for {} while waiting on {}", reply_to, msg_id);
                continue;
            }
            _ => return Ok(response),
        }
    }
}
