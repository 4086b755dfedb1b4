//! Messaging session: owns both channels and their lifecycle.
//!
//! Provides:
//! - `connect`/`disconnect` with rollback on partial failure
//! - request delegation, gated on the connected state
//! - notification relay to a single observer channel
//! - connection-state observation through a watch channel
//! - convenience wrappers for the backend's known actions

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, mpsc, watch};

use crate::config::Config;
use crate::error::{ConnectError, FundlinkError, RequestError, Result};
use crate::messaging::client::{RequestClient, RequestClientConfig};
use crate::messaging::codec::{ANONYMOUS_USER, MessageCodec};
use crate::messaging::listener::{NotificationListener, TopicFilter};
use crate::messaging::messages::{Actions, Notification, Params, ResponseEnvelope};
use crate::messaging::transport::Endpoint;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Options for building a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Identity stamped into requests until `set_identity` is called.
    pub user_id: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Topic prefixes subscribed at connect time. Empty means everything.
    pub topics: Vec<String>,
    /// Capacity of the notification observer channel.
    pub notification_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        let client = RequestClientConfig::default();
        Self {
            user_id: ANONYMOUS_USER.to_string(),
            request_timeout: client.request_timeout,
            connect_timeout: client.connect_timeout,
            topics: Vec::new(),
            notification_capacity: 256,
        }
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            user_id: config
                .session
                .user_id
                .clone()
                .unwrap_or_else(|| ANONYMOUS_USER.to_string()),
            request_timeout: Duration::from_millis(config.backend.request_timeout_ms),
            connect_timeout: Duration::from_millis(config.backend.connect_timeout_ms),
            topics: config.session.topics.clone(),
            notification_capacity: config.session.notification_capacity.max(1),
        }
    }
}

/// Reply data of a successful `auth.login`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthSession {
    pub session_token: String,
    pub username: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub login_time: i64,
}

/// Reply data of a successful `task.create`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub task_name: String,
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Deserialize)]
struct TaskList {
    #[serde(default)]
    tasks: Vec<TaskSummary>,
}

/// Session owning the request client and the notification listener.
pub struct MessagingSession {
    options: SessionOptions,
    client: RequestClient,
    listener: Mutex<Option<NotificationListener>>,
    topics: Mutex<TopicFilter>,
    /// Serializes connect/disconnect.
    lifecycle: Mutex<()>,
    state: watch::Sender<ConnectionState>,
    notification_sender: mpsc::Sender<Notification>,
    notification_receiver: Mutex<mpsc::Receiver<Notification>>,
}

impl MessagingSession {
    /// Create a disconnected session.
    pub fn new(options: SessionOptions) -> Self {
        let (notification_sender, notification_receiver) = mpsc::channel(options.notification_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let client = RequestClient::new(
            RequestClientConfig {
                request_timeout: options.request_timeout,
                connect_timeout: options.connect_timeout,
            },
            MessageCodec::new(options.user_id.clone()),
        );
        let topics = TopicFilter::new(options.topics.iter().cloned());

        Self {
            options,
            client,
            listener: Mutex::new(None),
            topics: Mutex::new(topics),
            lifecycle: Mutex::new(()),
            state,
            notification_sender,
            notification_receiver: Mutex::new(notification_receiver),
        }
    }

    /// Create a session from loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(SessionOptions::from(config))
    }

    /// Create session with default options.
    pub fn with_default_options() -> Self {
        Self::new(SessionOptions::default())
    }

    /// Session options.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Observe connection-state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::info!("Session state: {} -> {}", previous, state);
        }
    }

    /// Connect both channels.
    ///
    /// The request channel comes up first, then the listener. If the
    /// listener fails the request channel is closed again, so the session is
    /// either fully connected or disconnected.
    pub async fn connect(&self, req_endpoint: &str, sub_endpoint: &str) -> std::result::Result<(), ConnectError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() != ConnectionState::Disconnected {
            self.teardown().await;
        }

        log::info!("Connecting to backend...");
        log::info!("REQ endpoint: {}", req_endpoint);
        log::info!("SUB endpoint: {}", sub_endpoint);
        self.set_state(ConnectionState::Connecting);

        let result = self.establish(req_endpoint, sub_endpoint).await;
        match &result {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                log::info!("Session connected");
            }
            Err(e) => {
                log::error!("Connect error: {}", e);
                self.set_state(ConnectionState::Disconnected);
            }
        }
        result
    }

    /// Connect to the endpoints named in configuration.
    pub async fn connect_configured(&self, config: &Config) -> std::result::Result<(), ConnectError> {
        self.connect(&config.backend.req_endpoint(), &config.backend.pub_endpoint())
            .await
    }

    async fn establish(&self, req_endpoint: &str, sub_endpoint: &str) -> std::result::Result<(), ConnectError> {
        let req = Endpoint::parse(req_endpoint)?;
        let sub = Endpoint::parse(sub_endpoint)?;

        self.client.connect(&req).await?;

        // Held until the listener is installed so concurrent topic changes
        // land either in the initial filter or on the running listener.
        let topics = self.topics.lock().await;
        let mut listener = NotificationListener::new(topics.clone());
        if let Err(e) = listener
            .start(&sub, self.options.connect_timeout, self.notification_sender.clone())
            .await
        {
            self.client.disconnect().await;
            return Err(e);
        }

        *self.listener.lock().await = Some(listener);
        Ok(())
    }

    /// Disconnect both channels. Always leaves the session disconnected.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        log::info!("Disconnecting from backend...");
        self.teardown().await;
        log::info!("Session disconnected");
    }

    async fn teardown(&self) {
        let listener = self.listener.lock().await.take();
        if let Some(mut listener) = listener {
            if !listener.stop().await {
                log::warn!("Notification listener was aborted during shutdown");
            }
        }
        self.client.disconnect().await;
        self.set_state(ConnectionState::Disconnected);

        // Observers blocked in recv_notification wake on the state change
        // and release the receiver.
        let mut receiver = self.notification_receiver.lock().await;
        let mut discarded = 0;
        while receiver.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            log::debug!("Discarded {} undelivered notification(s)", discarded);
        }
    }

    /// Send a request with the default timeout.
    pub async fn request(&self, action: &str, params: Params) -> std::result::Result<ResponseEnvelope, RequestError> {
        self.request_with_timeout(action, params, None).await
    }

    /// Send a request with an explicit timeout.
    ///
    /// Fails with `NotConnected` immediately unless the session is connected.
    pub async fn request_with_timeout(
        &self,
        action: &str,
        params: Params,
        timeout: Option<Duration>,
    ) -> std::result::Result<ResponseEnvelope, RequestError> {
        if !self.is_connected() {
            return Err(RequestError::NotConnected);
        }
        self.client.request(action, params, timeout).await
    }

    /// Subscribe to a topic prefix; the empty topic means everything.
    ///
    /// Recorded for future connects and applied to a running listener.
    pub async fn subscribe(&self, topic: &str) -> bool {
        let mut topics = self.topics.lock().await;
        let added = topics.insert(topic);
        if let Some(listener) = self.listener.lock().await.as_ref() {
            listener.subscribe(topic);
        }
        added
    }

    /// Remove a topic subscription.
    pub async fn unsubscribe(&self, topic: &str) -> bool {
        let mut topics = self.topics.lock().await;
        let removed = topics.remove(topic);
        if let Some(listener) = self.listener.lock().await.as_ref() {
            listener.unsubscribe(topic);
        }
        removed
    }

    /// Current topic subscriptions.
    pub async fn topics(&self) -> TopicFilter {
        self.topics.lock().await.clone()
    }

    /// Receive next notification, waiting until one is available.
    ///
    /// Returns `None` once the session is disconnected and nothing is
    /// queued. Notifications still queued at disconnect are discarded, so a
    /// later connect starts from an empty queue.
    pub async fn recv_notification(&self) -> Option<Notification> {
        let mut receiver = self.notification_receiver.lock().await;
        let mut state = self.state.subscribe();
        tokio::select! {
            biased;
            notification = receiver.recv() => notification,
            _ = wait_disconnected(&mut state) => None,
        }
    }

    /// Try to receive a notification without waiting.
    pub async fn try_recv_notification(&self) -> Option<Notification> {
        let mut receiver = self.notification_receiver.lock().await;
        receiver.try_recv().ok()
    }

    /// Set the identity stamped into subsequent requests.
    pub async fn set_identity(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        log::info!("Session identity set to {}", user_id);
        self.client.set_user_id(user_id).await;
    }

    /// Identity stamped into requests.
    pub async fn identity(&self) -> String {
        self.client.user_id().await
    }

    // Convenience methods for known actions

    /// Send ping request.
    pub async fn ping(&self) -> Result<bool> {
        let response = self.request(Actions::PING, Params::new()).await?;
        Ok(response.is_ok())
    }

    /// Create a task.
    pub async fn create_task(&self, task_name: &str) -> Result<TaskSummary> {
        let response = self
            .request(Actions::TASK_CREATE, params(json!({ "task_name": task_name })))
            .await?;
        Ok(expect_ok(response)?.data_as()?)
    }

    /// List tasks.
    pub async fn list_tasks(&self) -> Result<Vec<TaskSummary>> {
        let response = self.request(Actions::TASK_LIST, Params::new()).await?;
        let list: TaskList = expect_ok(response)?.data_as()?;
        Ok(list.tasks)
    }

    /// Log in; on success the session identity becomes the user name.
    ///
    /// The password travels as its SHA-256 hex digest.
    pub async fn login(&self, username: &str, password: &str) -> Result<AuthSession> {
        let response = self
            .request(
                Actions::AUTH_LOGIN,
                params(json!({ "username": username, "password": password_digest(password) })),
            )
            .await?;
        let auth: AuthSession = expect_ok(response)?.data_as()?;
        self.set_identity(auth.username.clone()).await;
        Ok(auth)
    }

    /// Log out a session token; the identity reverts to anonymous.
    pub async fn logout(&self, session_token: &str) -> Result<ResponseEnvelope> {
        let response = self
            .request(Actions::AUTH_LOGOUT, params(json!({ "session_token": session_token })))
            .await?;
        let response = expect_ok(response)?;
        self.set_identity(ANONYMOUS_USER).await;
        Ok(response)
    }

    /// Check that a session token is still valid.
    pub async fn verify_session(&self, session_token: &str) -> Result<ResponseEnvelope> {
        let response = self
            .request(Actions::AUTH_VERIFY, params(json!({ "session_token": session_token })))
            .await?;
        expect_ok(response)
    }
}

/// SHA-256 hex digest sent in place of the password.
pub fn password_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

async fn wait_disconnected(state: &mut watch::Receiver<ConnectionState>) {
    while *state.borrow_and_update() != ConnectionState::Disconnected {
        if state.changed().await.is_err() {
            return;
        }
    }
}

fn params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => Params::new(),
    }
}

fn expect_ok(response: ResponseEnvelope) -> Result<ResponseEnvelope> {
    match response.error_message() {
        Some(message) => Err(FundlinkError::Remote(message)),
        None => Ok(response),
    }
}
