//! Notification listener for the publish channel.
//!
//! Runs its receive loop on a dedicated task. The loop waits on the socket
//! with a short poll timeout so it can observe the cooperative stop flag
//! between frames; a poll timeout is a normal, silent event. Malformed
//! frames are logged and dropped, the stream keeps going.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::ConnectError;
use crate::messaging::codec::MessageCodec;
use crate::messaging::messages::Notification;
use crate::messaging::transport::{Endpoint, FramedStream, connect_stream};

/// Receive poll interval; bounds how long `stop` waits for the loop.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Number of poll intervals `stop` waits before aborting the task.
const STOP_GRACE_POLLS: u32 = 3;

/// Initial delay before reconnecting a dropped publish channel.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Set of topic prefixes a subscriber accepts.
///
/// Matching follows publish/subscribe semantics: a frame is accepted when
/// its raw bytes start with any subscribed topic. An empty set, or the empty
/// topic, accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicFilter {
    topics: BTreeSet<String>,
}

impl TopicFilter {
    /// Create a filter from topic prefixes.
    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }

    /// Add a topic. Returns false if it was already present.
    pub fn insert(&mut self, topic: impl Into<String>) -> bool {
        self.topics.insert(topic.into())
    }

    /// Remove a topic. Returns false if it was not present.
    pub fn remove(&mut self, topic: &str) -> bool {
        self.topics.remove(topic)
    }

    /// Check whether a raw frame passes the filter.
    pub fn matches(&self, payload: &[u8]) -> bool {
        self.topics.is_empty() || self.topics.iter().any(|t| payload.starts_with(t.as_bytes()))
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Iterate over subscribed topics in order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(String::as_str)
    }
}

/// Listener owning the subscribe side of the publish channel.
pub struct NotificationListener {
    topics: watch::Sender<TopicFilter>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl NotificationListener {
    /// Create a stopped listener with initial topic filters.
    pub fn new(topics: TopicFilter) -> Self {
        let (topics, _) = watch::channel(topics);
        Self {
            topics,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Add a topic filter. Applies immediately to a running loop.
    ///
    /// Returns false if the topic was already subscribed.
    pub fn subscribe(&self, topic: &str) -> bool {
        let added = self.topics.send_if_modified(|filter| filter.insert(topic));
        if added {
            log::info!("Subscribed to topic: {}", display_topic(topic));
        }
        added
    }

    /// Remove a topic filter. Applies immediately to a running loop.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        let removed = self.topics.send_if_modified(|filter| filter.remove(topic));
        if removed {
            log::info!("Unsubscribed from topic: {}", display_topic(topic));
        }
        removed
    }

    /// Current topic filters.
    pub fn topics(&self) -> TopicFilter {
        self.topics.borrow().clone()
    }

    /// Check if the receive loop is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Open the subscribe channel and start the receive loop.
    ///
    /// The channel is opened before the loop is spawned, so connection
    /// failures are reported here. Starting a running listener restarts it.
    pub async fn start(
        &mut self,
        endpoint: &Endpoint,
        connect_timeout: Duration,
        sink: mpsc::Sender<Notification>,
    ) -> Result<(), ConnectError> {
        if self.handle.is_some() {
            self.stop().await;
        }

        let stream = connect_stream(endpoint, connect_timeout).await?;

        self.stop = Arc::new(AtomicBool::new(false));
        let receiver = ReceiveLoop {
            endpoint: endpoint.clone(),
            connect_timeout,
            topics: self.topics.subscribe(),
            stop: Arc::clone(&self.stop),
            sink,
        };
        self.handle = Some(tokio::spawn(receiver.run(stream)));

        log::info!("Notification listener started: {}", endpoint);
        Ok(())
    }

    /// Signal the loop to stop and wait for it to finish.
    ///
    /// Waits up to three poll intervals, then aborts the task. Returns true
    /// if the loop exited on its own. Safe to call when not running.
    pub async fn stop(&mut self) -> bool {
        self.stop.store(true, Ordering::SeqCst);
        let Some(mut handle) = self.handle.take() else {
            return true;
        };

        match tokio::time::timeout(POLL_INTERVAL * STOP_GRACE_POLLS, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::error!("Notification listener task failed: {}", e);
                false
            }
            Err(_) => {
                log::warn!("Notification listener did not stop in time, aborting");
                handle.abort();
                false
            }
        }
    }
}

impl Drop for NotificationListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// State moved onto the listener task.
struct ReceiveLoop {
    endpoint: Endpoint,
    connect_timeout: Duration,
    topics: watch::Receiver<TopicFilter>,
    stop: Arc<AtomicBool>,
    sink: mpsc::Sender<Notification>,
}

impl ReceiveLoop {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    async fn run(self, stream: FramedStream) {
        let mut stream = Some(stream);

        while !self.stopped() {
            if stream.is_none() {
                stream = self.reconnect().await;
                continue;
            }
            let Some(current) = stream.as_mut() else {
                continue;
            };

            let frame = match tokio::time::timeout(POLL_INTERVAL, current.next()).await {
                Err(_) => continue,
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => {
                    log::warn!("Receive error on {}: {}", self.endpoint, e);
                    stream = None;
                    continue;
                }
                Ok(None) => {
                    log::warn!("Publisher closed channel {}", self.endpoint);
                    stream = None;
                    continue;
                }
            };

            if !self.topics.borrow().matches(&frame) {
                continue;
            }

            match MessageCodec::parse_notification(&frame) {
                Ok(notification) => {
                    log::debug!("Received notification: {}", notification.kind);
                    if !self.forward(notification).await {
                        break;
                    }
                }
                Err(e) => {
                    log::error!("Failed to parse notification message: {}", e);
                }
            }
        }

        log::info!("Notification listener stopped: {}", self.endpoint);
    }

    /// Hand a notification to the observer, waiting for capacity in poll
    /// slices. Returns false once the loop should exit.
    async fn forward(&self, notification: Notification) -> bool {
        while !self.stopped() {
            match tokio::time::timeout(POLL_INTERVAL, self.sink.reserve()).await {
                Ok(Ok(permit)) => {
                    permit.send(notification);
                    return true;
                }
                Ok(Err(_)) => {
                    log::debug!("Notification observer dropped, stopping listener");
                    return false;
                }
                Err(_) => log::warn!("Notification observer is not keeping up"),
            }
        }
        false
    }

    /// Reopen the channel with exponential backoff until it succeeds or the
    /// loop is stopped.
    async fn reconnect(&self) -> Option<FramedStream> {
        let mut backoff = RECONNECT_BACKOFF;
        while !self.stopped() {
            tokio::time::sleep(backoff).await;
            if self.stopped() {
                break;
            }
            match connect_stream(&self.endpoint, self.connect_timeout.min(POLL_INTERVAL)).await {
                Ok(stream) => {
                    log::info!("Notification listener reconnected: {}", self.endpoint);
                    return Some(stream);
                }
                Err(e) => log::debug!("Reconnect failed (will retry): {}", e),
            }
            backoff = (backoff * 2).min(POLL_INTERVAL);
        }
        None
    }
}

fn display_topic(topic: &str) -> &str {
    if topic.is_empty() { "ALL" } else { topic }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::stub::StubBackend;
    use serde_json::json;
    use tokio::time::Instant;

    async fn running_listener(backend: &StubBackend, topics: TopicFilter) -> (NotificationListener, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(16);
        let mut listener = NotificationListener::new(topics);
        listener
            .start(&backend.pub_endpoint(), Duration::from_secs(2), tx)
            .await
            .unwrap();
        assert!(backend.wait_for_subscriptions(1, Duration::from_secs(2)).await);
        (listener, rx)
    }

    async fn next(rx: &mut mpsc::Receiver<Notification>) -> Notification {
        tokio::time::timeout(POLL_INTERVAL, rx.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn test_topic_filter_matching() {
        let empty = TopicFilter::default();
        assert!(empty.matches(b"anything"));

        let filter = TopicFilter::new(["tasks", "progress"]);
        assert!(filter.matches(b"tasks:{}"));
        assert!(filter.matches(b"progress:{}"));
        assert!(!filter.matches(b"{\"type\":\"tasks\"}"));
        assert!(!filter.matches(b"auth:{}"));

        let all = TopicFilter::new([""]);
        assert!(all.matches(b"auth:{}"));
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let listener = NotificationListener::new(TopicFilter::default());
        assert!(listener.subscribe("tasks"));
        assert!(!listener.subscribe("tasks"));
        assert_eq!(listener.topics().len(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let listener = NotificationListener::new(TopicFilter::new(["tasks", "auth"]));
        assert!(listener.unsubscribe("auth"));
        assert!(!listener.unsubscribe("auth"));
        assert_eq!(listener.topics().iter().collect::<Vec<_>>(), vec!["tasks"]);
    }

    #[tokio::test]
    async fn test_stop_when_never_started() {
        let mut listener = NotificationListener::new(TopicFilter::default());
        assert!(!listener.is_running());
        assert!(listener.stop().await);
    }

    #[tokio::test]
    async fn test_start_refused() {
        let socket = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        drop(socket);

        let (tx, _rx) = mpsc::channel(1);
        let mut listener = NotificationListener::new(TopicFilter::default());
        let result = listener
            .start(&Endpoint::new("127.0.0.1", port), Duration::from_secs(2), tx)
            .await;
        assert!(result.is_err());
        assert!(!listener.is_running());
    }

    #[tokio::test]
    async fn test_receives_published_notification() {
        let backend = StubBackend::start(StubBackend::echo).await.unwrap();
        let (mut listener, mut rx) = running_listener(&backend, TopicFilter::default()).await;

        backend.publish("progress", json!({"current": 3, "total": 10, "message": "scanning"}));
        let n = next(&mut rx).await;
        assert_eq!(n.kind, "progress");
        assert_eq!(n.progress().unwrap().current, 3);

        assert!(listener.stop().await);
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_stop_stream() {
        let backend = StubBackend::start(StubBackend::echo).await.unwrap();
        let (mut listener, mut rx) = running_listener(&backend, TopicFilter::default()).await;

        backend.publish_raw(b"{broken".to_vec());
        backend.publish("test", json!({"message": "after"}));

        let n = next(&mut rx).await;
        assert_eq!(n.kind, "test");
        assert_eq!(n.data["message"], "after");
        assert!(rx.try_recv().is_err());
        assert!(listener.is_running());

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_delivery_order() {
        let backend = StubBackend::start(StubBackend::echo).await.unwrap();
        let (mut listener, mut rx) = running_listener(&backend, TopicFilter::default()).await;

        for i in 0..20 {
            backend.publish("progress", json!({"current": i, "total": 20}));
        }
        for i in 0..20u64 {
            assert_eq!(next(&mut rx).await.progress().unwrap().current, i);
        }

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_topic_filter_applied_and_updated_live() {
        let backend = StubBackend::start(StubBackend::echo).await.unwrap();
        let (mut listener, mut rx) = running_listener(&backend, TopicFilter::new(["tasks"])).await;

        backend.publish_on("auth", "test", json!({"n": 1}));
        backend.publish_on("tasks", "test", json!({"n": 2}));
        let n = next(&mut rx).await;
        assert_eq!(n.topic.as_deref(), Some("tasks"));
        assert_eq!(n.data["n"], 2);

        listener.subscribe("auth");
        backend.publish_on("auth", "test", json!({"n": 3}));
        assert_eq!(next(&mut rx).await.data["n"], 3);

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_stop_joins_within_bound() {
        let backend = StubBackend::start(StubBackend::echo).await.unwrap();
        let (mut listener, _rx) = running_listener(&backend, TopicFilter::default()).await;

        let started = Instant::now();
        assert!(listener.stop().await);
        assert!(started.elapsed() <= POLL_INTERVAL * STOP_GRACE_POLLS);
        assert!(!listener.is_running());
    }

    #[tokio::test]
    async fn test_reconnects_after_publisher_drops() {
        let backend = StubBackend::start(StubBackend::echo).await.unwrap();
        let (mut listener, mut rx) = running_listener(&backend, TopicFilter::default()).await;

        backend.drop_subscribers();
        assert!(backend.wait_for_subscriptions(2, Duration::from_secs(5)).await);
        backend.publish("test", json!({"message": "back"}));
        assert_eq!(next(&mut rx).await.data["message"], "back");

        listener.stop().await;
    }
}
