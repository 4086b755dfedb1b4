//! In-process stub backend speaking the fundlink wire protocol.
//!
//! Provides:
//! - a reply endpoint answering each request frame through a handler
//! - a publish endpoint broadcasting frames to every subscriber
//!
//! Used by tests and demos; it does no backend processing of its own.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::id::now_secs;
use crate::messaging::transport::{Endpoint, FrameCodec};

/// How the stub answers one request.
#[derive(Debug, Clone)]
pub enum StubReply {
    /// Reply with a JSON value.
    Json(Value),
    /// Reply with raw bytes (for malformed-payload cases).
    Raw(Vec<u8>),
    /// Reply with a JSON value after a delay.
    Delayed(Duration, Value),
    /// Never reply.
    Silent,
}

type Handler = dyn Fn(&Value) -> StubReply + Send + Sync;

/// Stub backend bound to two loopback ports.
pub struct StubBackend {
    req_addr: SocketAddr,
    pub_addr: SocketAddr,
    publish_tx: broadcast::Sender<Bytes>,
    subscriptions: Arc<AtomicUsize>,
    served: Arc<AtomicUsize>,
    subscribers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl StubBackend {
    /// Bind both endpoints on 127.0.0.1 and start serving.
    pub async fn start<F>(handler: F) -> std::io::Result<Self>
    where
        F: Fn(&Value) -> StubReply + Send + Sync + 'static,
    {
        let req_listener = TcpListener::bind("127.0.0.1:0").await?;
        let pub_listener = TcpListener::bind("127.0.0.1:0").await?;
        let req_addr = req_listener.local_addr()?;
        let pub_addr = pub_listener.local_addr()?;

        let (publish_tx, _) = broadcast::channel(256);
        let subscriptions = Arc::new(AtomicUsize::new(0));
        let served = Arc::new(AtomicUsize::new(0));
        let subscribers = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let reply_task = tokio::spawn(serve_replies(req_listener, handler, Arc::clone(&served)));
        let publish_task = tokio::spawn(serve_subscribers(
            pub_listener,
            publish_tx.clone(),
            Arc::clone(&subscriptions),
            Arc::clone(&subscribers),
        ));

        Ok(Self {
            req_addr,
            pub_addr,
            publish_tx,
            subscriptions,
            served,
            subscribers,
            tasks: vec![reply_task, publish_task],
        })
    }

    /// Handler echoing the request back under `data.request`.
    pub fn echo(request: &Value) -> StubReply {
        StubReply::Json(json!({
            "status": "ok",
            "msg_id": request["msg_id"],
            "data": { "request": request },
        }))
    }

    /// Request endpoint.
    pub fn req_endpoint(&self) -> Endpoint {
        Endpoint::new(self.req_addr.ip().to_string(), self.req_addr.port())
    }

    /// Publish endpoint.
    pub fn pub_endpoint(&self) -> Endpoint {
        Endpoint::new(self.pub_addr.ip().to_string(), self.pub_addr.port())
    }

    /// Number of replies produced so far.
    pub fn requests_served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    /// Publish a notification with no topic. Returns receiver count.
    pub fn publish(&self, kind: &str, data: Value) -> usize {
        self.publish_raw(notification_json(kind, data).into_bytes())
    }

    /// Publish a notification as `<topic>:<json>`.
    pub fn publish_on(&self, topic: &str, kind: &str, data: Value) -> usize {
        self.publish_raw(format!("{}:{}", topic, notification_json(kind, data)).into_bytes())
    }

    /// Publish raw bytes as one frame.
    pub fn publish_raw(&self, payload: Vec<u8>) -> usize {
        self.publish_tx.send(Bytes::from(payload)).unwrap_or(0)
    }

    /// Wait until at least `count` subscriber connections have been accepted
    /// in total.
    pub async fn wait_for_subscriptions(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.subscriptions.load(Ordering::SeqCst) < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    /// Close every subscriber connection.
    pub fn drop_subscribers(&self) {
        let handles = match self.subscribers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            handle.abort();
        }
    }
}

impl Drop for StubBackend {
    fn drop(&mut self) {
        self.drop_subscribers();
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn notification_json(kind: &str, data: Value) -> String {
    json!({ "type": kind, "data": data, "timestamp": now_secs() }).to_string()
}

async fn serve_replies(listener: TcpListener, handler: Arc<Handler>, served: Arc<AtomicUsize>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                tokio::spawn(handle_requests(stream, Arc::clone(&handler), Arc::clone(&served)));
            }
            Err(e) => log::warn!("Stub accept error: {}", e),
        }
    }
}

async fn handle_requests(stream: TcpStream, handler: Arc<Handler>, served: Arc<AtomicUsize>) {
    let mut framed = Framed::new(stream, FrameCodec::new());

    while let Some(Ok(frame)) = framed.next().await {
        let reply = match serde_json::from_slice::<Value>(&frame) {
            Ok(request) => (handler.as_ref())(&request),
            Err(e) => StubReply::Json(json!({
                "status": "error",
                "message": format!("Internal server error: {}", e),
                "code": 500,
            })),
        };

        let payload = match reply {
            StubReply::Json(value) => Bytes::from(value.to_string()),
            StubReply::Raw(bytes) => Bytes::from(bytes),
            StubReply::Delayed(delay, value) => {
                tokio::time::sleep(delay).await;
                Bytes::from(value.to_string())
            }
            StubReply::Silent => continue,
        };

        served.fetch_add(1, Ordering::SeqCst);
        if framed.send(payload).await.is_err() {
            break;
        }
    }
}

async fn serve_subscribers(
    listener: TcpListener,
    publish_tx: broadcast::Sender<Bytes>,
    subscriptions: Arc<AtomicUsize>,
    subscribers: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _addr)) => stream,
            Err(e) => {
                log::warn!("Stub accept error: {}", e);
                continue;
            }
        };

        // Receiver exists before the subscription is counted
        let rx = publish_tx.subscribe();
        let handle = tokio::spawn(forward_published(stream, rx));
        if let Ok(mut guard) = subscribers.lock() {
            guard.push(handle);
        }
        subscriptions.fetch_add(1, Ordering::SeqCst);
    }
}

async fn forward_published(stream: TcpStream, mut rx: broadcast::Receiver<Bytes>) {
    let mut framed = Framed::new(stream, FrameCodec::new());
    loop {
        match rx.recv().await {
            Ok(payload) => {
                if framed.send(payload).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
