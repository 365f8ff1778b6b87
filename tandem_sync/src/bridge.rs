//! A request/reply bus between actors
//!
//! A sender publishes each request on the bridge channel as a
//! [`BridgeMessage`] and listens for [`BridgeReply`] messages on a channel
//! named by the request's id. While a receiver works on a request, it
//! publishes [`BridgeReply::Pending`] heartbeats on that reply channel so the
//! sender's timeout measures silence rather than total duration.
//!
//! ```
//! use serde_json::json;
//! use tandem_sync::{
//!     bridge::{HandlerError, IncomingRequest},
//!     BridgeConfig, LocalNamespace, TaskBridge,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let namespace = LocalNamespace::new();
//! let host = TaskBridge::new("broker", namespace.actor("https://host.example"), BridgeConfig::default());
//! let tab = TaskBridge::new("broker", namespace.actor("https://tab.example"), BridgeConfig::default());
//!
//! host.subscribe(|request: IncomingRequest, _signal: CancellationToken| async move {
//!     Ok::<_, HandlerError>(json!({ "echo": request.data }))
//! });
//!
//! let reply = tab.send("ECHO", json!("hello")).await.unwrap();
//! assert_eq!(reply, json!({ "echo": "hello" }));
//! # }
//! ```

use std::{
    collections::HashMap,
    error, fmt,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    time::Duration,
};

use aliri_braid::braid;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::oneshot,
    task::{AbortHandle as TaskAbortHandle, JoinHandle},
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    channel::{Channel, Subscription},
    lock,
};

/// The event name used by [`TaskBridge::send_request()`]
pub const REQUEST_EVENT: &str = "REQUEST";

/// The event name a sender publishes to withdraw a request
pub const CANCEL_EVENT: &str = "CANCEL";

/// The opaque identifier of one request, also naming its reply channel
#[braid(serde)]
pub struct RequestId;

impl RequestId {
    /// Generates a fresh, random request identifier
    pub fn generate() -> Self {
        Self::new(format!("{:032x}", rand::random::<u128>()))
    }
}

/// A request as published on the bridge channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeMessage {
    /// Correlates replies with this request
    pub request_id: RequestId,
    /// What the sender is asking for
    pub event_name: String,
    /// The request payload
    #[serde(default)]
    pub data: Value,
}

/// A message published on a request's reply channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "UPPERCASE")]
pub enum BridgeReply {
    /// The receiver is still working on the request
    Pending,
    /// The request completed
    Done {
        /// The reply payload
        #[serde(default)]
        data: Value,
    },
    /// The request failed
    Error {
        /// A description of the failure
        error: String,
    },
}

/// A request delivered to a receiver's handler
#[derive(Clone, Debug)]
pub struct IncomingRequest {
    /// The request's identifier
    pub request_id: RequestId,
    /// What the sender is asking for
    pub event_name: String,
    /// The request payload
    pub data: Value,
}

/// The error type a [`RequestHandler`] may fail with
pub type HandlerError = Box<dyn error::Error + Send + Sync + 'static>;

/// Handles requests arriving on a bridge
///
/// The returned value becomes the `DONE` reply; an error becomes an `ERROR`
/// reply carrying its message. `signal` fires if the sender aborts the
/// request or the bridge closes. Handlers are not required to stop
/// immediately, but should stop doing work that no one will use.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handles one request
    async fn handle(
        &self,
        request: IncomingRequest,
        signal: CancellationToken,
    ) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(IncomingRequest, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(
        &self,
        request: IncomingRequest,
        signal: CancellationToken,
    ) -> Result<Value, HandlerError> {
        self(request, signal).await
    }
}

/// An error while waiting on a bridge request
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Neither a reply nor a heartbeat arrived in time
    #[error("no response within {after:?}")]
    Timeout {
        /// The silence that was tolerated
        after: Duration,
    },
    /// The request was aborted by its sender
    #[error("request aborted")]
    Aborted,
    /// The bridge was closed while the request was pending
    #[error("bridge closed")]
    Closed,
    /// The receiver replied with an error
    #[error("receiver failed: {message}")]
    Remote {
        /// The receiver's error message
        message: String,
    },
}

/// An invalid bridge configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("heartbeat interval {heartbeat_interval:?} must be shorter than the timeout {timeout:?}")]
pub struct BridgeConfigError {
    heartbeat_interval: Duration,
    timeout: Duration,
}

/// Timing configuration for a [`TaskBridge`]
#[derive(Clone, Copy, Debug)]
pub struct BridgeConfig {
    default_timeout: Duration,
    heartbeat_interval: Duration,
}

impl Default for BridgeConfig {
    /// Default bridge configuration
    ///
    /// Requests time out after 10 seconds of silence; receivers send a
    /// heartbeat every 2 seconds.
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(2),
        }
    }
}

impl BridgeConfig {
    /// Constructs a new bridge configuration
    ///
    /// Heartbeats are the only thing keeping slow requests alive, so the
    /// heartbeat interval must be strictly shorter than the timeout.
    pub fn new(
        default_timeout: Duration,
        heartbeat_interval: Duration,
    ) -> Result<Self, BridgeConfigError> {
        if heartbeat_interval >= default_timeout {
            return Err(BridgeConfigError {
                heartbeat_interval,
                timeout: default_timeout,
            });
        }

        Ok(Self {
            default_timeout,
            heartbeat_interval,
        })
    }

    /// The timeout applied by [`TaskBridge::send()`]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// The interval between heartbeats for in-progress requests
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }
}

struct Outgoing {
    settle: oneshot::Sender<Result<Value, BridgeError>>,
    cancel: CancellationToken,
}

struct Incoming {
    signal: CancellationToken,
    task: Option<TaskAbortHandle>,
}

struct Inner {
    name: String,
    channel: Arc<dyn Channel>,
    config: BridgeConfig,
    outgoing: Mutex<HashMap<RequestId, Outgoing>>,
    incoming: Mutex<HashMap<RequestId, Incoming>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// A request/reply bus over a [`Channel`]
///
/// One bridge can both send requests and, once [`subscribe()`][Self::subscribe]d,
/// answer them. Requests it sent itself are never delivered to its own handler.
/// Dropping the bridge closes it.
pub struct TaskBridge {
    inner: Arc<Inner>,
}

impl fmt::Debug for TaskBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskBridge")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("pending_outgoing", &self.pending_outgoing())
            .field("pending_incoming", &self.pending_incoming())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl TaskBridge {
    /// Opens a bridge on the channel named `name`
    pub fn new(name: impl Into<String>, channel: impl Channel + 'static, config: BridgeConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                channel: Arc::new(channel),
                config,
                outgoing: Mutex::new(HashMap::new()),
                incoming: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The name of the bridge channel
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The bridge's timing configuration
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Whether the bridge has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The number of sent requests still awaiting a reply
    pub fn pending_outgoing(&self) -> usize {
        lock(&self.inner.outgoing).len()
    }

    /// The number of received requests still being handled
    pub fn pending_incoming(&self) -> usize {
        lock(&self.inner.incoming).len()
    }

    /// Sends a generic `REQUEST` with the default timeout
    pub fn send_request(&self, data: Value) -> SentRequest {
        self.send(REQUEST_EVENT, data)
    }

    /// Sends a request with the default timeout
    pub fn send(&self, event_name: impl Into<String>, data: Value) -> SentRequest {
        self.send_with_timeout(event_name, data, self.inner.config.default_timeout)
    }

    /// Sends a request that fails after `timeout` without any reply or heartbeat
    ///
    /// Must be called from within a Tokio runtime.
    pub fn send_with_timeout(
        &self,
        event_name: impl Into<String>,
        data: Value,
        timeout: Duration,
    ) -> SentRequest {
        let request_id = RequestId::generate();
        let event_name = event_name.into();
        let (settle, rx) = oneshot::channel();
        let handle = AbortHandle {
            inner: self.inner.clone(),
            request_id: request_id.clone(),
        };

        if self.is_closed() {
            let _ = settle.send(Err(BridgeError::Closed));
            return SentRequest { rx, handle };
        }

        let cancel = CancellationToken::new();
        lock(&self.inner.outgoing).insert(
            request_id.clone(),
            Outgoing {
                settle,
                cancel: cancel.clone(),
            },
        );

        let replies = self.inner.channel.subscribe(request_id.as_str());
        let message = BridgeMessage {
            request_id: request_id.clone(),
            event_name,
            data,
        };
        tracing::trace!(
            bridge = %self.inner.name,
            request_id = %request_id,
            event = %message.event_name,
            "sending request"
        );
        self.inner.publish_message(&message);

        tokio::spawn(await_reply(
            self.inner.clone(),
            request_id,
            replies,
            cancel,
            timeout,
        ));

        SentRequest { rx, handle }
    }

    /// Starts answering requests with `handler`
    ///
    /// Replaces any previously subscribed handler. Must be called from within
    /// a Tokio runtime.
    pub fn subscribe<H>(&self, handler: H)
    where
        H: RequestHandler + 'static,
    {
        if self.is_closed() {
            tracing::warn!(bridge = %self.inner.name, "ignoring subscribe on closed bridge");
            return;
        }

        let requests = self.inner.channel.subscribe(&self.inner.name);
        let task = tokio::spawn(listen(self.inner.clone(), requests, Arc::new(handler)));
        if let Some(previous) = lock(&self.inner.listener).replace(task) {
            previous.abort();
        }
    }

    /// Closes the bridge
    ///
    /// Every pending sent request fails with [`BridgeError::Closed`] and its
    /// receiver is told to cancel; every request being handled has its
    /// cancellation signal fired and its heartbeats stopped. Afterwards both
    /// pending counts are zero.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for TaskBridge {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl Inner {
    fn publish_message(&self, message: &BridgeMessage) {
        match serde_json::to_value(message) {
            Ok(value) => self.channel.publish(&self.name, value),
            Err(error) => tracing::warn!(bridge = %self.name, %error, "unable to encode request"),
        }
    }

    fn publish_reply(&self, request_id: &RequestIdRef, reply: &BridgeReply) {
        match serde_json::to_value(reply) {
            Ok(value) => self.channel.publish(request_id.as_str(), value),
            Err(error) => tracing::warn!(bridge = %self.name, %request_id, %error, "unable to encode reply"),
        }
    }

    fn settle(&self, request_id: &RequestIdRef, outcome: Result<Value, BridgeError>) {
        let Some(pending) = lock(&self.outgoing).remove(request_id) else {
            return;
        };
        pending.cancel.cancel();
        let _ = pending.settle.send(outcome);
    }

    fn abort(&self, request_id: &RequestIdRef, reason: BridgeError) {
        let Some(pending) = lock(&self.outgoing).remove(request_id) else {
            return;
        };
        tracing::debug!(bridge = %self.name, %request_id, %reason, "withdrawing request");
        pending.cancel.cancel();
        let _ = pending.settle.send(Err(reason));
        self.publish_message(&BridgeMessage {
            request_id: request_id.to_owned(),
            event_name: CANCEL_EVENT.to_owned(),
            data: Value::Null,
        });
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }

        let outgoing: Vec<RequestId> = lock(&self.outgoing).keys().cloned().collect();
        for request_id in outgoing {
            self.abort(&request_id, BridgeError::Closed);
        }

        let incoming: Vec<Incoming> = lock(&self.incoming).drain().map(|(_, v)| v).collect();
        for task in incoming {
            task.signal.cancel();
            if let Some(task) = task.task {
                task.abort();
            }
        }

        tracing::debug!(bridge = %self.name, "bridge closed");
    }

    fn accept(self: &Arc<Self>, message: BridgeMessage, handler: Arc<dyn RequestHandler>) {
        let signal = CancellationToken::new();
        {
            let mut incoming = lock(&self.incoming);
            if incoming.contains_key(&message.request_id) {
                tracing::warn!(bridge = %self.name, request_id = %message.request_id, "ignoring duplicate request");
                return;
            }
            incoming.insert(
                message.request_id.clone(),
                Incoming {
                    signal: signal.clone(),
                    task: None,
                },
            );
        }

        let request_id = message.request_id.clone();
        let task = tokio::spawn(respond(self.clone(), message, handler, signal));

        // The task may already have finished and removed its entry.
        if let Some(entry) = lock(&self.incoming).get_mut(&request_id) {
            entry.task = Some(task.abort_handle());
        }
    }

    fn cancel_incoming(&self, request_id: &RequestIdRef) {
        if let Some(entry) = lock(&self.incoming).get(request_id) {
            tracing::debug!(bridge = %self.name, %request_id, "sender cancelled request");
            entry.signal.cancel();
        }
    }
}

async fn await_reply(
    inner: Arc<Inner>,
    request_id: RequestId,
    mut replies: Subscription,
    cancel: CancellationToken,
    timeout: Duration,
) {
    let mut last_activity = Instant::now();

    let outcome = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            reply = replies.recv() => match reply.map(serde_json::from_value::<BridgeReply>) {
                Some(Ok(BridgeReply::Pending)) => {
                    tracing::trace!(bridge = %inner.name, %request_id, "heartbeat");
                    last_activity = Instant::now();
                }
                Some(Ok(BridgeReply::Done { data })) => break Ok(data),
                Some(Ok(BridgeReply::Error { error })) => break Err(BridgeError::Remote { message: error }),
                Some(Err(error)) => {
                    tracing::warn!(bridge = %inner.name, %request_id, %error, "ignoring malformed reply");
                }
                None => break Err(BridgeError::Closed),
            },
            () = time::sleep_until(last_activity + timeout) => {
                tracing::debug!(bridge = %inner.name, %request_id, timeout_ms = timeout.as_millis() as u64, "request timed out");
                break Err(BridgeError::Timeout { after: timeout });
            }
        }
    };

    inner.settle(&request_id, outcome);
}

async fn listen(inner: Arc<Inner>, mut requests: Subscription, handler: Arc<dyn RequestHandler>) {
    while let Some(message) = requests.recv().await {
        let message: BridgeMessage = match serde_json::from_value(message) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(bridge = %inner.name, %error, "ignoring malformed request");
                continue;
            }
        };

        if lock(&inner.outgoing).contains_key(&message.request_id) {
            continue;
        }

        if message.event_name == CANCEL_EVENT {
            inner.cancel_incoming(&message.request_id);
        } else {
            inner.accept(message, handler.clone());
        }
    }
}

async fn respond(
    inner: Arc<Inner>,
    message: BridgeMessage,
    handler: Arc<dyn RequestHandler>,
    signal: CancellationToken,
) {
    let request_id = message.request_id.clone();
    let request = IncomingRequest {
        request_id: message.request_id,
        event_name: message.event_name,
        data: message.data,
    };
    tracing::trace!(bridge = %inner.name, %request_id, event = %request.event_name, "handling request");

    let every = inner.config.heartbeat_interval;
    let mut heartbeat = time::interval_at(Instant::now() + every, every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let work = AssertUnwindSafe(handler.handle(request, signal)).catch_unwind();
    tokio::pin!(work);

    let reply = loop {
        tokio::select! {
            biased;
            _ = heartbeat.tick() => inner.publish_reply(&request_id, &BridgeReply::Pending),
            outcome = &mut work => break match outcome {
                Ok(Ok(data)) => BridgeReply::Done { data },
                Ok(Err(error)) => {
                    tracing::warn!(bridge = %inner.name, %request_id, %error, "request handler failed");
                    BridgeReply::Error { error: error.to_string() }
                }
                Err(_) => {
                    tracing::warn!(bridge = %inner.name, %request_id, "request handler panicked");
                    BridgeReply::Error { error: String::from("request handler panicked") }
                }
            },
        }
    };

    inner.publish_reply(&request_id, &reply);
    lock(&inner.incoming).remove(&request_id);
}

/// A request in flight
///
/// Resolves to the receiver's reply. Dropping it does not withdraw the
/// request; use [`abort()`][Self::abort] for that.
#[derive(Debug)]
pub struct SentRequest {
    rx: oneshot::Receiver<Result<Value, BridgeError>>,
    handle: AbortHandle,
}

impl SentRequest {
    /// The request's identifier
    pub fn request_id(&self) -> &RequestIdRef {
        &self.handle.request_id
    }

    /// A handle which can abort this request from elsewhere
    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.clone()
    }

    /// Aborts the request
    ///
    /// The request fails with [`BridgeError::Aborted`] at once, and the
    /// receiver's cancellation signal is fired. Has no effect on a request
    /// that already settled.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Future for SentRequest {
    type Output = Result<Value, BridgeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(BridgeError::Closed)))
    }
}

/// Aborts a [`SentRequest`]
#[derive(Clone)]
pub struct AbortHandle {
    inner: Arc<Inner>,
    request_id: RequestId,
}

impl AbortHandle {
    /// Aborts the request, if it is still pending
    pub fn abort(&self) {
        self.inner.abort(&self.request_id, BridgeError::Aborted);
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle")
            .field("bridge", &self.inner.name)
            .field("request_id", &self.request_id)
            .finish()
    }
}
