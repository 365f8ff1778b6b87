use std::{collections::BTreeSet, fmt, sync::Arc};

use aliri_braid::braid;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// The declared origin of an actor, such as `https://app.example.com`
#[braid(serde)]
pub struct Origin;

/// Decides which publishers a subscriber trusts
///
/// Messages from an untrusted origin are dropped before they reach the
/// subscriber and are never surfaced to application code.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OriginPolicy {
    /// Accept messages from every origin
    #[default]
    AllowAll,
    /// Accept messages only from the listed origins
    AllowList(BTreeSet<Origin>),
}

impl OriginPolicy {
    /// Constructs an allow-list policy
    pub fn allow_list<I, O>(origins: I) -> Self
    where
        I: IntoIterator<Item = O>,
        O: Into<Origin>,
    {
        Self::AllowList(origins.into_iter().map(Into::into).collect())
    }

    /// Whether a message published from `origin` may be delivered
    pub fn allows(&self, origin: &OriginRef) -> bool {
        match self {
            Self::AllowAll => true,
            Self::AllowList(allowed) => allowed.contains(origin),
        }
    }
}

/// A named publish/subscribe transport shared by every actor of an application
///
/// Within one channel name, each subscriber observes messages in publish order.
/// Delivery is not guaranteed: an actor that goes away before publishing never
/// publishes, and peers must bound any wait on it.
pub trait Channel: Send + Sync + fmt::Debug {
    /// Publishes a message to every current subscriber of `channel`
    fn publish(&self, channel: &str, message: Value);

    /// Subscribes to messages published to `channel` from now on
    ///
    /// Dropping the returned subscription unsubscribes.
    fn subscribe(&self, channel: &str) -> Subscription;
}

impl<T: Channel + ?Sized> Channel for Arc<T> {
    fn publish(&self, channel: &str, message: Value) {
        (**self).publish(channel, message)
    }

    fn subscribe(&self, channel: &str) -> Subscription {
        (**self).subscribe(channel)
    }
}

/// A stream of messages published to one channel name
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<Value>,
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Constructs a subscription from a message receiver
    ///
    /// `on_drop` runs once, when the subscription is dropped.
    pub fn new(
        channel: impl Into<String>,
        rx: mpsc::UnboundedReceiver<Value>,
        on_drop: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            channel: channel.into(),
            rx,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// The channel name this subscription listens to
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receives the next message
    ///
    /// Returns `None` once the underlying transport has gone away.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

/// A named lock service shared by every actor of an application
#[async_trait]
pub trait NamedLock: Send + Sync + fmt::Debug {
    /// Attempts to take the lock `name` without waiting
    ///
    /// Returns `None` if some actor already holds it. The lock is held until
    /// the returned guard is dropped.
    fn try_acquire(&self, name: &str) -> Option<LockGuard>;

    /// Resolves once the lock `name` is free
    ///
    /// The release may come from any actor, including one that went away
    /// while holding the lock. Resolves immediately if the lock is not held.
    async fn released(&self, name: &str);
}

#[async_trait]
impl<T: NamedLock + ?Sized> NamedLock for Arc<T> {
    fn try_acquire(&self, name: &str) -> Option<LockGuard> {
        (**self).try_acquire(name)
    }

    async fn released(&self, name: &str) {
        (**self).released(name).await
    }
}

/// Proof that a named lock is held; releases the lock when dropped
pub struct LockGuard {
    name: String,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl LockGuard {
    /// Constructs a guard that runs `release` when dropped
    pub fn new(name: impl Into<String>, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            release: Some(Box::new(release)),
        }
    }

    /// The name of the held lock
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}
