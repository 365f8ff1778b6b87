//! An in-process namespace of channels and locks

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use crate::{
    channel::{Channel, LockGuard, NamedLock, Origin, OriginPolicy, Subscription},
    lock,
};

/// A namespace of channels and locks living inside one process
///
/// Each actor takes its own [`LocalChannel`] handle with [`actor()`][Self::actor].
/// Locks taken through a handle are released when their guard is dropped, so
/// an actor that is torn down mid-task frees its locks the same way a closed
/// browser tab does.
#[derive(Clone, Debug, Default)]
pub struct LocalNamespace {
    inner: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    held: Mutex<HashSet<String>>,
    released: Notify,
    next_subscriber: AtomicU64,
}

struct Subscriber {
    id: u64,
    policy: OriginPolicy,
    tx: mpsc::UnboundedSender<Value>,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("channels", &lock(&self.subscribers).len())
            .field("held", &*lock(&self.held))
            .finish()
    }
}

impl LocalNamespace {
    /// Constructs an empty namespace
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a handle for an actor publishing from `origin`
    ///
    /// The handle trusts every origin until restricted with
    /// [`LocalChannel::with_policy()`].
    pub fn actor(&self, origin: impl Into<Origin>) -> LocalChannel {
        LocalChannel {
            shared: self.inner.clone(),
            origin: origin.into(),
            policy: OriginPolicy::AllowAll,
        }
    }

    /// Whether any actor currently holds the lock `name`
    pub fn is_held(&self, name: &str) -> bool {
        lock(&self.inner.held).contains(name)
    }

    /// The number of live subscriptions to `channel`
    pub fn subscriber_count(&self, channel: &str) -> usize {
        lock(&self.inner.subscribers)
            .get(channel)
            .map_or(0, |subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
    }
}

/// One actor's handle onto a [`LocalNamespace`]
#[derive(Clone, Debug)]
pub struct LocalChannel {
    shared: Arc<Shared>,
    origin: Origin,
    policy: OriginPolicy,
}

impl LocalChannel {
    /// Restricts the origins whose messages this handle's subscriptions accept
    pub fn with_policy(mut self, policy: OriginPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The origin stamped on messages published through this handle
    pub fn origin(&self) -> &Origin {
        &self.origin
    }
}

impl Channel for LocalChannel {
    fn publish(&self, channel: &str, message: Value) {
        let mut subscribers = lock(&self.shared.subscribers);
        let Some(subs) = subscribers.get_mut(channel) else {
            tracing::trace!(channel, "no subscribers, message dropped");
            return;
        };

        subs.retain(|s| !s.tx.is_closed());
        for sub in subs.iter() {
            if sub.policy.allows(&self.origin) {
                // A receiver dropped since `retain` is harmless to skip.
                let _ = sub.tx.send(message.clone());
            } else {
                tracing::warn!(
                    channel,
                    origin = %self.origin,
                    subscriber = sub.id,
                    "dropping message from untrusted origin"
                );
            }
        }
    }

    fn subscribe(&self, channel: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);

        lock(&self.shared.subscribers)
            .entry(channel.to_owned())
            .or_default()
            .push(Subscriber {
                id,
                policy: self.policy.clone(),
                tx,
            });

        let shared = Arc::downgrade(&self.shared);
        let name = channel.to_owned();
        Subscription::new(channel, rx, move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut subscribers = lock(&shared.subscribers);
            if let Some(subs) = subscribers.get_mut(&name) {
                subs.retain(|s| s.id != id);
                if subs.is_empty() {
                    subscribers.remove(&name);
                }
            }
        })
    }
}

#[async_trait]
impl NamedLock for LocalChannel {
    fn try_acquire(&self, name: &str) -> Option<LockGuard> {
        if !lock(&self.shared.held).insert(name.to_owned()) {
            tracing::trace!(lock = name, origin = %self.origin, "lock busy");
            return None;
        }

        tracing::trace!(lock = name, origin = %self.origin, "lock acquired");
        let shared = self.shared.clone();
        let owned = name.to_owned();
        Some(LockGuard::new(name, move || {
            lock(&shared.held).remove(&owned);
            tracing::trace!(lock = %owned, "lock released");
            shared.released.notify_waiters();
        }))
    }

    async fn released(&self, name: &str) {
        loop {
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed.
            notified.as_mut().enable();

            if !lock(&self.shared.held).contains(name) {
                return;
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_messages_in_publish_order() {
        let namespace = LocalNamespace::new();
        let a = namespace.actor("https://a.example");
        let b = namespace.actor("https://b.example");

        let mut first = a.subscribe("updates");
        let mut second = b.subscribe("updates");

        b.publish("updates", json!(1));
        b.publish("updates", json!(2));

        assert_eq!(first.recv().await, Some(json!(1)));
        assert_eq!(first.recv().await, Some(json!(2)));
        assert_eq!(second.recv().await, Some(json!(1)));
        assert_eq!(second.recv().await, Some(json!(2)));
    }

    #[tokio::test]
    async fn dropping_a_subscription_unsubscribes() {
        let namespace = LocalNamespace::new();
        let actor = namespace.actor("https://a.example");

        let sub = actor.subscribe("updates");
        assert_eq!(namespace.subscriber_count("updates"), 1);

        drop(sub);
        assert_eq!(namespace.subscriber_count("updates"), 0);
    }

    mod when_origin_is_not_allowed {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn message_is_silently_dropped() {
            let namespace = LocalNamespace::new();
            let trusted = namespace.actor("https://trusted.example");
            let stranger = namespace.actor("https://evil.example");
            let receiver = namespace
                .actor("https://app.example")
                .with_policy(OriginPolicy::allow_list(["https://trusted.example"]));

            let mut sub = receiver.subscribe("broker");
            stranger.publish("broker", json!("ignored"));
            trusted.publish("broker", json!("accepted"));

            assert_eq!(sub.recv().await, Some(json!("accepted")));
            let nothing = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
            assert!(nothing.is_err());
        }
    }

    mod named_lock {
        use super::*;

        #[tokio::test]
        async fn second_acquire_is_busy_until_release() {
            let namespace = LocalNamespace::new();
            let a = namespace.actor("https://a.example");
            let b = namespace.actor("https://b.example");

            let guard = a.try_acquire("refresh").expect("lock should be free");
            assert!(b.try_acquire("refresh").is_none());
            assert!(b.try_acquire("other").is_some());

            drop(guard);
            assert!(b.try_acquire("refresh").is_some());
        }

        #[tokio::test(start_paused = true)]
        async fn released_resolves_when_holder_drops_guard() {
            let namespace = LocalNamespace::new();
            let holder = namespace.actor("https://a.example");
            let waiter = namespace.actor("https://b.example");

            let guard = holder.try_acquire("refresh").unwrap();
            let wait = tokio::spawn(async move { waiter.released("refresh").await });

            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(!wait.is_finished());

            drop(guard);
            tokio::time::timeout(Duration::from_secs(1), wait)
                .await
                .expect("release should be observed")
                .unwrap();
        }

        #[tokio::test]
        async fn released_resolves_immediately_when_free() {
            let namespace = LocalNamespace::new();
            let actor = namespace.actor("https://a.example");

            actor.released("never-held").await;
            assert!(!namespace.is_held("never-held"));
        }
    }
}
