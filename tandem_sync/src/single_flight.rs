//! In-process de-duplication of concurrent identical calls

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    hash::Hash,
    sync::Mutex,
};

use tokio::sync::watch;

use crate::lock;

/// Collapses concurrent calls sharing a key onto one execution
///
/// The first caller for a key becomes the _leader_ and runs the work; callers
/// arriving while it is in flight wait for the leader's outcome and receive a
/// clone of it. Outcomes are not cached: once the leader finishes, the next
/// call for the key starts a fresh execution.
///
/// If the leader is cancelled before finishing, one of the waiting callers
/// takes over and runs its own work.
pub struct SingleFlight<K, V> {
    inflight: Mutex<HashMap<K, watch::Receiver<Option<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> fmt::Debug for SingleFlight<K, V>
where
    K: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlight")
            .field("inflight", &lock(&self.inflight).keys().collect::<Vec<_>>())
            .finish()
    }
}

enum Role<V> {
    Leader(watch::Sender<Option<V>>),
    Follower(watch::Receiver<Option<V>>),
}

struct Evict<'a, K: Hash + Eq, V> {
    inflight: &'a Mutex<HashMap<K, watch::Receiver<Option<V>>>>,
    key: &'a K,
    tx: &'a watch::Sender<Option<V>>,
}

impl<K: Hash + Eq, V> Drop for Evict<'_, K, V> {
    fn drop(&mut self) {
        let mut inflight = lock(self.inflight);
        if inflight
            .get(self.key)
            .map_or(false, |rx| rx.same_channel(&self.tx.subscribe()))
        {
            inflight.remove(self.key);
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Constructs an empty single-flight group
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of keys with work currently in flight
    pub fn inflight(&self) -> usize {
        lock(&self.inflight).len()
    }

    /// Runs `work` for `key`, or joins the execution already in flight
    pub async fn run<F, Fut>(&self, key: K, work: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        loop {
            let role = {
                let mut inflight = lock(&self.inflight);
                match inflight.get(&key) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        inflight.insert(key.clone(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Follower(mut rx) => {
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(outcome) => outcome.clone(),
                        Err(_) => None,
                    };
                    if let Some(outcome) = outcome {
                        return outcome;
                    }
                    tracing::trace!("single-flight leader went away, taking over");
                }
                Role::Leader(tx) => {
                    let evict = Evict {
                        inflight: &self.inflight,
                        key: &key,
                        tx: &tx,
                    };
                    let outcome = work().await;

                    // Evict before publishing so later callers start afresh.
                    drop(evict);
                    tx.send_replace(Some(outcome.clone()));
                    return outcome;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_execution() {
        let group = Arc::new(SingleFlight::<&str, u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let group = group.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                group
                    .run("key", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        5
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 5);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(group.inflight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_run_independently() {
        let group = Arc::new(SingleFlight::<&str, &str>::new());

        let a = group.run("a", || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            "a"
        });
        let b = group.run("b", || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            "b"
        });

        assert_eq!(tokio::join!(a, b), ("a", "b"));
    }

    #[tokio::test]
    async fn outcomes_are_not_cached() {
        let group = SingleFlight::<&str, Result<u32, String>>::new();

        let first = group.run("key", || async { Err(String::from("boom")) }).await;
        let second = group.run("key", || async { Ok(1) }).await;

        assert!(first.is_err());
        assert_eq!(second, Ok(1));
    }

    mod when_leader_is_cancelled {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn follower_takes_over() {
            let group = Arc::new(SingleFlight::<&str, u32>::new());

            let leader_group = group.clone();
            let leader = tokio::spawn(async move {
                leader_group
                    .run("key", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        1
                    })
                    .await
            });
            tokio::time::sleep(Duration::from_millis(1)).await;

            let follower_group = group.clone();
            let follower = tokio::spawn(async move {
                follower_group.run("key", || async { 2 }).await
            });
            tokio::time::sleep(Duration::from_millis(1)).await;

            leader.abort();

            assert_eq!(follower.await.unwrap(), 2);
        }
    }
}
