//! At-most-once execution of a task across actors

use std::{fmt, future::Future, sync::Arc, time::Duration};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::{self, Instant};

use crate::channel::{Channel, NamedLock, Subscription};

/// Options controlling one [`SynchronizedResult::exec()`] call
#[derive(Clone, Copy, Debug)]
pub struct ExecOptions {
    timeout: Duration,
    lock_freed_delay: Duration,
    retries: u32,
}

impl Default for ExecOptions {
    /// Default execution options
    ///
    /// Waits up to 10 seconds per attempt for the winner's result, allows a
    /// 100 ms grace period for a result broadcast racing a lock release, and
    /// retries once.
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            lock_freed_delay: Duration::from_millis(100),
            retries: 1,
        }
    }
}

impl ExecOptions {
    /// Constructs a new set of execution options
    pub fn new(timeout: Duration, lock_freed_delay: Duration, retries: u32) -> Self {
        Self {
            timeout,
            lock_freed_delay,
            retries,
        }
    }

    /// Sets how long a losing actor waits for the winner in each attempt
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets how long to keep listening for a result after the lock is freed
    pub fn with_lock_freed_delay(mut self, lock_freed_delay: Duration) -> Self {
        self.lock_freed_delay = lock_freed_delay;
        self
    }

    /// Sets how many times a loser competes again after the winner vanished
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// The per-attempt wait for a winner's result
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// An error from a synchronized task
#[derive(Debug, Error)]
pub enum SyncError {
    /// The task ran, in this actor or another, and failed
    #[error("synchronized task failed: {message}")]
    TaskFailed {
        /// The task's error message
        message: String,
    },
    /// No actor produced a result within the allowed attempts
    #[error("task unable to fulfill: lock `{name}` never yielded a result")]
    LockUnavailable {
        /// The name of the contended lock
        name: String,
    },
    /// A result could not be shared between actors
    #[error("unable to share synchronized result")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
enum Broadcast {
    Fulfilled { value: Value },
    Failed { error: String },
}

enum Waited {
    Delivered(Broadcast),
    Freed,
    TimedOut,
}

/// Runs a task at most once across all actors racing to run it
///
/// The first actor to take the lock named after the task runs it and
/// broadcasts the outcome on a channel of the same name. Every other actor
/// adopts that outcome instead of running the task itself. If the winner
/// disappears without broadcasting, the lock is freed and a waiting actor
/// competes again, up to the configured number of retries.
#[derive(Clone)]
pub struct SynchronizedResult {
    channel: Arc<dyn Channel>,
    locks: Arc<dyn NamedLock>,
}

impl fmt::Debug for SynchronizedResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizedResult")
            .field("channel", &self.channel)
            .field("locks", &self.locks)
            .finish()
    }
}

impl SynchronizedResult {
    /// Constructs a coordinator on top of a channel and a lock service
    pub fn new<C, L>(channel: C, locks: L) -> Self
    where
        C: Channel + 'static,
        L: NamedLock + 'static,
    {
        Self {
            channel: Arc::new(channel),
            locks: Arc::new(locks),
        }
    }

    /// Runs `task` under the name `name`, unless another actor already is
    ///
    /// `task` may be invoked again on a retry, but only by an actor that has
    /// won the lock.
    pub async fn exec<T, E, F, Fut>(
        &self,
        name: &str,
        mut task: F,
        options: ExecOptions,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
    {
        let mut retries = options.retries;

        loop {
            // Listen before contending so a winner finishing in between
            // cannot slip its broadcast past us.
            let mut results = self.channel.subscribe(name);

            if let Some(guard) = self.locks.try_acquire(name) {
                drop(results);
                tracing::debug!(lock = name, "won lock, running task");

                let (broadcast, outcome) = match task().await {
                    Ok(value) => (
                        Broadcast::Fulfilled {
                            value: serde_json::to_value(&value)?,
                        },
                        Ok(value),
                    ),
                    Err(error) => {
                        let message = error.to_string();
                        tracing::debug!(lock = name, error = %message, "task failed");
                        (
                            Broadcast::Failed {
                                error: message.clone(),
                            },
                            Err(SyncError::TaskFailed { message }),
                        )
                    }
                };

                self.channel.publish(name, serde_json::to_value(&broadcast)?);
                drop(guard);
                return outcome;
            }

            tracing::debug!(lock = name, "lock busy, waiting for winner");
            match self.await_winner(name, &mut results, &options).await {
                Waited::Delivered(Broadcast::Fulfilled { value }) => {
                    tracing::debug!(lock = name, "adopting winner's result");
                    return Ok(serde_json::from_value(value)?);
                }
                Waited::Delivered(Broadcast::Failed { error }) => {
                    tracing::debug!(lock = name, error = %error, "adopting winner's failure");
                    return Err(SyncError::TaskFailed { message: error });
                }
                Waited::Freed | Waited::TimedOut if retries > 0 => {
                    retries -= 1;
                    tracing::debug!(lock = name, retries, "no result from winner, competing again");
                }
                Waited::Freed | Waited::TimedOut => {
                    tracing::warn!(lock = name, "no result from winner and no retries left");
                    return Err(SyncError::LockUnavailable {
                        name: name.to_owned(),
                    });
                }
            }
        }
    }

    async fn await_winner(
        &self,
        name: &str,
        results: &mut Subscription,
        options: &ExecOptions,
    ) -> Waited {
        let deadline = Instant::now() + options.timeout;
        let freed = async {
            self.locks.released(name).await;
            tracing::trace!(lock = name, "lock freed, waiting for a late result");
            time::sleep(options.lock_freed_delay).await;
        };
        tokio::pin!(freed);

        // Whichever signal arrives first decides; the others are ignored.
        loop {
            tokio::select! {
                biased;
                message = results.recv() => match message {
                    Some(message) => match serde_json::from_value(message) {
                        Ok(broadcast) => return Waited::Delivered(broadcast),
                        Err(error) => {
                            tracing::warn!(lock = name, %error, "ignoring malformed result broadcast");
                        }
                    },
                    None => return Waited::Freed,
                },
                () = &mut freed => return Waited::Freed,
                () = time::sleep_until(deadline) => {
                    tracing::debug!(lock = name, timeout_ms = options.timeout.as_millis() as u64, "timed out waiting for winner");
                    return Waited::TimedOut;
                }
            }
        }
    }
}
