//! Coordination primitives for cooperating actors
//!
//! An _actor_ is an independent execution context, such as a browser tab or
//! an embedded frame, which shares no memory with its peers. Actors belonging
//! to one logical application see a common namespace exposing two services:
//!
//! * a [`Channel`], which publishes JSON messages to every subscriber of a
//!   channel name, and
//! * a [`NamedLock`], which hands out a lock by name without blocking and
//!   reports when a held lock is released.
//!
//! Everything else in this crate is built from those two services alone:
//!
//! * [`SynchronizedResult`] runs a side-effecting task at most once across all
//!   actors racing to run it and shares the outcome with every one of them.
//! * [`SingleFlight`] collapses identical concurrent calls within one actor.
//! * [`TaskBridge`] is a request/reply bus with heartbeats, timeouts and
//!   cooperative cancellation.
//!
//! [`LocalNamespace`] implements both services in-process, which is enough to
//! run several actors inside one test or one process.
//!
//! ```
//! use tandem_sync::{ExecOptions, LocalNamespace, SynchronizedResult};
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let namespace = LocalNamespace::new();
//! let tab = namespace.actor("https://app.example.com");
//! let coordinator = SynchronizedResult::new(tab.clone(), tab);
//!
//! let value: u32 = coordinator
//!     .exec("answer", || async { Ok::<_, std::io::Error>(42) }, ExecOptions::default())
//!     .await
//!     .unwrap();
//!
//! assert_eq!(value, 42);
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod bridge;
mod channel;
mod coordinator;
mod local;
mod single_flight;

pub use bridge::{BridgeConfig, BridgeError, TaskBridge};
pub use channel::{Channel, LockGuard, NamedLock, Origin, OriginPolicy, Subscription};
pub use coordinator::{ExecOptions, SyncError, SynchronizedResult};
pub use local::{LocalChannel, LocalNamespace};
pub use single_flight::SingleFlight;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the data if a previous holder panicked
///
/// None of the guarded maps in this crate can be left half-updated by a panic,
/// so a poisoned lock is still safe to use.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
