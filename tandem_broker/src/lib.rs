//! A token broker for cooperating actors
//!
//! One actor, the [`Host`], holds the credentials. Other actors, the
//! [`Delegate`]s, ask it for tokens over a [`TaskBridge`][tandem_sync::TaskBridge]
//! instead of holding refresh tokens themselves.
//!
//! The Host answers four requests:
//!
//! * `PING`, a liveness probe answered with `{"message": "PONG"}`;
//! * `TOKEN`, answered with `{"token": ...}` from its [`TokenFinder`];
//! * `AUTHORIZE`, answered with the headers its [`SigningAuthority`]
//!   produces for an outgoing request;
//! * `PROFILE`, answered with the claims of the user's identity token.
//!
//! Any of these may instead be answered with `{"error": "..."}`.
//!
//! ```
//! use std::sync::Arc;
//!
//! use tandem_broker::{
//!     BearerSigner, CredentialTokenFinder, Delegate, DelegateConfig, Host, HostConfig,
//! };
//! use tandem_clock::DurationSecs;
//! use tandem_sync::LocalNamespace;
//! use tandem_tokens::{
//!     CredentialStore, InMemoryCredentialStore, OAuth2Client, RefreshCoalescer, RefreshError,
//!     RefreshOutcome, Scopes, Token,
//! };
//!
//! # struct Authority;
//! # #[async_trait::async_trait]
//! # impl OAuth2Client for Authority {
//! #     async fn perform_refresh(&self, _: &Token, _: Option<&Scopes>) -> Result<RefreshOutcome, RefreshError> {
//! #         Err(RefreshError::MissingRefreshToken)
//! #     }
//! # }
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let namespace = LocalNamespace::new();
//!
//! let store = Arc::new(InMemoryCredentialStore::new());
//! let token = Token::builder("access", DurationSecs(3600)).build();
//! store.store(token.clone(), Default::default()).await.unwrap();
//!
//! let finder = CredentialTokenFinder::new(store, Arc::new(RefreshCoalescer::new(Authority)));
//! let host = Host::new(
//!     HostConfig::new("broker"),
//!     namespace.actor("https://app.example.com"),
//!     finder,
//!     BearerSigner::new(),
//! );
//! host.activate();
//!
//! let delegate = Delegate::new(
//!     DelegateConfig::new("broker"),
//!     namespace.actor("https://widget.example.com"),
//! );
//!
//! assert!(delegate.ping_host().await);
//! assert_eq!(delegate.get_token(None).await.unwrap(), token);
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

use std::sync::{Mutex, MutexGuard, PoisonError};

mod delegate;
mod finder;
mod host;
mod protocol;
mod signing;

pub use delegate::{BrokerError, Delegate, DelegateConfig, DPOP};
pub use finder::{
    CredentialTokenFinder, FindTokenError, TokenFinder, DELEGATED_TAG, TOKEN_REQUEST_LOCK_TIMEOUT,
};
pub use host::{Host, HostConfig, HostEvent, HostStatus, SessionEvent};
pub use protocol::*;
pub use signing::{
    BearerSigner, DpopProofSource, SignedHeaders, SigningAuthority, SigningError, SigningRequest,
};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
