//! Tokens, credentials and coalesced refreshes
//!
//! A [`Token`] is an immutable snapshot of what an authority issued: an
//! access token with its lifetime and scopes, and optionally a refresh token
//! and an ID token. Refreshing never changes a token; it produces a new one
//! with a new [`TokenId`].
//!
//! Tokens are kept as [`Credential`]s in a [`CredentialStore`]. The
//! [`RefreshCoalescer`] wraps an [`OAuth2Client`] so that concurrent refreshes
//! of the same token for the same scopes reach the authority once, and, when
//! given a [`SynchronizedResult`][tandem_sync::SynchronizedResult], only once
//! across every cooperating actor.
//!
//! ```
//! use tandem_clock::{DurationSecs, TestClock, UnixTime};
//! use tandem_tokens::{Scopes, Token};
//!
//! let clock = TestClock::new(UnixTime(1_000));
//! let token = Token::builder("access", DurationSecs(300))
//!     .refresh_token("refresh")
//!     .scopes(Scopes::from_space_delimited("openid profile"))
//!     .build_with_clock(&clock);
//!
//! assert!(token.will_be_valid_in_with_clock(DurationSecs(60), &clock));
//!
//! clock.advance(DurationSecs(280));
//! assert!(token.will_be_expired_in_with_clock(DurationSecs(30), &clock));
//! assert!(token.scopes().is_superset(&Scopes::from_space_delimited("openid")));
//! ```
//!
//! Secret values such as access tokens are redacted when displayed or
//! debugged, unless the alternate flag is used.
//!
//! ```
//! use tandem_tokens::AccessTokenRef;
//!
//! let token = AccessTokenRef::from_static("eyJhbGciOiJSUzI1NiJ9.payload.signature");
//! assert_eq!(format!("{}", token), "***ACCESS TOKEN***");
//! assert_eq!(format!("{:#8}", token), "eyJhbGc…");
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

mod braids;
mod client;
mod credential;
#[cfg(feature = "oauth2")]
pub mod oauth2;
mod refresh;
mod scope;
mod tokens;

pub use braids::*;
pub use client::{
    OAuth2Client, OAuth2ErrorResponse, OpenIdConfiguration, RefreshError, RefreshOutcome,
    TokenKind,
};
pub use credential::{
    Credential, CredentialEvent, CredentialStore, InMemoryCredentialStore, StoreError,
    UnknownCredential,
};
#[cfg(feature = "oauth2")]
pub use oauth2::HttpOAuth2Client;
pub use refresh::RefreshCoalescer;
pub use scope::{Scope, ScopeRef, Scopes};
pub use tokens::{Token, TokenBuilder, TokenType};
