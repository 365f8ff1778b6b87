//! Middleware that authorizes outgoing requests through a token broker
//!
//! Include the [`BrokeredAuthMiddleware`] in a
//! [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware) stack
//! and every matching request is sent to the Host via
//! [`Delegate::authorize()`], which returns it carrying an `Authorization`
//! header and, for DPoP tokens, a `DPoP` proof. The token never leaves the
//! Host, so each request is signed individually.
//!
//! If a request already carries an `Authorization` header by the time the
//! middleware executes, it is sent as is.
//!
//! ```
//! use std::sync::Arc;
//!
//! use predicates::prelude::PredicateBooleanExt;
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! use tandem_broker::{Delegate, DelegateConfig};
//! use tandem_reqwest::{BrokeredAuthMiddleware, HostAllowList, HttpsOnly};
//! use tandem_sync::LocalNamespace;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let namespace = LocalNamespace::new();
//! let delegate = Arc::new(Delegate::new(
//!     DelegateConfig::new("broker"),
//!     namespace.actor("https://widget.example.com"),
//! ));
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(
//!         BrokeredAuthMiddleware::new(delegate)
//!             .with_predicate(HttpsOnly.and(HostAllowList::new(["api.example.com"]))),
//!     )
//!     .build();
//! # drop(client);
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
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{collections::BTreeSet, fmt, sync::Arc};

use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response};
use reqwest_middleware::{Middleware, Next, Result};
use tandem_broker::Delegate;
use tandem_clock::{Clock, System};

/// A middleware that has each outgoing request authorized by a Host
#[derive(Debug)]
pub struct BrokeredAuthMiddleware<P, C = System> {
    delegate: Arc<Delegate<C>>,
    predicate: P,
}

impl<P: Clone, C> Clone for BrokeredAuthMiddleware<P, C> {
    fn clone(&self) -> Self {
        Self {
            delegate: self.delegate.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

impl<C> BrokeredAuthMiddleware<HttpsOnly, C> {
    /// Constructs a middleware that authorizes through `delegate`
    ///
    /// By default, only requests sent over HTTPS are authorized. To change
    /// this, provide a custom predicate with
    /// [`with_predicate()`][Self::with_predicate()].
    pub fn new(delegate: Arc<Delegate<C>>) -> Self {
        Self {
            delegate,
            predicate: HttpsOnly,
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> BrokeredAuthMiddleware<P, C> {
        BrokeredAuthMiddleware {
            delegate: self.delegate,
            predicate,
        }
    }
}

#[async_trait::async_trait]
impl<P, C> Middleware for BrokeredAuthMiddleware<P, C>
where
    P: Predicate<Request> + Send + Sync + 'static,
    C: Clock + Send + Sync + 'static,
{
    async fn handle(
        &self,
        req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) || req.headers().contains_key(header::AUTHORIZATION) {
            return next.run(req, extensions).await;
        }

        let req = self
            .delegate
            .authorize(&req)
            .await
            .map_err(reqwest_middleware::Error::middleware)?;

        tracing::trace!(url = %req.url(), "attached brokered authorization");
        next.run(req, extensions).await
    }
}

/// Only authorize requests sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        (result != expected).then(|| {
            reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                "scheme",
                req.url().scheme().to_owned(),
            ))
        })
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only authorize requests sent to one of a set of hosts
#[derive(Clone, Debug)]
pub struct HostAllowList {
    hosts: BTreeSet<String>,
}

impl HostAllowList {
    /// Constructs a predicate matching any of `hosts` exactly
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }
}

impl Predicate<Request> for HostAllowList {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url()
            .host_str()
            .map_or(false, |host| self.hosts.contains(host))
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        (result != expected).then(|| {
            reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                "host",
                req.url().host_str().unwrap_or("<none>").to_owned(),
            ))
        })
    }
}

impl reflection::PredicateReflection for HostAllowList {}
impl fmt::Display for HostAllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host in [")?;
        for (n, host) in self.hosts.iter().enumerate() {
            if n > 0 {
                f.write_str(", ")?;
            }
            f.write_str(host)?;
        }
        f.write_str("]")
    }
}
