//! The actor side that asks a Host for tokens

use std::{collections::HashMap, fmt, sync::Mutex, time::Duration};

use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tandem_clock::{Clock, DurationSecs, System};
use tandem_sync::{BridgeConfig, BridgeError, Channel, SingleFlight, TaskBridge};
use tandem_tokens::{ClientId, Issuer, Scopes, Token, TokenType};
use thiserror::Error;

use crate::{
    lock, AuthParams, AuthorizeGrant, AuthorizeRequest, BrokerEvent, BrokerReply, ProfileGrant,
    Pong, TokenGrant, PONG,
};

/// The `DPoP` header
pub static DPOP: HeaderName = HeaderName::from_static("dpop");

/// An error obtaining something from the Host
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The Host replied with an error
    #[error("host refused: {message}")]
    Host {
        /// The Host's error message
        message: String,
    },
    /// The Host did not respond in time
    #[error("no response from host within {after:?}")]
    Timeout {
        /// How long the Delegate waited
        after: Duration,
    },
    /// The request was aborted
    #[error("request aborted")]
    Aborted,
    /// A header the Host must supply was missing or empty
    #[error("host did not supply the `{header}` header")]
    MissingHeader {
        /// The missing header
        header: &'static str,
    },
    /// The outgoing request cannot be authorized
    #[error("request cannot be authorized: {message}")]
    InvalidRequest {
        /// What is wrong with the request
        message: String,
    },
    /// The Host's reply was not understood
    #[error("unexpected reply from host: {message}")]
    InvalidReply {
        /// What was wrong with the reply
        message: String,
    },
    /// The bridge failed
    #[error("bridge failure")]
    Bridge(#[source] BridgeError),
}

impl From<BridgeError> for BrokerError {
    fn from(error: BridgeError) -> Self {
        match error {
            BridgeError::Timeout { after } => Self::Timeout { after },
            BridgeError::Aborted => Self::Aborted,
            other => Self::Bridge(other),
        }
    }
}

/// Configuration for a [`Delegate`]
#[derive(Clone, Debug)]
pub struct DelegateConfig {
    name: String,
    client_id: Option<ClientId>,
    issuer: Option<Issuer>,
    scopes: Scopes,
    token_grace_period: DurationSecs,
    request_timeout: Duration,
    ping_timeout: Duration,
}

impl DelegateConfig {
    /// A Delegate of the Host serving broker `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client_id: None,
            issuer: None,
            scopes: Scopes::new(),
            token_grace_period: DurationSecs(30),
            request_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(2),
        }
    }

    /// Requests tokens for `client_id` by default
    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Requests tokens from `issuer` by default
    pub fn with_issuer(mut self, issuer: Issuer) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Requests tokens with `scopes` by default
    pub fn with_scopes(mut self, scopes: Scopes) -> Self {
        self.scopes = scopes;
        self
    }

    /// A cached token expiring within this period is not reused
    pub fn with_token_grace_period(mut self, grace_period: DurationSecs) -> Self {
        self.token_grace_period = grace_period;
        self
    }

    /// How long the Host may stay silent before a request fails
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// How long [`Delegate::ping_host()`] waits for a reply
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// The broker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parameters used when none are given
    pub fn default_params(&self) -> AuthParams {
        AuthParams {
            issuer: self.issuer.clone(),
            client_id: self.client_id.clone(),
            scopes: self.scopes.clone(),
        }
    }
}

/// Obtains tokens from a Host instead of holding credentials itself
///
/// Tokens are cached per [cache key](AuthParams::cache_key) and reused
/// while they remain valid beyond the grace period. Concurrent requests
/// for the same key share one round trip to the Host.
pub struct Delegate<C = System> {
    config: DelegateConfig,
    bridge: TaskBridge,
    cache: Mutex<HashMap<String, Token>>,
    flights: SingleFlight<String, Result<Token, BrokerError>>,
    clock: C,
}

impl<C> fmt::Debug for Delegate<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delegate")
            .field("name", &self.config.name)
            .field("cached", &lock(&self.cache).len())
            .field("inflight", &self.flights.inflight())
            .finish()
    }
}

impl Delegate<System> {
    /// Constructs a Delegate talking over `channel`
    pub fn new(config: DelegateConfig, channel: impl Channel + 'static) -> Self {
        let bridge = TaskBridge::new(config.name.clone(), channel, BridgeConfig::default());
        Self {
            config,
            bridge,
            cache: Mutex::new(HashMap::new()),
            flights: SingleFlight::new(),
            clock: System,
        }
    }
}

impl<C> Delegate<C> {
    /// Judges cached token freshness with a different clock
    pub fn with_clock<D>(self, clock: D) -> Delegate<D> {
        Delegate {
            config: self.config,
            bridge: self.bridge,
            cache: self.cache,
            flights: self.flights,
            clock,
        }
    }

    /// The Delegate's configuration
    pub fn config(&self) -> &DelegateConfig {
        &self.config
    }

    /// Forgets every cached token
    pub fn clear_cache(&self) {
        lock(&self.cache).clear();
    }

    /// Stops talking to the Host
    ///
    /// Pending requests fail with [`BridgeError::Closed`].
    pub fn close(&self) {
        self.bridge.close();
    }

    async fn request<T: DeserializeOwned>(
        &self,
        event: BrokerEvent,
        data: Value,
    ) -> Result<T, BrokerError> {
        tracing::trace!(broker = %self.config.name, %event, "sending broker request");
        let reply = self
            .bridge
            .send_with_timeout(event.as_str(), data, self.config.request_timeout)
            .await?;

        let reply: BrokerReply<T> =
            serde_json::from_value(reply).map_err(|e| BrokerError::InvalidReply {
                message: e.to_string(),
            })?;

        reply
            .into_result()
            .map_err(|message| BrokerError::Host { message })
    }

    /// Asks whether a Host is answering
    ///
    /// Silence or any failure is reported as `false`.
    pub async fn ping_host(&self) -> bool {
        let reply = self
            .bridge
            .send_with_timeout(
                BrokerEvent::Ping.as_str(),
                Value::Null,
                self.config.ping_timeout,
            )
            .await;

        match reply.map(serde_json::from_value::<Pong>) {
            Ok(Ok(pong)) => pong.message == PONG,
            Ok(Err(error)) => {
                tracing::debug!(%error, "unexpected reply to ping");
                false
            }
            Err(error) => {
                tracing::debug!(%error, "host did not answer ping");
                false
            }
        }
    }

    /// Gets the claims of the current user's identity token
    pub async fn profile(&self) -> Result<Map<String, Value>, BrokerError> {
        let grant: ProfileGrant = self
            .request(BrokerEvent::Profile, to_value(&self.config.default_params())?)
            .await?;
        Ok(grant.claims)
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, BrokerError> {
    serde_json::to_value(value).map_err(|e| BrokerError::InvalidRequest {
        message: e.to_string(),
    })
}

impl<C: Clock> Delegate<C> {
    /// Gets a token, from the cache or from the Host
    ///
    /// Without `params`, the configured defaults are used and the token is
    /// cached under the `DEFAULT` key.
    pub async fn get_token(&self, params: Option<AuthParams>) -> Result<Token, BrokerError> {
        let (key, params) = match params {
            Some(params) => (params.cache_key(), params),
            None => (String::from("DEFAULT"), self.config.default_params()),
        };

        if let Some(token) = self.cached(&key) {
            tracing::trace!(cache_key = %key, token.id = %token.id(), "using cached token");
            return Ok(token);
        }

        self.flights
            .run(key.clone(), || async {
                tracing::debug!(cache_key = %key, "requesting token from host");
                let grant: TokenGrant = self
                    .request(BrokerEvent::Token, to_value(&params)?)
                    .await?;

                tracing::debug!(cache_key = %key, token.id = %grant.token.id(), "received token from host");
                lock(&self.cache).insert(key.clone(), grant.token.clone());
                Ok(grant.token)
            })
            .await
    }

    fn cached(&self, key: &str) -> Option<Token> {
        let mut cache = lock(&self.cache);
        let token = cache.get(key)?;
        if token.will_be_valid_in_with_clock(self.config.token_grace_period, &self.clock) {
            return Some(token.clone());
        }

        cache.remove(key);
        cache.retain(|_, t| t.will_be_valid_in_with_clock(DurationSecs(0), &self.clock));
        tracing::trace!(cache_key = %key, remaining = cache.len(), "pruned stale tokens");
        None
    }

    /// Authorizes an outgoing request through the Host
    ///
    /// Returns a copy of `request` carrying the `Authorization` header, and
    /// the `DPoP` header when the Host signed with a DPoP token. Fails if
    /// the Host omits either header where one is required.
    pub async fn authorize(
        &self,
        request: &reqwest::Request,
    ) -> Result<reqwest::Request, BrokerError> {
        let mut authorized = request
            .try_clone()
            .ok_or_else(|| BrokerError::InvalidRequest {
                message: "request body cannot be cloned".into(),
            })?;

        let payload = AuthorizeRequest {
            params: self.config.default_params(),
            url: Some(request.url().to_string()),
            method: Some(request.method().to_string()),
        };
        let grant: AuthorizeGrant = self
            .request(BrokerEvent::Authorize, to_value(&payload)?)
            .await?;

        let authorization = header_value(&grant.authorization, "authorization")?;
        authorized.headers_mut().insert(AUTHORIZATION, authorization);

        if grant.token_type == TokenType::DPoP {
            let proof = header_value(grant.dpop.as_deref().unwrap_or_default(), "dpop")?;
            authorized.headers_mut().insert(DPOP.clone(), proof);
        }

        tracing::trace!(
            url = %request.url(),
            token_type = %grant.token_type,
            "authorized outgoing request"
        );
        Ok(authorized)
    }
}

fn header_value(value: &str, header: &'static str) -> Result<HeaderValue, BrokerError> {
    if value.is_empty() {
        return Err(BrokerError::MissingHeader { header });
    }

    let mut value = HeaderValue::from_str(value).map_err(|e| BrokerError::InvalidReply {
        message: format!("invalid `{header}` header: {e}"),
    })?;
    value.set_sensitive(true);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use serde_json::json;
    use tandem_clock::{TestClock, UnixTime};
    use tandem_sync::{
        bridge::{HandlerError, IncomingRequest},
        LocalNamespace,
    };
    use tokio::time;
    use tokio_util::sync::CancellationToken;

    use super::*;

    /// A stand-in Host answering every request with `reply`
    fn fake_host(
        namespace: &LocalNamespace,
        reply: impl Fn(&IncomingRequest) -> Value + Send + Sync + 'static,
    ) -> (TaskBridge, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let host = TaskBridge::new(
            "broker",
            namespace.actor("https://app.example"),
            BridgeConfig::default(),
        );
        let counted = calls.clone();
        let reply = Arc::new(reply);
        host.subscribe(move |request: IncomingRequest, _signal: CancellationToken| {
            counted.fetch_add(1, Ordering::SeqCst);
            let reply = reply.clone();
            async move {
                time::sleep(Duration::from_millis(10)).await;
                Ok::<_, HandlerError>(reply(&request))
            }
        });
        (host, calls)
    }

    fn delegate(namespace: &LocalNamespace, clock: &TestClock) -> Delegate<TestClock> {
        Delegate::new(
            DelegateConfig::new("broker")
                .with_client_id("widget".into())
                .with_scopes(Scopes::from_space_delimited("read")),
            namespace.actor("https://widget.example"),
        )
        .with_clock(clock.clone())
    }

    fn issuing(clock: TestClock) -> impl Fn(&IncomingRequest) -> Value + Send + Sync + 'static {
        move |_| {
            let token = Token::builder("abc", DurationSecs(120)).build_with_clock(&clock);
            json!({ "token": token })
        }
    }

    mod get_token {
        use super::*;

        #[tokio::test]
        async fn cached_token_is_reused_within_its_grace_window() {
            let namespace = LocalNamespace::new();
            let clock = TestClock::new(UnixTime(1_000));
            let (_host, calls) = fake_host(&namespace, issuing(clock.clone()));
            let delegate = delegate(&namespace, &clock);

            let first = delegate.get_token(None).await.unwrap();
            clock.advance(DurationSecs(60));
            let second = delegate.get_token(None).await.unwrap();

            assert_eq!(first, second);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn token_inside_grace_period_is_fetched_again() {
            let namespace = LocalNamespace::new();
            let clock = TestClock::new(UnixTime(1_000));
            let (_host, calls) = fake_host(&namespace, issuing(clock.clone()));
            let delegate = delegate(&namespace, &clock);

            let first = delegate.get_token(None).await.unwrap();
            clock.advance(DurationSecs(100));
            let second = delegate.get_token(None).await.unwrap();

            assert_ne!(first, second);
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn stale_entries_are_dropped_from_the_cache() {
            let namespace = LocalNamespace::new();
            let clock = TestClock::new(UnixTime(1_000));
            let (_host, _calls) = fake_host(&namespace, issuing(clock.clone()));
            let delegate = delegate(&namespace, &clock);
            let params = AuthParams {
                scopes: Scopes::from_space_delimited("write"),
                ..AuthParams::default()
            };

            delegate.get_token(None).await.unwrap();
            delegate.get_token(Some(params)).await.unwrap();
            assert_eq!(lock(&delegate.cache).len(), 2);

            clock.advance(DurationSecs(600));
            delegate.get_token(None).await.unwrap();

            let cache = lock(&delegate.cache);
            assert_eq!(cache.len(), 1);
            assert!(cache.contains_key("DEFAULT"));
        }

        #[tokio::test]
        async fn concurrent_requests_for_one_key_share_a_round_trip() {
            let namespace = LocalNamespace::new();
            let clock = TestClock::new(UnixTime(1_000));
            let (_host, calls) = fake_host(&namespace, issuing(clock.clone()));
            let delegate = delegate(&namespace, &clock);
            let params = AuthParams {
                scopes: Scopes::from_space_delimited("write"),
                ..AuthParams::default()
            };

            let (a, b, c) = tokio::join!(
                delegate.get_token(None),
                delegate.get_token(None),
                delegate.get_token(Some(params)),
            );

            assert_eq!(a.unwrap(), b.unwrap());
            assert!(c.is_ok());
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn error_reply_is_a_host_error() {
            let namespace = LocalNamespace::new();
            let clock = TestClock::default();
            let (_host, _) = fake_host(&namespace, |_| json!({ "error": "Unable to obtain token" }));
            let delegate = delegate(&namespace, &clock);

            let err = delegate.get_token(None).await.unwrap_err();

            assert_eq!(
                err,
                BrokerError::Host {
                    message: "Unable to obtain token".into()
                }
            );
        }

        #[tokio::test(start_paused = true)]
        async fn silent_host_is_a_timeout() {
            let namespace = LocalNamespace::new();
            let clock = TestClock::default();
            let delegate = Delegate::new(
                DelegateConfig::new("broker").with_request_timeout(Duration::from_secs(3)),
                namespace.actor("https://widget.example"),
            )
            .with_clock(clock);

            let err = delegate.get_token(None).await.unwrap_err();

            assert_eq!(
                err,
                BrokerError::Timeout {
                    after: Duration::from_secs(3)
                }
            );
        }
    }

    mod authorize {
        use super::*;

        fn outgoing() -> reqwest::Request {
            reqwest::Request::new(
                reqwest::Method::GET,
                "https://api.example.com/items".parse().unwrap(),
            )
        }

        #[tokio::test]
        async fn bearer_grant_sets_authorization_only() {
            let namespace = LocalNamespace::new();
            let (_host, _) = fake_host(&namespace, |request| {
                assert_eq!(request.data["url"], "https://api.example.com/items");
                assert_eq!(request.data["method"], "GET");
                json!({ "authorization": "Bearer abc", "tokenType": "Bearer" })
            });
            let delegate = delegate(&namespace, &TestClock::default());

            let authorized = delegate.authorize(&outgoing()).await.unwrap();

            assert_eq!(authorized.headers()[AUTHORIZATION], "Bearer abc");
            assert!(authorized.headers()[AUTHORIZATION].is_sensitive());
            assert!(!authorized.headers().contains_key(&DPOP));
        }

        #[tokio::test]
        async fn dpop_grant_sets_both_headers() {
            let namespace = LocalNamespace::new();
            let (_host, _) = fake_host(&namespace, |_| {
                json!({ "authorization": "DPoP abc", "dpop": "proof", "tokenType": "DPoP" })
            });
            let delegate = delegate(&namespace, &TestClock::default());

            let authorized = delegate.authorize(&outgoing()).await.unwrap();

            assert_eq!(authorized.headers()[AUTHORIZATION], "DPoP abc");
            assert_eq!(authorized.headers()[&DPOP], "proof");
        }

        #[tokio::test]
        async fn dpop_grant_without_proof_is_refused() {
            let namespace = LocalNamespace::new();
            let (_host, _) = fake_host(&namespace, |_| {
                json!({ "authorization": "DPoP abc", "dpop": "", "tokenType": "DPoP" })
            });
            let delegate = delegate(&namespace, &TestClock::default());

            let err = delegate.authorize(&outgoing()).await.unwrap_err();

            assert_eq!(err, BrokerError::MissingHeader { header: "dpop" });
        }

        #[tokio::test]
        async fn empty_authorization_is_refused() {
            let namespace = LocalNamespace::new();
            let (_host, _) = fake_host(&namespace, |_| {
                json!({ "authorization": "", "tokenType": "Bearer" })
            });
            let delegate = delegate(&namespace, &TestClock::default());

            let err = delegate.authorize(&outgoing()).await.unwrap_err();

            assert_eq!(err, BrokerError::MissingHeader { header: "authorization" });
        }
    }

    mod ping_host {
        use super::*;

        #[tokio::test]
        async fn pong_means_alive() {
            let namespace = LocalNamespace::new();
            let (_host, _) = fake_host(&namespace, |_| json!({ "message": "PONG" }));
            let delegate = delegate(&namespace, &TestClock::default());

            assert!(delegate.ping_host().await);
        }

        #[tokio::test(start_paused = true)]
        async fn silence_means_not_alive() {
            let namespace = LocalNamespace::new();
            let delegate = delegate(&namespace, &TestClock::default());

            let started = time::Instant::now();
            assert!(!delegate.ping_host().await);
            assert!(started.elapsed() >= Duration::from_secs(2));
        }
    }
}
