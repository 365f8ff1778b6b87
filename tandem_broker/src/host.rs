//! The actor that holds credentials and answers Delegates

use std::{
    collections::BTreeSet,
    fmt, mem,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tandem_sync::{
    bridge::{HandlerError, IncomingRequest, RequestHandler},
    BridgeConfig, Channel, Subscription, TaskBridge,
};
use tandem_tokens::{Issuer, Token, TokenType};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    announcement_channel, lock, Announcement, AuthParams, AuthorizeGrant, AuthorizeRequest,
    BrokerEvent, BrokerReply, FindTokenError, HostId, HostIdRef, ProfileGrant, Pong,
    SigningAuthority, SigningRequest, TokenFinder, TokenGrant, NO_AUTHORIZATION_HEADER,
    NO_DPOP_HEADER, PONG, UNABLE_TO_FIND_ID_TOKEN, UNABLE_TO_OBTAIN_TOKEN,
};

/// Configuration for a [`Host`]
#[derive(Clone, Debug)]
pub struct HostConfig {
    name: String,
    issuer: Option<Issuer>,
    bridge: BridgeConfig,
}

impl HostConfig {
    /// A Host serving Delegates that use the broker `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            issuer: None,
            bridge: BridgeConfig::default(),
        }
    }

    /// Refuses requests naming any other issuer
    pub fn with_issuer(mut self, issuer: Issuer) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Sets the heartbeat and timeout configuration of the bridge
    pub fn with_bridge_config(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = bridge;
        self
    }

    /// The broker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The issuer restriction, if any
    pub fn issuer(&self) -> Option<&Issuer> {
        self.issuer.as_ref()
    }

    /// The bridge configuration
    pub fn bridge_config(&self) -> &BridgeConfig {
        &self.bridge
    }
}

/// Whether a Host is serving requests
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostStatus {
    /// Not serving requests
    Inactive,
    /// Serving requests
    Active,
}

/// Something that happened to a Host
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostEvent {
    /// The Host became active
    Activated {
        /// This Host's identity
        host_id: HostId,
    },
    /// Another active Host with the same name was seen
    ///
    /// Purely informational. Both Hosts stay active.
    DuplicateHost {
        /// The other Host
        peer: HostId,
    },
    /// The Host stopped serving requests
    Closed,
}

/// A change in the user's session, as seen by the embedding application
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// The user signed in
    LoggedIn,
    /// The user signed out
    LoggedOut,
    /// The session ended without an explicit sign-out
    SessionEnded,
}

enum HostState {
    Inactive,
    Active {
        bridge: TaskBridge,
        announcements: JoinHandle<()>,
    },
}

struct Presence {
    name: String,
    id: HostId,
    channel: Arc<dyn Channel>,
    peers: Mutex<BTreeSet<HostId>>,
    events: broadcast::Sender<HostEvent>,
}

impl Presence {
    fn announce(&self) {
        let announcement = Announcement {
            event_name: BrokerEvent::Activated,
            host_id: self.id.clone(),
        };
        match serde_json::to_value(&announcement) {
            Ok(message) => self
                .channel
                .publish(&announcement_channel(&self.name), message),
            Err(error) => tracing::error!(%error, "unable to serialize announcement"),
        }
    }

    fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }

    fn observe(&self, message: Value) {
        let announcement: Announcement = match serde_json::from_value(message) {
            Ok(a) => a,
            Err(error) => {
                tracing::warn!(host = %self.name, %error, "dropping malformed announcement");
                return;
            }
        };

        if announcement.event_name != BrokerEvent::Activated || announcement.host_id == self.id {
            return;
        }

        let newly_seen = lock(&self.peers).insert(announcement.host_id.clone());
        if newly_seen {
            tracing::warn!(
                host = %self.name,
                host_id = %self.id,
                peer = %announcement.host_id,
                "another host with the same name is active"
            );
            self.emit(HostEvent::DuplicateHost {
                peer: announcement.host_id,
            });
            self.announce();
        }
    }
}

async fn watch_announcements(presence: Arc<Presence>, mut announcements: Subscription) {
    while let Some(message) = announcements.recv().await {
        presence.observe(message);
    }
}

#[derive(Clone)]
struct Dispatcher {
    finder: Arc<dyn TokenFinder>,
    signer: Arc<dyn SigningAuthority>,
    issuer: Option<Issuer>,
}

#[derive(Debug, thiserror::Error)]
enum DispatchError {
    #[error("`{0}` is not a request")]
    NotARequest(BrokerEvent),
    #[error("AUTHORIZE request is missing `{0}`")]
    MissingField(&'static str),
    #[error("request cancelled")]
    Cancelled,
}

fn parse<T: DeserializeOwned + Default>(data: Value) -> Result<T, serde_json::Error> {
    if data.is_null() {
        Ok(T::default())
    } else {
        serde_json::from_value(data)
    }
}

impl Dispatcher {
    async fn dispatch(&self, event: BrokerEvent, data: Value) -> Result<Value, HandlerError> {
        let reply = match event {
            BrokerEvent::Ping => serde_json::to_value(Pong {
                message: PONG.to_owned(),
            })?,
            BrokerEvent::Token => serde_json::to_value(self.token(&parse(data)?).await)?,
            BrokerEvent::Authorize => serde_json::to_value(self.authorize(parse(data)?).await?)?,
            BrokerEvent::Profile => serde_json::to_value(self.profile(&parse(data)?).await)?,
            BrokerEvent::Activated => return Err(DispatchError::NotARequest(event).into()),
        };
        Ok(reply)
    }

    async fn find(&self, params: &AuthParams) -> Result<Token, FindTokenError> {
        if let (Some(served), Some(requested)) = (&self.issuer, &params.issuer) {
            if served != requested {
                return Err(FindTokenError::IssuerMismatch {
                    requested: requested.to_string(),
                });
            }
        }

        self.finder.find_token(params).await
    }

    async fn token(&self, params: &AuthParams) -> BrokerReply<TokenGrant> {
        match self.find(params).await {
            Ok(token) => {
                tracing::debug!(token.id = %token.id(), "handing out token");
                BrokerReply::Ok(TokenGrant { token })
            }
            Err(error) => {
                tracing::warn!(%error, "unable to obtain token");
                BrokerReply::error(UNABLE_TO_OBTAIN_TOKEN)
            }
        }
    }

    async fn authorize(
        &self,
        request: AuthorizeRequest,
    ) -> Result<BrokerReply<AuthorizeGrant>, DispatchError> {
        let url = request.url.ok_or(DispatchError::MissingField("url"))?;
        let method = request.method.ok_or(DispatchError::MissingField("method"))?;

        let token = match self.find(&request.params).await {
            Ok(token) => token,
            Err(error) => {
                tracing::warn!(%error, "unable to obtain token");
                return Ok(BrokerReply::error(UNABLE_TO_OBTAIN_TOKEN));
            }
        };

        let signing = SigningRequest {
            url: &url,
            method: &method,
        };
        let headers = match self.signer.sign(&token, signing).await {
            Ok(headers) => headers,
            Err(error) => {
                tracing::warn!(%error, token.id = %token.id(), "unable to sign request");
                return Ok(BrokerReply::error(format!("Unable to sign request: {error}")));
            }
        };

        let Some(authorization) = headers.authorization.filter(|h| !h.is_empty()) else {
            return Ok(BrokerReply::error(NO_AUTHORIZATION_HEADER));
        };

        let dpop = match token.token_type() {
            TokenType::DPoP => match headers.dpop.filter(|h| !h.is_empty()) {
                Some(dpop) => Some(dpop),
                None => return Ok(BrokerReply::error(NO_DPOP_HEADER)),
            },
            TokenType::Bearer => None,
        };

        Ok(BrokerReply::Ok(AuthorizeGrant {
            authorization,
            dpop,
            token_type: token.token_type(),
        }))
    }

    async fn profile(&self, params: &AuthParams) -> BrokerReply<ProfileGrant> {
        let id_token = match self.finder.find_id_token(params).await {
            Ok(Some(id_token)) => id_token,
            Ok(None) => return BrokerReply::error(UNABLE_TO_FIND_ID_TOKEN),
            Err(error) => {
                tracing::warn!(%error, "unable to find identity token");
                return BrokerReply::error(UNABLE_TO_FIND_ID_TOKEN);
            }
        };

        match id_token.claims() {
            Ok(claims) => BrokerReply::Ok(ProfileGrant { claims }),
            Err(error) => {
                tracing::warn!(%error, "unable to read identity token");
                BrokerReply::error(UNABLE_TO_FIND_ID_TOKEN)
            }
        }
    }
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(
        &self,
        request: IncomingRequest,
        signal: CancellationToken,
    ) -> Result<Value, HandlerError> {
        let event: BrokerEvent = request.event_name.parse()?;
        tracing::trace!(request_id = %request.request_id, %event, "dispatching broker request");

        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(DispatchError::Cancelled.into()),
            reply = self.dispatch(event, request.data) => reply,
        }
    }
}

struct HostInner {
    config: HostConfig,
    dispatcher: Dispatcher,
    presence: Arc<Presence>,
    state: Mutex<HostState>,
}

impl HostInner {
    fn close(&self) {
        let previous = mem::replace(&mut *lock(&self.state), HostState::Inactive);
        if let HostState::Active {
            bridge,
            announcements,
        } = previous
        {
            announcements.abort();
            bridge.close();
            lock(&self.presence.peers).clear();
            tracing::info!(host = %self.config.name, host_id = %self.presence.id, "host closed");
            self.presence.emit(HostEvent::Closed);
        }
    }
}

/// Serves tokens to Delegates over a [`TaskBridge`]
///
/// A Host starts out inactive. Once [activated](Self::activate), it answers
/// `PING`, `TOKEN`, `AUTHORIZE` and `PROFILE` requests until
/// [closed](Self::close) or dropped, resolving tokens with its
/// [`TokenFinder`] and signing with its [`SigningAuthority`].
///
/// Nothing stops two Hosts with the same name from being active at once.
/// Each one announces itself when activated, and a Host that sees another
/// reports a [`HostEvent::DuplicateHost`].
pub struct Host {
    inner: Arc<HostInner>,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.inner.config.name)
            .field("id", &self.inner.presence.id)
            .field("status", &self.status())
            .finish()
    }
}

impl Host {
    /// Constructs an inactive Host
    pub fn new<Ch, F, S>(config: HostConfig, channel: Ch, finder: F, signer: S) -> Self
    where
        Ch: Channel + 'static,
        F: TokenFinder + 'static,
        S: SigningAuthority + 'static,
    {
        let (events, _) = broadcast::channel(16);
        let presence = Arc::new(Presence {
            name: config.name.clone(),
            id: HostId::generate(),
            channel: Arc::new(channel),
            peers: Mutex::new(BTreeSet::new()),
            events,
        });
        let dispatcher = Dispatcher {
            finder: Arc::new(finder),
            signer: Arc::new(signer),
            issuer: config.issuer.clone(),
        };

        Self {
            inner: Arc::new(HostInner {
                config,
                dispatcher,
                presence,
                state: Mutex::new(HostState::Inactive),
            }),
        }
    }

    /// This Host's identity
    pub fn id(&self) -> &HostIdRef {
        &self.inner.presence.id
    }

    /// The Host's configuration
    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    /// Whether the Host is serving requests
    pub fn status(&self) -> HostStatus {
        match *lock(&self.inner.state) {
            HostState::Inactive => HostStatus::Inactive,
            HostState::Active { .. } => HostStatus::Active,
        }
    }

    /// Other active Hosts with the same name seen since activation
    pub fn known_peers(&self) -> Vec<HostId> {
        lock(&self.inner.presence.peers).iter().cloned().collect()
    }

    /// Subscribes to this Host's events
    pub fn events(&self) -> broadcast::Receiver<HostEvent> {
        self.inner.presence.events.subscribe()
    }

    /// Starts serving requests and announces this Host
    ///
    /// Does nothing if already active. Must be called from within a Tokio
    /// runtime.
    pub fn activate(&self) {
        let inner = &self.inner;
        {
            let mut state = lock(&inner.state);
            if let HostState::Active { .. } = *state {
                tracing::debug!(host = %inner.config.name, "host already active");
                return;
            }

            let bridge = TaskBridge::new(
                inner.config.name.clone(),
                inner.presence.channel.clone(),
                inner.config.bridge,
            );
            bridge.subscribe(inner.dispatcher.clone());

            let announcements = inner
                .presence
                .channel
                .subscribe(&announcement_channel(&inner.config.name));
            let announcements = tokio::spawn(watch_announcements(
                inner.presence.clone(),
                announcements,
            ));

            *state = HostState::Active {
                bridge,
                announcements,
            };
        }

        inner.presence.announce();
        tracing::info!(host = %inner.config.name, host_id = %inner.presence.id, "host activated");
        inner.presence.emit(HostEvent::Activated {
            host_id: inner.presence.id.clone(),
        });
    }

    /// Stops serving requests
    ///
    /// Requests being handled are cancelled. Does nothing if not active.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Closes this Host when the session ends
    ///
    /// Watches `sessions` until a [`SessionEvent::LoggedOut`] or
    /// [`SessionEvent::SessionEnded`] arrives, or the sender goes away.
    pub fn close_on_logout(
        &self,
        mut sessions: broadcast::Receiver<SessionEvent>,
    ) -> JoinHandle<()> {
        let host = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                match sessions.recv().await {
                    Ok(SessionEvent::LoggedOut | SessionEvent::SessionEnded) => {
                        if let Some(host) = host.upgrade() {
                            tracing::info!(host = %host.config.name, "session ended, closing host");
                            host.close();
                        }
                        break;
                    }
                    Ok(SessionEvent::LoggedIn) => {}
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "missed session events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.inner.close();
    }
}
