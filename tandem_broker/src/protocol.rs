//! The vocabulary spoken between a Host and its Delegates
//!
//! Every broker request travels as a bridge request whose event name is one
//! of the [`BrokerEvent`]s. Replies are plain JSON objects: either the
//! payload for that event, or `{ "error": "..." }`.

use std::{fmt, str::FromStr};

use aliri_braid::braid;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tandem_tokens::{ClientId, Issuer, Scopes, Token, TokenType};

/// The error replied when no token could be found
pub const UNABLE_TO_OBTAIN_TOKEN: &str = "Unable to obtain token";
/// The error replied when the signer produced no `authorization` header
pub const NO_AUTHORIZATION_HEADER: &str = "No Authorization header received";
/// The error replied when a DPoP token was signed without a proof
pub const NO_DPOP_HEADER: &str = "No DPoP header received when expected";
/// The error replied when no identity token is available
pub const UNABLE_TO_FIND_ID_TOKEN: &str = "Unable to find idToken";

/// The reply to a `PING`
pub const PONG: &str = "PONG";

/// The fixed set of broker event names
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerEvent {
    /// A liveness probe
    Ping,
    /// A request for a token
    Token,
    /// A request for authorization headers for an outgoing HTTP request
    Authorize,
    /// A request for the claims of the current identity
    Profile,
    /// A Host announcing that it has become active
    Activated,
}

impl BrokerEvent {
    /// The event name as it appears on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Token => "TOKEN",
            Self::Authorize => "AUTHORIZE",
            Self::Profile => "PROFILE",
            Self::Activated => "ACTIVATED",
        }
    }
}

impl fmt::Display for BrokerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unrecognized broker event name
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown broker event `{0}`")]
pub struct UnknownEvent(pub String);

impl FromStr for BrokerEvent {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PING" => Ok(Self::Ping),
            "TOKEN" => Ok(Self::Token),
            "AUTHORIZE" => Ok(Self::Authorize),
            "PROFILE" => Ok(Self::Profile),
            "ACTIVATED" => Ok(Self::Activated),
            other => Err(UnknownEvent(other.to_owned())),
        }
    }
}

/// The identity of one active Host
#[braid(serde)]
pub struct HostId;

impl HostId {
    /// Generates a fresh random identifier
    pub fn generate() -> Self {
        Self::new(format!("{:016x}", rand::random::<u64>()))
    }
}

/// What a Delegate is asking for
///
/// Every field is optional; a Host fills gaps from its own defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthParams {
    /// The issuer the token must come from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<Issuer>,
    /// The client the token is for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    /// The scopes the token must carry
    #[serde(default, skip_serializing_if = "Scopes::is_empty")]
    pub scopes: Scopes,
}

impl AuthParams {
    /// The key under which a token for these parameters is cached
    ///
    /// Parameters naming neither a client nor any scopes share the
    /// `DEFAULT` key.
    pub fn cache_key(&self) -> String {
        match (&self.client_id, self.scopes.is_empty()) {
            (None, true) => String::from("DEFAULT"),
            (client_id, _) => format!(
                "{}:{}",
                client_id.as_ref().map(|c| c.as_str()).unwrap_or_default(),
                self.scopes.to_space_delimited()
            ),
        }
    }
}

/// The payload of an `AUTHORIZE` request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    /// Which token to authorize with
    #[serde(flatten)]
    pub params: AuthParams,
    /// The URL of the outgoing request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// The method of the outgoing request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// A reply that is either a payload or an error message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BrokerReply<T> {
    /// The Host could not satisfy the request
    Error {
        /// Why not
        error: String,
    },
    /// The Host satisfied the request
    Ok(T),
}

impl<T> BrokerReply<T> {
    /// An error reply
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    /// Converts into a `Result`, with the error message as the error
    pub fn into_result(self) -> Result<T, String> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Error { error } => Err(error),
        }
    }
}

/// The payload of a `TOKEN` reply
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    /// The token
    pub token: Token,
}

/// The payload of an `AUTHORIZE` reply
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeGrant {
    /// The value for the `Authorization` header
    pub authorization: String,
    /// The value for the `DPoP` header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpop: Option<String>,
    /// The type of the token used
    pub token_type: TokenType,
}

/// The payload of a `PROFILE` reply
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileGrant {
    /// The identity token's claims
    pub claims: Map<String, Value>,
}

/// The payload of a `PING` reply
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Always `PONG`
    pub message: String,
}

/// A Host announcing itself on the announcement channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    /// Always [`BrokerEvent::Activated`]
    pub event_name: BrokerEvent,
    /// The announcing Host
    pub host_id: HostId,
}

/// The channel on which Hosts named `name` announce themselves
pub fn announcement_channel(name: &str) -> String {
    format!("{name}:hosts")
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tandem_clock::DurationSecs;

    use super::*;

    #[test]
    fn event_names_round_trip() {
        for event in [
            BrokerEvent::Ping,
            BrokerEvent::Token,
            BrokerEvent::Authorize,
            BrokerEvent::Profile,
            BrokerEvent::Activated,
        ] {
            assert_eq!(event.as_str().parse::<BrokerEvent>().unwrap(), event);
            assert_eq!(serde_json::to_value(event).unwrap(), json!(event.as_str()));
        }
        assert!("token".parse::<BrokerEvent>().is_err());
    }

    mod cache_key {
        use super::*;

        #[test]
        fn is_default_without_client_or_scopes() {
            assert_eq!(AuthParams::default().cache_key(), "DEFAULT");
        }

        #[test]
        fn sorts_scopes() {
            let params = AuthParams {
                client_id: Some(ClientId::from_static("spa")),
                scopes: Scopes::from_space_delimited("profile openid"),
                ..AuthParams::default()
            };

            assert_eq!(params.cache_key(), "spa:openid profile");
        }
    }

    #[test]
    fn authorize_request_flattens_params() {
        let request: AuthorizeRequest = serde_json::from_value(json!({
            "clientId": "spa",
            "scopes": ["read"],
            "url": "https://api.example.com/items",
            "method": "GET",
        }))
        .unwrap();

        assert_eq!(request.params.client_id.as_deref().map(|c| c.as_str()), Some("spa"));
        assert_eq!(request.method.as_deref(), Some("GET"));
    }

    mod broker_reply {
        use super::*;

        #[test]
        fn error_shape_is_recognized() {
            let reply: BrokerReply<TokenGrant> =
                serde_json::from_value(json!({ "error": UNABLE_TO_OBTAIN_TOKEN })).unwrap();

            assert_eq!(reply.into_result(), Err(UNABLE_TO_OBTAIN_TOKEN.to_owned()));
        }

        #[test]
        fn token_shape_is_recognized() {
            let token = Token::builder("access", DurationSecs(60)).build();
            let value = serde_json::to_value(BrokerReply::Ok(TokenGrant {
                token: token.clone(),
            }))
            .unwrap();

            assert_eq!(value, json!({ "token": token }));
            let reply: BrokerReply<TokenGrant> = serde_json::from_value(value).unwrap();
            assert_eq!(reply.into_result().unwrap().token, token);
        }
    }
}
