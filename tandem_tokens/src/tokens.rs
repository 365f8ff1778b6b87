use std::fmt;

use serde::{Deserialize, Serialize};
use tandem_clock::{Clock, DurationSecs, System, UnixTime};

use crate::{
    AccessToken, AccessTokenRef, IdToken, IdTokenRef, RefreshToken, RefreshTokenRef, Scopes,
    TokenId, TokenIdRef,
};

/// How a token is presented to a resource server
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenType {
    /// A plain bearer token
    #[default]
    Bearer,
    /// A sender-constrained token requiring a per-request proof
    #[serde(rename = "DPoP")]
    DPoP,
}

impl TokenType {
    /// The authorization scheme for this token type
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Bearer => "Bearer",
            Self::DPoP => "DPoP",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// An issued set of OAuth2 tokens
///
/// Tokens are never changed after they are built; a refresh yields a new
/// token with a new [`id()`][Self::id].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    id: TokenId,
    access_token: AccessToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<RefreshToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id_token: Option<IdToken>,
    #[serde(default)]
    token_type: TokenType,
    #[serde(default)]
    scopes: Scopes,
    issued_at: UnixTime,
    expires_in: DurationSecs,
}

impl Token {
    /// Starts building a token valid for `expires_in`
    pub fn builder(access_token: impl Into<AccessToken>, expires_in: DurationSecs) -> TokenBuilder {
        TokenBuilder {
            access_token: access_token.into(),
            expires_in,
            refresh_token: None,
            id_token: None,
            token_type: TokenType::Bearer,
            scopes: Scopes::new(),
            issued_at: None,
        }
    }

    /// The token's unique identifier
    #[inline]
    pub fn id(&self) -> &TokenIdRef {
        &self.id
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the refresh token, if one was issued
    #[inline]
    pub fn refresh_token(&self) -> Option<&RefreshTokenRef> {
        self.refresh_token.as_deref()
    }

    /// Gets the ID token, if one was issued
    #[inline]
    pub fn id_token(&self) -> Option<&IdTokenRef> {
        self.id_token.as_deref()
    }

    /// Gets the token type
    #[inline]
    pub fn token_type(&self) -> TokenType {
        self.token_type
    }

    /// Gets the scopes granted to the access token
    #[inline]
    pub fn scopes(&self) -> &Scopes {
        &self.scopes
    }

    /// Gets the time the token was issued
    #[inline]
    pub fn issued_at(&self) -> UnixTime {
        self.issued_at
    }

    /// Gets how long the token is valid after issuance
    #[inline]
    pub fn expires_in(&self) -> DurationSecs {
        self.expires_in
    }

    /// Gets the time the token expires
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.issued_at + self.expires_in
    }

    /// Whether the token has expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(System.now())
    }

    /// Whether the token has expired according to the provided clock
    #[inline]
    pub fn is_expired_with_clock<C: Clock>(&self, clock: &C) -> bool {
        self.is_expired_at(clock.now())
    }

    /// Whether the token is expired as of the provided time
    #[inline]
    pub fn is_expired_at(&self, time: UnixTime) -> bool {
        time >= self.expiry()
    }

    /// Whether the token will have expired `within` from now
    #[inline]
    pub fn will_be_expired_in(&self, within: DurationSecs) -> bool {
        self.is_expired_at(System.now() + within)
    }

    /// Whether the token will have expired `within` from now according to the
    /// provided clock
    #[inline]
    pub fn will_be_expired_in_with_clock<C: Clock>(&self, within: DurationSecs, clock: &C) -> bool {
        self.is_expired_at(clock.now() + within)
    }

    /// Whether the token will still be valid `within` from now
    #[inline]
    pub fn will_be_valid_in(&self, within: DurationSecs) -> bool {
        !self.will_be_expired_in(within)
    }

    /// Whether the token will still be valid `within` from now according to
    /// the provided clock
    #[inline]
    pub fn will_be_valid_in_with_clock<C: Clock>(&self, within: DurationSecs, clock: &C) -> bool {
        !self.will_be_expired_in_with_clock(within, clock)
    }

    /// Gets a duration for how much longer the token will be valid as of the
    /// provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        self.expiry() - time
    }
}

/// Builds a [`Token`]
#[derive(Debug)]
#[must_use]
pub struct TokenBuilder {
    access_token: AccessToken,
    expires_in: DurationSecs,
    refresh_token: Option<RefreshToken>,
    id_token: Option<IdToken>,
    token_type: TokenType,
    scopes: Scopes,
    issued_at: Option<UnixTime>,
}

impl TokenBuilder {
    /// Attaches a refresh token
    pub fn refresh_token(mut self, refresh_token: impl Into<RefreshToken>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Attaches an ID token
    pub fn id_token(mut self, id_token: impl Into<IdToken>) -> Self {
        self.id_token = Some(id_token.into());
        self
    }

    /// Sets the token type
    pub fn token_type(mut self, token_type: TokenType) -> Self {
        self.token_type = token_type;
        self
    }

    /// Sets the granted scopes
    pub fn scopes(mut self, scopes: Scopes) -> Self {
        self.scopes = scopes;
        self
    }

    /// Sets the issuance time instead of using the current time
    pub fn issued_at(mut self, issued_at: UnixTime) -> Self {
        self.issued_at = Some(issued_at);
        self
    }

    /// Builds the token, issued now unless set otherwise
    pub fn build(self) -> Token {
        self.build_with_clock(&System)
    }

    /// Builds the token, issued as of the provided clock unless set otherwise
    pub fn build_with_clock<C: Clock>(self, clock: &C) -> Token {
        Token {
            id: TokenId::generate(),
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            id_token: self.id_token,
            token_type: self.token_type,
            scopes: self.scopes,
            issued_at: self.issued_at.unwrap_or_else(|| clock.now()),
            expires_in: self.expires_in,
        }
    }
}
