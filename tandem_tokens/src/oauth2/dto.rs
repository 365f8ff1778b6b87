//! Wire shapes for talking to an OAuth2 token endpoint

use serde::{Deserialize, Serialize};
use tandem_clock::DurationSecs;

use crate::{
    AccessToken, ClientIdRef, ClientSecretRef, IdToken, RefreshToken, RefreshTokenRef,
};

/// A `refresh_token` grant, optionally narrowing the requested scopes
#[derive(Debug, Serialize)]
pub struct RefreshTokenGrant<'a> {
    /// Always `refresh_token`
    pub grant_type: &'static str,
    /// The client ID
    pub client_id: &'a ClientIdRef,
    /// The client secret, if required
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<&'a ClientSecretRef>,
    /// The refresh token being exchanged
    pub refresh_token: &'a RefreshTokenRef,
    /// Space-delimited scopes to narrow to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// A revocation or introspection request for a single credential
#[derive(Debug, Serialize)]
pub struct TokenOperation<'a> {
    /// The credential being operated on
    pub token: &'a str,
    /// Which kind of credential `token` is
    pub token_type_hint: &'static str,
    /// The client ID
    pub client_id: &'a ClientIdRef,
    /// The client secret, if required
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<&'a ClientSecretRef>,
}

/// A successful token response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    /// The access token
    pub access_token: AccessToken,
    /// The token type, usually `Bearer`
    #[serde(default)]
    pub token_type: Option<String>,
    /// The lifetime of the access token
    pub expires_in: DurationSecs,
    /// A rotated refresh token
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
    /// An ID token
    #[serde(default)]
    pub id_token: Option<IdToken>,
    /// The scopes actually granted, if different from those requested
    #[serde(default)]
    pub scope: Option<String>,
}
