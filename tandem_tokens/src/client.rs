//! The contract for talking to an OAuth2 authority

use std::{error, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{Scopes, Token};

/// A structured error response from an OAuth2 authority
///
/// This is an ordinary outcome of a request, not a failure to make one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{error}{}", error_description.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
pub struct OAuth2ErrorResponse {
    /// The error code, such as `invalid_grant`
    pub error: String,
    /// A human-readable description of the error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
    /// A link to more information about the error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_uri: Option<String>,
}

impl OAuth2ErrorResponse {
    /// Constructs an error response with just an error code
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            error_description: None,
            error_uri: None,
        }
    }

    /// Adds a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.error_description = Some(description.into());
        self
    }
}

/// The outcome of a refresh that reached the authority
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum RefreshOutcome {
    /// The authority issued a new token
    Refreshed(Token),
    /// The authority refused with a structured error
    Rejected(OAuth2ErrorResponse),
}

impl RefreshOutcome {
    /// Converts into a `Result`, treating a rejection as an error
    pub fn into_result(self) -> Result<Token, OAuth2ErrorResponse> {
        match self {
            Self::Refreshed(token) => Ok(token),
            Self::Rejected(error) => Err(error),
        }
    }
}

/// A failure to obtain an answer from the authority
#[derive(Clone, Debug, Error)]
pub enum RefreshError {
    /// The token carries no refresh token
    #[error("token has no refresh token")]
    MissingRefreshToken,
    /// The request could not be sent or its response not read
    #[error("error communicating with authority")]
    Transport(#[source] Arc<dyn error::Error + Send + Sync + 'static>),
    /// The authority answered with something other than a token or an
    /// OAuth2 error
    #[error("unexpected response from authority (status {status}): {message}")]
    InvalidResponse {
        /// The HTTP status code
        status: u16,
        /// What was wrong with the response
        message: String,
    },
    /// The client does not support this operation
    #[error("{operation} is not supported by this client")]
    Unsupported {
        /// The unsupported operation
        operation: &'static str,
    },
    /// No actor produced a refresh result before the wait ran out
    #[error("timed out waiting for another context to refresh `{name}`")]
    LockUnavailable {
        /// The name the refresh was coordinated under
        name: String,
    },
    /// Another actor's refresh failed
    #[error("refresh in another context failed: {message}")]
    Coordination {
        /// The failure reported by that actor
        message: String,
    },
}

impl RefreshError {
    /// Wraps a transport error
    pub fn transport<E>(error: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        Self::Transport(Arc::new(error))
    }
}

/// Which of a token's credentials an operation applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    /// The access token
    AccessToken,
    /// The refresh token
    RefreshToken,
}

impl TokenKind {
    /// The `token_type_hint` value for this kind
    pub fn hint(self) -> &'static str {
        match self {
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
        }
    }
}

/// An OpenID provider's discovery document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenIdConfiguration {
    /// The issuer identifier
    pub issuer: String,
    /// The token endpoint
    pub token_endpoint: String,
    /// The revocation endpoint, if supported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<String>,
    /// The introspection endpoint, if supported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introspection_endpoint: Option<String>,
    /// Every other advertised field
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// A client of an OAuth2 authority
#[async_trait]
pub trait OAuth2Client: Send + Sync {
    /// Exchanges `token`'s refresh token for a new token
    ///
    /// With `scopes`, asks for a token narrowed to those scopes.
    async fn perform_refresh(
        &self,
        token: &Token,
        scopes: Option<&Scopes>,
    ) -> Result<RefreshOutcome, RefreshError>;

    /// Revokes one of `token`'s credentials
    ///
    /// Returns the authority's error response if it refused.
    async fn revoke(
        &self,
        token: &Token,
        kind: TokenKind,
    ) -> Result<Option<OAuth2ErrorResponse>, RefreshError> {
        let _ = (token, kind);
        Err(RefreshError::Unsupported {
            operation: "revocation",
        })
    }

    /// Asks the authority about one of `token`'s credentials
    async fn introspect(&self, token: &Token, kind: TokenKind) -> Result<Value, RefreshError> {
        let _ = (token, kind);
        Err(RefreshError::Unsupported {
            operation: "introspection",
        })
    }

    /// Fetches the authority's discovery document
    async fn openid_configuration(&self) -> Result<OpenIdConfiguration, RefreshError> {
        Err(RefreshError::Unsupported {
            operation: "discovery",
        })
    }
}

#[async_trait]
impl<T: OAuth2Client + ?Sized> OAuth2Client for Arc<T> {
    async fn perform_refresh(
        &self,
        token: &Token,
        scopes: Option<&Scopes>,
    ) -> Result<RefreshOutcome, RefreshError> {
        (**self).perform_refresh(token, scopes).await
    }

    async fn revoke(
        &self,
        token: &Token,
        kind: TokenKind,
    ) -> Result<Option<OAuth2ErrorResponse>, RefreshError> {
        (**self).revoke(token, kind).await
    }

    async fn introspect(&self, token: &Token, kind: TokenKind) -> Result<Value, RefreshError> {
        (**self).introspect(token, kind).await
    }

    async fn openid_configuration(&self) -> Result<OpenIdConfiguration, RefreshError> {
        (**self).openid_configuration().await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tandem_clock::DurationSecs;

    use super::*;

    #[test]
    fn error_response_displays_description() {
        let error = OAuth2ErrorResponse::new("invalid_grant").with_description("token revoked");
        assert_eq!(error.to_string(), "invalid_grant: token revoked");
        assert_eq!(OAuth2ErrorResponse::new("invalid_scope").to_string(), "invalid_scope");
    }

    #[test]
    fn rejected_outcome_round_trips_through_json() {
        let outcome = RefreshOutcome::Rejected(OAuth2ErrorResponse::new("invalid_grant"));

        let value = serde_json::to_value(&outcome).unwrap();

        assert_eq!(value, json!({ "outcome": "rejected", "error": "invalid_grant" }));
        assert_eq!(serde_json::from_value::<RefreshOutcome>(value).unwrap(), outcome);
    }

    #[test]
    fn refreshed_outcome_round_trips_through_json() {
        let token = Token::builder("access", DurationSecs(60)).build();
        let outcome = RefreshOutcome::Refreshed(token.clone());

        let value = serde_json::to_value(&outcome).unwrap();

        assert_eq!(value["outcome"], json!("refreshed"));
        assert_eq!(serde_json::from_value::<RefreshOutcome>(value).unwrap().into_result(), Ok(token));
    }
}
