//! An [`OAuth2Client`] that talks to an authority over HTTP

use async_trait::async_trait;
use serde_json::Value;
use tandem_clock::{Clock, System};

use crate::{
    ClientId, ClientSecret, OAuth2Client, OAuth2ErrorResponse, OpenIdConfiguration,
    RefreshError, RefreshOutcome, Scopes, Token, TokenKind, TokenType,
};

pub mod dto;

/// Performs refresh grants against an authority's token endpoint
#[derive(Debug, Clone)]
pub struct HttpOAuth2Client<C = System> {
    client: reqwest::Client,
    client_id: ClientId,
    client_secret: Option<ClientSecret>,
    token_url: reqwest::Url,
    revocation_url: Option<reqwest::Url>,
    introspection_url: Option<reqwest::Url>,
    discovery: Option<OpenIdConfiguration>,
    clock: C,
}

impl HttpOAuth2Client<System> {
    /// Constructs a client for the given token endpoint
    pub fn new(client: reqwest::Client, token_url: reqwest::Url, client_id: ClientId) -> Self {
        Self {
            client,
            client_id,
            client_secret: None,
            token_url,
            revocation_url: None,
            introspection_url: None,
            discovery: None,
            clock: System,
        }
    }

    /// Constructs a client from the issuer's discovery document
    ///
    /// Fetches `{issuer}/.well-known/openid-configuration` and uses the
    /// endpoints it advertises.
    #[tracing::instrument(err, skip(client), fields(issuer = %issuer))]
    pub async fn discover(
        client: reqwest::Client,
        issuer: reqwest::Url,
        client_id: ClientId,
    ) -> Result<Self, RefreshError> {
        let mut url = issuer;
        url.path_segments_mut()
            .map_err(|()| RefreshError::InvalidResponse {
                status: 0,
                message: "issuer cannot be a base URL".into(),
            })?
            .pop_if_empty()
            .extend([".well-known", "openid-configuration"]);

        let resp = client
            .get(url)
            .send()
            .await
            .map_err(RefreshError::transport)?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(RefreshError::transport)?;

        if !(200..300).contains(&status) {
            return Err(RefreshError::InvalidResponse {
                status,
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let config: OpenIdConfiguration =
            serde_json::from_slice(&body).map_err(|e| RefreshError::InvalidResponse {
                status,
                message: e.to_string(),
            })?;

        let token_url = parse_endpoint(&config.token_endpoint)?;
        let revocation_url = config
            .revocation_endpoint
            .as_deref()
            .map(parse_endpoint)
            .transpose()?;
        let introspection_url = config
            .introspection_endpoint
            .as_deref()
            .map(parse_endpoint)
            .transpose()?;

        tracing::debug!(token_url = %token_url, "discovered authority endpoints");

        Ok(Self {
            client,
            client_id,
            client_secret: None,
            token_url,
            revocation_url,
            introspection_url,
            discovery: Some(config),
            clock: System,
        })
    }
}

fn parse_endpoint(endpoint: &str) -> Result<reqwest::Url, RefreshError> {
    reqwest::Url::parse(endpoint).map_err(|e| RefreshError::InvalidResponse {
        status: 0,
        message: format!("invalid endpoint `{endpoint}`: {e}"),
    })
}

impl<C> HttpOAuth2Client<C> {
    /// Sends a client secret with every request
    pub fn with_client_secret(mut self, client_secret: ClientSecret) -> Self {
        self.client_secret = Some(client_secret);
        self
    }

    /// Sets the revocation endpoint
    pub fn with_revocation_url(mut self, url: reqwest::Url) -> Self {
        self.revocation_url = Some(url);
        self
    }

    /// Sets the introspection endpoint
    pub fn with_introspection_url(mut self, url: reqwest::Url) -> Self {
        self.introspection_url = Some(url);
        self
    }

    /// Stamps issued tokens using a different clock
    pub fn with_clock<D>(self, clock: D) -> HttpOAuth2Client<D> {
        HttpOAuth2Client {
            client: self.client,
            client_id: self.client_id,
            client_secret: self.client_secret,
            token_url: self.token_url,
            revocation_url: self.revocation_url,
            introspection_url: self.introspection_url,
            discovery: self.discovery,
            clock,
        }
    }

    async fn post_form<S: serde::Serialize>(
        &self,
        url: reqwest::Url,
        form: &S,
    ) -> Result<(u16, Vec<u8>), RefreshError> {
        let resp = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(RefreshError::transport)?;
        let status = resp.status().as_u16();

        tracing::debug!(
            response.status = status,
            "received response from issuing authority"
        );

        let body = resp.bytes().await.map_err(RefreshError::transport)?;
        Ok((status, body.to_vec()))
    }
}

#[async_trait]
impl<C: Clock + Send + Sync> OAuth2Client for HttpOAuth2Client<C> {
    #[tracing::instrument(
        err,
        skip_all,
        fields(
            token_url = %self.token_url,
            client_id = %self.client_id,
            token.id = %token.id(),
            scopes = %scopes.map(|s| s.to_space_delimited()).unwrap_or_default(),
        ),
    )]
    async fn perform_refresh(
        &self,
        token: &Token,
        scopes: Option<&Scopes>,
    ) -> Result<RefreshOutcome, RefreshError> {
        let refresh_token = token
            .refresh_token()
            .ok_or(RefreshError::MissingRefreshToken)?;

        tracing::trace!("requesting token from authority");

        let grant = dto::RefreshTokenGrant {
            grant_type: "refresh_token",
            client_id: &self.client_id,
            client_secret: self.client_secret.as_deref(),
            refresh_token,
            scope: scopes.map(Scopes::to_space_delimited),
        };

        let (status, body) = self.post_form(self.token_url.clone(), &grant).await?;
        interpret_token_response(status, &body, token, scopes, &self.clock)
    }

    async fn revoke(
        &self,
        token: &Token,
        kind: TokenKind,
    ) -> Result<Option<OAuth2ErrorResponse>, RefreshError> {
        let url = self
            .revocation_url
            .clone()
            .ok_or(RefreshError::Unsupported {
                operation: "revocation",
            })?;
        let Some(credential) = credential_of(token, kind) else {
            return Err(RefreshError::MissingRefreshToken);
        };

        let (status, body) = self
            .post_form(
                url,
                &dto::TokenOperation {
                    token: credential,
                    token_type_hint: kind.hint(),
                    client_id: &self.client_id,
                    client_secret: self.client_secret.as_deref(),
                },
            )
            .await?;

        if (200..300).contains(&status) {
            tracing::info!(token.id = %token.id(), "revoked token");
            return Ok(None);
        }

        parse_error_response(status, &body).map(Some)
    }

    async fn introspect(&self, token: &Token, kind: TokenKind) -> Result<Value, RefreshError> {
        let url = self
            .introspection_url
            .clone()
            .ok_or(RefreshError::Unsupported {
                operation: "introspection",
            })?;
        let Some(credential) = credential_of(token, kind) else {
            return Err(RefreshError::MissingRefreshToken);
        };

        let (status, body) = self
            .post_form(
                url,
                &dto::TokenOperation {
                    token: credential,
                    token_type_hint: kind.hint(),
                    client_id: &self.client_id,
                    client_secret: self.client_secret.as_deref(),
                },
            )
            .await?;

        if !(200..300).contains(&status) {
            return Err(RefreshError::InvalidResponse {
                status,
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        serde_json::from_slice(&body).map_err(|e| RefreshError::InvalidResponse {
            status,
            message: e.to_string(),
        })
    }

    async fn openid_configuration(&self) -> Result<OpenIdConfiguration, RefreshError> {
        self.discovery.clone().ok_or(RefreshError::Unsupported {
            operation: "discovery",
        })
    }
}

fn credential_of(token: &Token, kind: TokenKind) -> Option<&str> {
    match kind {
        TokenKind::AccessToken => Some(token.access_token().as_str()),
        TokenKind::RefreshToken => token.refresh_token().map(|rt| rt.as_str()),
    }
}

fn parse_error_response(status: u16, body: &[u8]) -> Result<OAuth2ErrorResponse, RefreshError> {
    serde_json::from_slice::<OAuth2ErrorResponse>(body).map_err(|_| {
        RefreshError::InvalidResponse {
            status,
            message: String::from_utf8_lossy(body).into_owned(),
        }
    })
}

/// Turns a token endpoint response into a refresh outcome
///
/// A successful response yields a new token that keeps `previous`'s
/// refresh token unless the authority rotated it. Granted scopes default
/// to those requested, then to `previous`'s. An error body carrying an
/// `error` code becomes a rejection; anything else is an invalid response.
pub fn interpret_token_response<C: Clock>(
    status: u16,
    body: &[u8],
    previous: &Token,
    requested: Option<&Scopes>,
    clock: &C,
) -> Result<RefreshOutcome, RefreshError> {
    if !(200..300).contains(&status) {
        let error = parse_error_response(status, body)?;
        tracing::warn!(
            response.status = status,
            error = %error,
            "authority rejected refresh"
        );
        return Ok(RefreshOutcome::Rejected(error));
    }

    let resp: dto::TokenResponse =
        serde_json::from_slice(body).map_err(|e| RefreshError::InvalidResponse {
            status,
            message: e.to_string(),
        })?;

    let token_type = match resp.token_type.as_deref() {
        Some(t) if t.eq_ignore_ascii_case("dpop") => TokenType::DPoP,
        _ => TokenType::Bearer,
    };

    let scopes = match (&resp.scope, requested) {
        (Some(granted), _) => Scopes::from_space_delimited(granted),
        (None, Some(requested)) => requested.clone(),
        (None, None) => previous.scopes().clone(),
    };

    let rotated = resp.refresh_token.is_some();
    let refresh_token = resp
        .refresh_token
        .or_else(|| previous.refresh_token().map(ToOwned::to_owned));

    let mut builder = Token::builder(resp.access_token, resp.expires_in)
        .token_type(token_type)
        .scopes(scopes);
    if let Some(rt) = refresh_token {
        builder = builder.refresh_token(rt);
    }
    if let Some(id) = resp.id_token {
        builder = builder.id_token(id);
    }
    let token = builder.build_with_clock(clock);

    tracing::info!(
        token.id = %token.id(),
        has_id_token = token.id_token().is_some(),
        rotated_refresh_token = rotated,
        lifetime = token.expires_in().0,
        expiry = token.expiry().0,
        "received new tokens"
    );

    Ok(RefreshOutcome::Refreshed(token))
}

#[cfg(test)]
mod tests {
    use tandem_clock::{DurationSecs, TestClock, UnixTime};

    use super::*;

    fn previous() -> Token {
        Token::builder("old-access", DurationSecs(60))
            .refresh_token("old-refresh")
            .scopes(Scopes::from_space_delimited("openid profile email"))
            .build()
    }

    mod when_authority_succeeds {
        use super::*;

        #[test]
        fn builds_token_stamped_with_clock() {
            let clock = TestClock::new(UnixTime(1_000));
            let body = br#"{"access_token":"new","token_type":"Bearer","expires_in":300}"#;

            let outcome = interpret_token_response(200, body, &previous(), None, &clock).unwrap();

            let RefreshOutcome::Refreshed(token) = outcome else {
                panic!("expected a token");
            };
            assert_eq!(token.access_token().as_str(), "new");
            assert_eq!(token.issued_at(), UnixTime(1_000));
            assert_eq!(token.expiry(), UnixTime(1_300));
            assert_eq!(token.token_type(), TokenType::Bearer);
        }

        #[test]
        fn keeps_previous_refresh_token_unless_rotated() {
            let clock = TestClock::new(UnixTime(0));
            let kept = br#"{"access_token":"a","expires_in":300}"#;
            let rotated = br#"{"access_token":"a","expires_in":300,"refresh_token":"fresh"}"#;

            let kept = interpret_token_response(200, kept, &previous(), None, &clock)
                .unwrap()
                .into_result()
                .unwrap();
            let rotated = interpret_token_response(200, rotated, &previous(), None, &clock)
                .unwrap()
                .into_result()
                .unwrap();

            assert_eq!(kept.refresh_token().unwrap().as_str(), "old-refresh");
            assert_eq!(rotated.refresh_token().unwrap().as_str(), "fresh");
        }

        #[test]
        fn scopes_default_to_requested_then_previous() {
            let clock = TestClock::new(UnixTime(0));
            let body = br#"{"access_token":"a","expires_in":300}"#;
            let requested = Scopes::from_space_delimited("openid");

            let narrowed =
                interpret_token_response(200, body, &previous(), Some(&requested), &clock)
                    .unwrap()
                    .into_result()
                    .unwrap();
            let unchanged = interpret_token_response(200, body, &previous(), None, &clock)
                .unwrap()
                .into_result()
                .unwrap();

            assert_eq!(narrowed.scopes(), &requested);
            assert_eq!(unchanged.scopes(), previous().scopes());
        }

        #[test]
        fn granted_scope_wins_over_requested() {
            let clock = TestClock::new(UnixTime(0));
            let body = br#"{"access_token":"a","expires_in":300,"scope":"openid email"}"#;
            let requested = Scopes::from_space_delimited("openid");

            let token = interpret_token_response(200, body, &previous(), Some(&requested), &clock)
                .unwrap()
                .into_result()
                .unwrap();

            assert_eq!(token.scopes(), &Scopes::from_space_delimited("email openid"));
        }

        #[test]
        fn recognizes_dpop_token_type() {
            let clock = TestClock::new(UnixTime(0));
            let body = br#"{"access_token":"a","token_type":"DPoP","expires_in":300}"#;

            let token = interpret_token_response(200, body, &previous(), None, &clock)
                .unwrap()
                .into_result()
                .unwrap();

            assert_eq!(token.token_type(), TokenType::DPoP);
        }
    }

    mod when_authority_fails {
        use super::*;

        #[test]
        fn oauth2_error_body_is_a_rejection() {
            let clock = TestClock::new(UnixTime(0));
            let body = br#"{"error":"invalid_grant","error_description":"expired"}"#;

            let outcome = interpret_token_response(400, body, &previous(), None, &clock).unwrap();

            assert_eq!(
                outcome,
                RefreshOutcome::Rejected(
                    OAuth2ErrorResponse::new("invalid_grant").with_description("expired")
                )
            );
        }

        #[test]
        fn unstructured_error_body_is_invalid() {
            let clock = TestClock::new(UnixTime(0));

            let err = interpret_token_response(502, b"bad gateway", &previous(), None, &clock)
                .unwrap_err();

            assert!(matches!(err, RefreshError::InvalidResponse { status: 502, .. }));
        }

        #[test]
        fn malformed_success_body_is_invalid() {
            let clock = TestClock::new(UnixTime(0));

            let err = interpret_token_response(200, b"{}", &previous(), None, &clock).unwrap_err();

            assert!(matches!(err, RefreshError::InvalidResponse { status: 200, .. }));
        }
    }
}
