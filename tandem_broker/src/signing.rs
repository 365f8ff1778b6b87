//! Producing authorization headers for outgoing requests

use std::{error, fmt, sync::Arc};

use async_trait::async_trait;
use tandem_tokens::{AccessTokenRef, Token, TokenType};

/// An error while signing a request
pub type SigningError = Box<dyn error::Error + Send + Sync + 'static>;

/// The outgoing request being signed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SigningRequest<'a> {
    /// The request URL
    pub url: &'a str,
    /// The request method
    pub method: &'a str,
}

/// Headers to attach to a signed request
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SignedHeaders {
    /// The `Authorization` header value
    pub authorization: Option<String>,
    /// The `DPoP` header value
    pub dpop: Option<String>,
}

impl fmt::Debug for SignedHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedHeaders")
            .field("authorization", &self.authorization.as_ref().map(|_| "***"))
            .field("dpop", &self.dpop.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Signs requests on behalf of a token
#[async_trait]
pub trait SigningAuthority: Send + Sync {
    /// Produces the headers authorizing `request` with `token`
    async fn sign(
        &self,
        token: &Token,
        request: SigningRequest<'_>,
    ) -> Result<SignedHeaders, SigningError>;
}

#[async_trait]
impl<T: SigningAuthority + ?Sized> SigningAuthority for Arc<T> {
    async fn sign(
        &self,
        token: &Token,
        request: SigningRequest<'_>,
    ) -> Result<SignedHeaders, SigningError> {
        (**self).sign(token, request).await
    }
}

/// Creates DPoP proofs binding an access token to a single request
#[async_trait]
pub trait DpopProofSource: Send + Sync {
    /// Creates a proof for `request`, bound to `access_token`
    async fn proof(
        &self,
        request: SigningRequest<'_>,
        access_token: &AccessTokenRef,
    ) -> Result<String, SigningError>;
}

/// Signs with `Authorization: <token type> <access token>`
///
/// A DPoP token also gets a proof from the configured [`DpopProofSource`].
/// Without one, DPoP tokens are signed without a proof, which a Host
/// refuses to hand out.
#[derive(Clone, Default)]
pub struct BearerSigner {
    dpop: Option<Arc<dyn DpopProofSource>>,
}

impl fmt::Debug for BearerSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerSigner")
            .field("dpop", &self.dpop.is_some())
            .finish()
    }
}

impl BearerSigner {
    /// Constructs a signer without DPoP support
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `source` for DPoP proofs
    pub fn with_dpop<P: DpopProofSource + 'static>(mut self, source: P) -> Self {
        self.dpop = Some(Arc::new(source));
        self
    }
}

#[async_trait]
impl SigningAuthority for BearerSigner {
    async fn sign(
        &self,
        token: &Token,
        request: SigningRequest<'_>,
    ) -> Result<SignedHeaders, SigningError> {
        let authorization = Some(format!(
            "{} {}",
            token.token_type().scheme(),
            token.access_token().as_str()
        ));

        let dpop = match (token.token_type(), &self.dpop) {
            (TokenType::DPoP, Some(source)) => {
                Some(source.proof(request, token.access_token()).await?)
            }
            (TokenType::DPoP, None) => {
                tracing::debug!(token.id = %token.id(), "no DPoP proof source configured");
                None
            }
            (TokenType::Bearer, _) => None,
        };

        Ok(SignedHeaders {
            authorization,
            dpop,
        })
    }
}

#[cfg(test)]
mod tests {
    use tandem_clock::DurationSecs;

    use super::*;

    struct FixedProof;

    #[async_trait]
    impl DpopProofSource for FixedProof {
        async fn proof(
            &self,
            request: SigningRequest<'_>,
            access_token: &AccessTokenRef,
        ) -> Result<String, SigningError> {
            Ok(format!("{} {} {}", request.method, request.url, access_token.as_str()))
        }
    }

    const REQUEST: SigningRequest<'static> = SigningRequest {
        url: "https://api.example.com/items",
        method: "GET",
    };

    #[tokio::test]
    async fn bearer_token_gets_only_authorization() {
        let token = Token::builder("abc", DurationSecs(60)).build();

        let headers = BearerSigner::new().sign(&token, REQUEST).await.unwrap();

        assert_eq!(headers.authorization.as_deref(), Some("Bearer abc"));
        assert_eq!(headers.dpop, None);
    }

    mod when_token_is_dpop {
        use super::*;

        fn token() -> Token {
            Token::builder("abc", DurationSecs(60))
                .token_type(TokenType::DPoP)
                .build()
        }

        #[tokio::test]
        async fn proof_comes_from_the_source() {
            let signer = BearerSigner::new().with_dpop(FixedProof);

            let headers = signer.sign(&token(), REQUEST).await.unwrap();

            assert_eq!(headers.authorization.as_deref(), Some("DPoP abc"));
            assert_eq!(
                headers.dpop.as_deref(),
                Some("GET https://api.example.com/items abc")
            );
        }

        #[tokio::test]
        async fn no_source_means_no_proof() {
            let headers = BearerSigner::new().sign(&token(), REQUEST).await.unwrap();

            assert_eq!(headers.dpop, None);
        }
    }

    #[test]
    fn debug_hides_header_values() {
        let headers = SignedHeaders {
            authorization: Some("Bearer secret".into()),
            dpop: None,
        };

        assert!(!format!("{headers:?}").contains("secret"));
    }
}
