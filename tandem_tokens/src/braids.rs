use std::fmt;

use aliri_braid::braid;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde_json::{Map, Value};
use thiserror::Error;

macro_rules! limited_reveal {
    ($ty:ty: $hidden:literal, $default:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    limited_reveal(&self.0, &mut *f, $default)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    limited_reveal(&self.0, &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }
    };
}

fn limited_reveal(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        f.write_str("…")
    } else if max_len > unprotected.len() {
        f.write_str(unprotected)
    } else {
        match unprotected.char_indices().nth(max_len - 2) {
            Some((idx, c)) if idx + c.len_utf8() < unprotected.len() => {
                f.write_str(&unprotected[0..idx + c.len_utf8()])?;
                f.write_str("…")
            }
            _ => f.write_str(unprotected),
        }
    }
}

/// The identifier of one token, assigned once when the token is created
#[braid(serde)]
pub struct TokenId;

impl TokenId {
    /// Generates a fresh random identifier
    ///
    /// 128 random bits make a collision between concurrently created tokens
    /// negligible.
    pub fn generate() -> Self {
        Self::new(format!("{:032x}", rand::random::<u128>()))
    }
}

/// A client ID
#[braid(serde)]
pub struct ClientId;

/// An issuer, the base URL of an authorization server
#[braid(serde)]
pub struct Issuer;

/// A client secret
#[braid(serde, debug = "owned", display = "owned")]
pub struct ClientSecret;

limited_reveal!(ClientSecretRef: "CLIENT SECRET", 5);

/// An access token
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

limited_reveal!(AccessTokenRef: "ACCESS TOKEN", 15);

/// An OpenID Connect ID token
#[braid(serde)]
pub struct IdToken;

/// A refresh token
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshToken;

limited_reveal!(RefreshTokenRef: "REFRESH TOKEN", 5);

/// The claims of an ID token could not be read
#[derive(Debug, Error)]
pub enum ClaimsError {
    /// The token is not three dot-separated segments
    #[error("ID token is not a compact JWT")]
    Malformed,
    /// The payload segment is not base64url
    #[error("ID token payload is not base64url encoded")]
    Encoding(#[from] base64::DecodeError),
    /// The payload is not a JSON object
    #[error("ID token payload is not a JSON object")]
    Json(#[from] serde_json::Error),
}

impl IdTokenRef {
    /// Reads the claims of this ID token **without validating it**
    ///
    /// Only suitable for tokens already validated when they were obtained.
    pub fn claims(&self) -> Result<Map<String, Value>, ClaimsError> {
        let mut segments = self.as_str().split('.');
        let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(payload), Some(_), None) => payload,
            _ => return Err(ClaimsError::Malformed),
        };

        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn secrets_are_hidden_unless_alternate() {
        let token = AccessToken::from_static("abcdefghijklmnopqrstuvwxyz");

        assert_eq!(format!("{:?}", token), "***ACCESS TOKEN***");
        assert_eq!(format!("{:#?}", token), "\"abcdefghijklmn…\"");
        assert_eq!(format!("{:#8}", token), "abcdefg…");
    }

    #[test]
    fn generated_token_ids_differ() {
        assert_ne!(TokenId::generate(), TokenId::generate());
    }

    #[test]
    fn id_token_claims_are_decoded() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"user-1","name":"Ada"}"#);
        let id_token = IdToken::new(format!("e30.{payload}.sig"));

        let claims = id_token.claims().unwrap();

        assert_eq!(claims.get("sub"), Some(&json!("user-1")));
        assert_eq!(claims.get("name"), Some(&json!("Ada")));
    }

    #[test]
    fn id_token_without_three_segments_is_malformed() {
        let id_token = IdToken::from_static("not-a-jwt");
        assert!(matches!(id_token.claims(), Err(ClaimsError::Malformed)));
    }
}
