//! Signed session/login tokens (§3 Identity / Token, §4.5).

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::errors::TokenError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub uid: i64,
    pub iat: i64,
    pub exp: i64,
    #[serde(default)]
    pub custom: std::collections::HashMap<String, String>,
}

/// Mints and validates the JWT-style tokens carried by `AUTH_RES`/
/// `RECONNECT_REQ` and Login's own `{token, uid, nickname, gateway_addr}`
/// response.
pub struct TokenSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl_secs: i64,
}

impl TokenSigner {
    pub fn new(secret: &[u8], ttl_secs: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            ttl_secs,
        }
    }

    pub fn issue(&self, uid: i64, now_unix: i64) -> String {
        let claims = Claims { uid, iat: now_unix, exp: now_unix + self.ttl_secs, custom: Default::default() };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .expect("HS256 signing with a valid key never fails")
    }

    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        match decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(TokenError::Expired),
                jsonwebtoken::errors::ErrorKind::InvalidToken | jsonwebtoken::errors::ErrorKind::Json(_) => {
                    Err(TokenError::Malformed)
                }
                _ => Err(TokenError::Invalid),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_validates_back_to_the_same_uid() {
        let signer = TokenSigner::new(b"test-secret", 3600);
        let token = signer.issue(42, 1_700_000_000);
        let claims = signer.validate(&token).unwrap();
        assert_eq!(claims.uid, 42);
    }

    #[test]
    fn expired_token_is_rejected() {
        let signer = TokenSigner::new(b"test-secret", -10);
        let token = signer.issue(42, 1_700_000_000);
        let err = signer.validate(&token).unwrap_err();
        assert_eq!(err, TokenError::Expired);
    }

    #[test]
    fn tampered_token_is_invalid() {
        let signer = TokenSigner::new(b"test-secret", 3600);
        let mut token = signer.issue(42, 1_700_000_000);
        token.push('x');
        let err = signer.validate(&token).unwrap_err();
        assert!(matches!(err, TokenError::Invalid | TokenError::Malformed));
    }
}
