//! Production [`Authenticator`](super::handler::Authenticator): validates
//! the tokens Login mints via [`crate::login::token::TokenSigner`]. Login
//! tokens and reconnect session tokens share one signer and one `uid`
//! claim — they differ only in how the client obtained them.

use async_trait::async_trait;

use crate::errors::TokenError;
use crate::gateway::handler::Authenticator;
use crate::login::token::TokenSigner;

pub struct TokenAuthenticator {
    signer: TokenSigner,
}

impl TokenAuthenticator {
    pub fn new(signer: TokenSigner) -> Self {
        Self { signer }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn validate_login_token(&self, token: &str) -> Result<i64, TokenError> {
        self.signer.validate(token).map(|claims| claims.uid)
    }

    async fn validate_session_token(&self, token: &str) -> Result<i64, TokenError> {
        self.signer.validate(token).map(|claims| claims.uid)
    }

    fn issue_session_token(&self, uid: i64) -> String {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.signer.issue(uid, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issued_session_token_validates_back_to_the_same_uid() {
        let auth = TokenAuthenticator::new(TokenSigner::new(b"secret", 3600));
        let token = auth.issue_session_token(42);
        assert_eq!(auth.validate_session_token(&token).await.unwrap(), 42);
    }
}
