//! Client-visible error taxonomy (§7 Error Handling Design).
//!
//! Every response envelope carries a `code` field drawn from `ErrorCode`; a
//! non-`Success` code omits the payload. This mirrors the teacher's
//! `errors::ErrorCategory` — a flat, `Copy` enum with a stable wire label —
//! but the categories here are the ones §7 names for the client protocol
//! rather than HTTP status buckets.

use thiserror::Error;

/// Stable, client-visible result code (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Success = 0,
    TokenInvalid = 1,
    TokenExpired = 2,
    NotAuthenticated = 3,
    NicknameInvalid = 4,
    NicknameExists = 5,
    RoleLimitExceeded = 6,
    InvalidRole = 7,
    Internal = 8,
}

impl ErrorCode {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::TokenInvalid => "token_invalid",
            ErrorCode::TokenExpired => "token_expired",
            ErrorCode::NotAuthenticated => "not_authenticated",
            ErrorCode::NicknameInvalid => "nickname_invalid",
            ErrorCode::NicknameExists => "nickname_exists",
            ErrorCode::RoleLimitExceeded => "role_limit_exceeded",
            ErrorCode::InvalidRole => "invalid_role",
            ErrorCode::Internal => "internal",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ErrorCode::Success)
    }
}

/// Errors raised by the session pipeline (§4.1) and surfaced via
/// `SessionHandler::OnError`.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("recv queue full, envelope dropped")]
    QueueFull,
    #[error("transport closed")]
    ConnectionClosed,
    #[error("framer error: {0}")]
    Framer(#[from] crate::envelope::FramerError),
    #[error("handler panicked: {0}")]
    HandlerPanicked(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the session manager (§4.4).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ManagerError {
    #[error("session not found")]
    SessionNotFound,
    #[error("session not authenticated")]
    NotAuthenticated,
}

/// Errors from the Redis presence coordinator (§4.8).
#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("account already has a role online in this zone: {0}")]
    AlreadyHasRoleOnline(i64),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialisation error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors from the Gateway<->Game stream connector (§4.7).
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(#[from] tonic::Status),
}

/// Token validation failure modes (§3 Identity / Token).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token invalid")]
    Invalid,
    #[error("token malformed")]
    Malformed,
}

impl From<TokenError> for ErrorCode {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Expired => ErrorCode::TokenExpired,
            TokenError::Invalid | TokenError::Malformed => ErrorCode::TokenInvalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_code_has_no_failure_label_ambiguity() {
        assert!(ErrorCode::Success.is_success());
        assert!(!ErrorCode::Internal.is_success());
    }

    #[test]
    fn token_error_maps_to_stable_codes() {
        assert_eq!(ErrorCode::from(TokenError::Expired), ErrorCode::TokenExpired);
        assert_eq!(ErrorCode::from(TokenError::Malformed), ErrorCode::TokenInvalid);
    }
}
