//! Opaque-token verification for WebSocket upgrades.
//!
//! Token issuance and JWT parsing live in an external identity service; the
//! core only needs "token in, user id out". An invalid token denies the
//! upgrade before any lobby state is touched.

use crate::protocol::UserId;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing authentication token")]
    MissingToken,
    #[error("invalid authentication token")]
    InvalidToken,
}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}

/// Development verifier: the token is the user's uuid in plain text.
/// Deployments slot a real verifier behind the same trait.
#[derive(Default)]
pub struct UuidTokenVerifier;

impl TokenVerifier for UuidTokenVerifier {
    fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        token.parse::<UserId>().map_err(|_| AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_uuid_token_yields_user_id() {
        let verifier = UuidTokenVerifier;
        let id = uuid::Uuid::new_v4();
        assert_eq!(verifier.verify(&id.to_string()), Ok(id));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let verifier = UuidTokenVerifier;
        assert_eq!(verifier.verify(""), Err(AuthError::MissingToken));
        assert_eq!(verifier.verify("not-a-uuid"), Err(AuthError::InvalidToken));
    }
}
