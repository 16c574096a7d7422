use thiserror::Error;

use super::claims::DecodeError;
use crate::api::ApiError;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// Network failure or timeout while refreshing. Recoverable.
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// The server refused the refresh token. The session is gone.
    #[error("Refresh token rejected - please sign in again")]
    RefreshRejected,

    /// This caller joined a refresh started by another caller, and that
    /// refresh ended the session.
    #[error("Session ended by a concurrent refresh: {cause}")]
    RaceLost { cause: Box<AuthError> },

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl AuthError {
    /// Errors after which the session no longer exists.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthError::NotAuthenticated | AuthError::RefreshRejected | AuthError::RaceLost { .. }
        )
    }
}

impl From<DecodeError> for AuthError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::MalformedToken(msg) => AuthError::MalformedToken(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_errors() {
        assert!(AuthError::NotAuthenticated.is_terminal());
        assert!(AuthError::RefreshRejected.is_terminal());
        assert!(AuthError::RaceLost {
            cause: Box::new(AuthError::RefreshRejected)
        }
        .is_terminal());
        assert!(!AuthError::RefreshFailed("timeout".to_string()).is_terminal());
        assert!(!AuthError::MalformedToken("x".to_string()).is_terminal());
        assert!(!AuthError::Api(ApiError::RateLimited).is_terminal());
    }

    #[test]
    fn test_race_lost_mentions_cause() {
        let err = AuthError::RaceLost {
            cause: Box::new(AuthError::RefreshRejected),
        };
        assert!(err.to_string().contains("Refresh token rejected"));
    }
}
