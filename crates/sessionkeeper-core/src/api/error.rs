//! Errors from talking to the API server.
//!
//! Non-success statuses are folded into a handful of variants so callers can
//! tell a refused credential from a server that is merely unwell.

use reqwest::StatusCode;
use thiserror::Error;

/// Response bodies quoted in errors are cut to this many characters
const BODY_PREVIEW_CHARS: usize = 500;

#[derive(Error, Debug)]
pub enum ApiError {
    /// 401: the bearer credential is missing, expired or revoked
    #[error("Unauthorized - credential missing, expired or revoked")]
    Unauthorized,

    /// 403: the credential is valid but not allowed here
    #[error("Forbidden: {0}")]
    AccessDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// 429 after the client's own backoff gave up
    #[error("Rate limited by the server")]
    RateLimited,

    /// Any 5xx
    #[error("Server error: {0}")]
    ServerError(String),

    /// The request never got a response (connect, TLS, timeout)
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// Unexpected status, or a body that does not parse
    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Map a non-success status and its body to an error.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let preview = body_preview(body);
        match status {
            StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
            StatusCode::FORBIDDEN => ApiError::AccessDenied(preview),
            StatusCode::NOT_FOUND => ApiError::NotFound(preview),
            StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited,
            s if s.is_server_error() => ApiError::ServerError(preview),
            s => ApiError::InvalidResponse(format!("HTTP {}: {}", s.as_u16(), preview)),
        }
    }

    /// The server refused the credential outright. Retrying with the same
    /// credential cannot succeed.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ApiError::Unauthorized | ApiError::AccessDenied(_))
    }
}

/// Keep error messages and logs bounded.
fn body_preview(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(BODY_PREVIEW_CHARS) {
        None => body.to_string(),
        Some((cut, _)) => format!("{}... ({} bytes in total)", &body[..cut], body.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(ApiError::from_status(StatusCode::UNAUTHORIZED, ""), ApiError::Unauthorized));
        assert!(matches!(ApiError::from_status(StatusCode::FORBIDDEN, "no"), ApiError::AccessDenied(_)));
        assert!(matches!(ApiError::from_status(StatusCode::NOT_FOUND, ""), ApiError::NotFound(_)));
        assert!(matches!(ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, ""), ApiError::RateLimited));
        assert!(matches!(ApiError::from_status(StatusCode::BAD_GATEWAY, ""), ApiError::ServerError(_)));
        assert!(matches!(ApiError::from_status(StatusCode::BAD_REQUEST, ""), ApiError::InvalidResponse(_)));
    }

    #[test]
    fn test_unexpected_status_keeps_code_and_body() {
        match ApiError::from_status(StatusCode::CONFLICT, " already registered \n") {
            ApiError::InvalidResponse(msg) => assert_eq!(msg, "HTTP 409: already registered"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rejection_classification() {
        assert!(ApiError::Unauthorized.is_rejection());
        assert!(ApiError::AccessDenied(String::new()).is_rejection());
        assert!(!ApiError::ServerError(String::new()).is_rejection());
        assert!(!ApiError::RateLimited.is_rejection());
    }

    #[test]
    fn test_long_bodies_are_cut_on_char_boundaries() {
        let body = "é".repeat(600);
        match ApiError::from_status(StatusCode::INTERNAL_SERVER_ERROR, &body) {
            ApiError::ServerError(msg) => {
                assert!(msg.starts_with(&"é".repeat(BODY_PREVIEW_CHARS)));
                assert!(msg.ends_with("... (1200 bytes in total)"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_short_bodies_are_kept() {
        assert_eq!(body_preview("boom"), "boom");
        assert_eq!(body_preview(&"x".repeat(BODY_PREVIEW_CHARS)).len(), BODY_PREVIEW_CHARS);
    }
}
