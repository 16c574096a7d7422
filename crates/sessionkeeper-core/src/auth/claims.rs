//! Bearer token claim decoding.
//!
//! Only the payload segment of a JWT-shaped token is read. The signature is
//! never checked here: the server enforces validity, the client only needs
//! the expiration hint to schedule refreshes.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed token: {0}")]
    MalformedToken(String),
}

/// Claims the client cares about. Everything else in the payload is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Claims {
    /// Expiration, Unix seconds
    #[serde(default, deserialize_with = "numeric_date")]
    pub exp: Option<i64>,
    /// Issued-at, Unix seconds
    #[serde(default, deserialize_with = "numeric_date")]
    pub iat: Option<i64>,
    #[serde(default)]
    pub sub: Option<String>,
}

/// NumericDate values may carry a fractional part; they are floored to
/// whole seconds. Out-of-range values saturate.
fn numeric_date<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<serde_json::Number>::deserialize(deserializer)?;
    Ok(value.and_then(|n| n.as_i64().or_else(|| n.as_f64().map(|secs| secs.floor() as i64))))
}

/// Decode the claim segment of `token` without verifying its signature.
pub fn decode_claims(token: &str) -> Result<Claims, DecodeError> {
    let mut segments = token.trim().split('.');
    let payload = match (segments.next(), segments.next()) {
        (Some(header), Some(payload)) if !header.is_empty() && !payload.is_empty() => payload,
        _ => {
            return Err(DecodeError::MalformedToken(
                "expected at least two dot-separated segments".to_string(),
            ))
        }
    };

    // Some issuers pad their segments even though base64url in JWTs should not be
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| DecodeError::MalformedToken(format!("claim segment is not base64url: {}", e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| DecodeError::MalformedToken(format!("claim segment is not a JSON object: {}", e)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build an unsigned token carrying `payload` as its claim segment.
    pub(crate) fn token_with_payload(payload: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload);
        format!("{}.{}.signature", header, body)
    }

    pub(crate) fn token_expiring_at(exp: i64) -> String {
        token_with_payload(&format!(r#"{{"sub":"42","iat":{},"exp":{}}}"#, exp - 3600, exp))
    }

    #[test]
    fn test_decode_reads_exp_iat_and_sub() {
        let claims = decode_claims(&token_expiring_at(1_700_000_000)).unwrap();
        assert_eq!(claims.exp, Some(1_700_000_000));
        assert_eq!(claims.iat, Some(1_699_996_400));
        assert_eq!(claims.sub.as_deref(), Some("42"));
    }

    #[test]
    fn test_decode_without_exp() {
        let claims = decode_claims(&token_with_payload(r#"{"sub":"7"}"#)).unwrap();
        assert_eq!(claims.exp, None);
    }

    #[test]
    fn test_decode_tolerates_padding() {
        let header = URL_SAFE_NO_PAD.encode("{}");
        let padded = base64::engine::general_purpose::URL_SAFE.encode(r#"{"exp":55}"#);
        let claims = decode_claims(&format!("{}.{}.sig", header, padded)).unwrap();
        assert_eq!(claims.exp, Some(55));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_claims("").is_err());
        assert!(decode_claims("not-a-token").is_err());
        assert!(decode_claims("a..c").is_err());
        assert!(decode_claims("a.!!!.c").is_err());
        // valid base64url but not JSON
        let not_json = format!("h.{}.s", URL_SAFE_NO_PAD.encode("hello"));
        assert!(matches!(decode_claims(&not_json), Err(DecodeError::MalformedToken(_))));
    }

    #[test]
    fn test_decode_floors_fractional_numeric_dates() {
        let claims =
            decode_claims(&token_with_payload(r#"{"iat":1699996400.25,"exp":1700000000.5}"#)).unwrap();
        assert_eq!(claims.exp, Some(1_700_000_000));
        assert_eq!(claims.iat, Some(1_699_996_400));

        let claims = decode_claims(&token_with_payload(r#"{"exp":-0.5}"#)).unwrap();
        assert_eq!(claims.exp, Some(-1));
    }

    #[test]
    fn test_decode_saturates_huge_exp() {
        let claims = decode_claims(&token_with_payload(r#"{"exp":1e300}"#)).unwrap();
        assert_eq!(claims.exp, Some(i64::MAX));
        let claims = decode_claims(&token_with_payload(r#"{"exp":18446744073709551615}"#)).unwrap();
        assert_eq!(claims.exp, Some(i64::MAX));
    }

    #[test]
    fn test_decode_null_exp_is_absent() {
        let claims = decode_claims(&token_with_payload(r#"{"exp":null}"#)).unwrap();
        assert_eq!(claims.exp, None);
    }

    #[test]
    fn test_decode_rejects_non_numeric_exp() {
        assert!(decode_claims(&token_with_payload(r#"{"exp":"tomorrow"}"#)).is_err());
    }
}
