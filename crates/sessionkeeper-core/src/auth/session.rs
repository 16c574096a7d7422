use std::fmt;

use serde::{Deserialize, Serialize};

use super::policy::Freshness;

/// Access/refresh credential pair issued by the auth endpoints.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

// Tokens never end up in logs
impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Session {
    SignedOut,
    SignedIn(TokenPair),
}

impl Session {
    pub fn is_signed_in(&self) -> bool {
        matches!(self, Session::SignedIn(_))
    }

    pub fn pair(&self) -> Option<&TokenPair> {
        match self {
            Session::SignedIn(pair) => Some(pair),
            Session::SignedOut => None,
        }
    }
}

impl From<Option<TokenPair>> for Session {
    fn from(pair: Option<TokenPair>) -> Self {
        pair.map_or(Session::SignedOut, Session::SignedIn)
    }
}

/// Session transitions broadcast to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn,
    TokensRotated,
    SignedOut,
}

/// Durable record layout. Absence of the record means signed out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl PersistedSession {
    /// Both halves or nothing: a partial record is not a session.
    pub fn into_pair(self) -> Option<TokenPair> {
        match (self.access_token, self.refresh_token) {
            (Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => {
                Some(TokenPair::new(access, refresh))
            }
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}

impl From<&TokenPair> for PersistedSession {
    fn from(pair: &TokenPair) -> Self {
        Self {
            access_token: Some(pair.access_token.clone()),
            refresh_token: Some(pair.refresh_token.clone()),
        }
    }
}

/// Snapshot of the session for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    SignedOut,
    Active {
        freshness: Freshness,
        /// None when the access token carries no readable expiry
        expires_in_secs: Option<i64>,
        subject: Option<String>,
    },
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Active { .. })
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        match self {
            SessionStatus::Active {
                expires_in_secs: Some(secs),
                ..
            } => Some((secs / 60).max(0)),
            _ => None,
        }
    }

    pub fn display_message(&self) -> String {
        match self {
            SessionStatus::SignedOut => "Signed out".to_string(),
            SessionStatus::Active {
                freshness,
                expires_in_secs,
                ..
            } => {
                let remaining = match expires_in_secs {
                    Some(secs) if *secs < 0 => "expired".to_string(),
                    Some(secs) if *secs >= 3600 => format!("{}h left", secs / 3600),
                    Some(secs) if *secs >= 60 => format!("{}m left", secs / 60),
                    Some(secs) => format!("{}s left", secs),
                    None => "unknown expiry".to_string(),
                };
                match freshness {
                    Freshness::Fresh => format!("Signed in ({})", remaining),
                    Freshness::NearExpiry => format!("Signed in, refresh due ({})", remaining),
                    Freshness::Expired => format!("Signed in, access token expired ({})", remaining),
                }
            }
        }
    }
}
