use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::claims::decode_claims;

/// Buffer before expiry that triggers a proactive refresh (5 minutes)
pub const DEFAULT_REFRESH_THRESHOLD_SECS: i64 = 300;

/// Source of the current time.
///
/// Lets tests drive expiry deterministically instead of sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    NearExpiry,
    Expired,
}

impl Freshness {
    pub fn needs_refresh(&self) -> bool {
        !matches!(self, Freshness::Fresh)
    }
}

/// Classify `token` against `now`.
///
/// Tokens without a decodable `exp` are `Expired`: an unknown lifetime is
/// never trusted.
pub fn classify(token: &str, now: DateTime<Utc>, threshold: Duration) -> Freshness {
    let exp = match decode_claims(token) {
        Ok(claims) => claims.exp,
        Err(e) => {
            debug!(error = %e, "Undecodable access token, treating as expired");
            None
        }
    };

    let Some(exp) = exp else {
        return Freshness::Expired;
    };

    let now = now.timestamp();
    if exp < now {
        Freshness::Expired
    } else if exp.saturating_sub(now) < threshold.num_seconds() {
        Freshness::NearExpiry
    } else {
        Freshness::Fresh
    }
}

/// Seconds until `token` expires, if it carries an `exp` claim.
/// Negative once expired.
pub fn seconds_until_expiry(token: &str, now: DateTime<Utc>) -> Option<i64> {
    decode_claims(token)
        .ok()
        .and_then(|claims| claims.exp)
        .map(|exp| exp.saturating_sub(now.timestamp()))
}

/// Refresh decision rules for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    threshold: Duration,
}

impl RefreshPolicy {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }

    pub fn from_secs(threshold_secs: i64) -> Self {
        Self::new(Duration::seconds(threshold_secs))
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn classify(&self, token: &str, now: DateTime<Utc>) -> Freshness {
        classify(token, now, self.threshold)
    }

    /// Whether exchanging `refresh_token` can possibly succeed.
    ///
    /// A JWT-shaped refresh token whose own `exp` has passed is known dead,
    /// so there is no point asking the server. Opaque refresh tokens are
    /// always worth a try.
    pub fn refresh_token_viable(&self, refresh_token: &str, now: DateTime<Utc>) -> bool {
        match decode_claims(refresh_token) {
            Ok(claims) => claims.exp.map_or(true, |exp| exp >= now.timestamp()),
            Err(_) => true,
        }
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::from_secs(DEFAULT_REFRESH_THRESHOLD_SECS)
    }
}
