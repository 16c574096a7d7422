//! Session state machine.
//!
//! `SignedOut -> SignedIn -> (Refreshing) -> SignedIn -> ... -> SignedOut`
//!
//! Every caller that needs a usable access token goes through
//! [`SessionCoordinator::ensure_fresh_token`]. Refreshes are single-flight:
//! while one refresh call is outstanding, every other caller awaits that same
//! call instead of issuing its own. Servers that rotate refresh tokens
//! invalidate the old one on first use, so a second concurrent refresh would
//! fail and take the session down with it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::claims::{decode_claims, Claims};
use super::policy::{seconds_until_expiry, Clock, Freshness, RefreshPolicy, SystemClock};
use super::session::{Session, SessionEvent, SessionStatus, TokenPair};
use super::storage::SessionStorage;
use super::store::TokenStore;
use super::AuthError;
use crate::api::{AuthApi, Credentials};

/// Upper bound on a single refresh call, in seconds
pub const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 10;

type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// What a finished refresh means for everyone who waited on it.
#[derive(Debug, Clone)]
enum RefreshOutcome {
    Refreshed(String),
    /// Transient failure while the old token is still valid
    Degraded { access_token: String, reason: String },
    /// The session is over
    Ended(EndReason),
    /// The refresh task itself died
    Interrupted(String),
}

#[derive(Debug, Clone, Copy)]
enum EndReason {
    Rejected,
    SignedOut,
}

impl EndReason {
    fn into_error(self) -> AuthError {
        match self {
            EndReason::Rejected => AuthError::RefreshRejected,
            EndReason::SignedOut => AuthError::NotAuthenticated,
        }
    }
}

enum Ticket {
    Ready(String),
    Wait { refresh: SharedRefresh, leader: bool },
}

#[derive(Clone)]
pub struct SessionOptions {
    pub policy: RefreshPolicy,
    pub refresh_timeout: Duration,
    pub clock: Arc<dyn Clock>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            policy: RefreshPolicy::default(),
            refresh_timeout: Duration::from_secs(DEFAULT_REFRESH_TIMEOUT_SECS),
            clock: Arc::new(SystemClock),
        }
    }
}

struct Inner {
    store: TokenStore,
    api: Arc<dyn AuthApi>,
    clock: Arc<dyn Clock>,
    policy: RefreshPolicy,
    refresh_timeout: Duration,
    /// Refresh state: `None` is idle, `Some` is the outstanding refresh
    in_flight: Mutex<Option<(u64, SharedRefresh)>>,
    next_refresh_id: AtomicU64,
}

/// Owner of the session lifecycle.
/// Clone is cheap - all clones share one session.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    /// Build a coordinator and re-hydrate whatever session `storage` holds.
    pub async fn init(
        storage: Arc<dyn SessionStorage>,
        api: Arc<dyn AuthApi>,
        options: SessionOptions,
    ) -> Self {
        let store = TokenStore::open(storage).await;
        Self {
            inner: Arc::new(Inner {
                store,
                api,
                clock: options.clock,
                policy: options.policy,
                refresh_timeout: options.refresh_timeout,
                in_flight: Mutex::new(None),
                next_refresh_id: AtomicU64::new(0),
            }),
        }
    }

    /// Wait for any outstanding refresh to settle.
    pub async fn dispose(&self) {
        let pending = self
            .inner
            .in_flight
            .lock()
            .await
            .as_ref()
            .map(|(_, refresh)| refresh.clone());
        if let Some(refresh) = pending {
            debug!("Waiting for in-flight refresh before shutdown");
            let _ = refresh.await;
        }
    }

    // ===== Token access =====

    /// Return an access token that is not expired, refreshing first when
    /// the current one is expired or about to be.
    pub async fn ensure_fresh_token(&self) -> Result<String, AuthError> {
        let Some(pair) = self.inner.store.get().await else {
            return Err(AuthError::NotAuthenticated);
        };

        let freshness = self.inner.policy.classify(&pair.access_token, self.inner.clock.now());
        if !freshness.needs_refresh() {
            return Ok(pair.access_token);
        }

        debug!(?freshness, "Access token needs refresh");
        let ticket = self.acquire(false).await?;
        self.settle(ticket, false).await
    }

    /// Refresh now regardless of freshness. Unlike
    /// [`ensure_fresh_token`](Self::ensure_fresh_token), a transient failure
    /// is reported as `RefreshFailed` instead of falling back to the old token.
    pub async fn refresh_now(&self) -> Result<String, AuthError> {
        let ticket = self.acquire(true).await?;
        self.settle(ticket, true).await
    }

    /// Join the outstanding refresh or start one.
    ///
    /// The pair is re-read under the lock: a refresh may have finished
    /// between the caller's first look and now, and starting another with
    /// the old refresh token would defeat rotation.
    async fn acquire(&self, force: bool) -> Result<Ticket, AuthError> {
        let mut slot = self.inner.in_flight.lock().await;
        if let Some((_, refresh)) = slot.as_ref() {
            debug!("Joining in-flight refresh");
            return Ok(Ticket::Wait {
                refresh: refresh.clone(),
                leader: false,
            });
        }

        let Some(pair) = self.inner.store.get().await else {
            return Err(AuthError::NotAuthenticated);
        };
        if !force
            && !self
                .inner
                .policy
                .classify(&pair.access_token, self.inner.clock.now())
                .needs_refresh()
        {
            return Ok(Ticket::Ready(pair.access_token));
        }

        let id = self.inner.next_refresh_id.fetch_add(1, Ordering::Relaxed);
        let refresh = Inner::start_refresh(&self.inner, id, pair);
        *slot = Some((id, refresh.clone()));
        Ok(Ticket::Wait {
            refresh,
            leader: true,
        })
    }

    async fn settle(&self, ticket: Ticket, strict: bool) -> Result<String, AuthError> {
        let (refresh, leader) = match ticket {
            Ticket::Ready(token) => return Ok(token),
            Ticket::Wait { refresh, leader } => (refresh, leader),
        };

        match refresh.await {
            RefreshOutcome::Refreshed(token) => Ok(token),
            RefreshOutcome::Degraded {
                access_token,
                reason,
            } => {
                if strict {
                    Err(AuthError::RefreshFailed(reason))
                } else {
                    warn!(reason = %reason, "Token refresh failed, reusing current access token");
                    Ok(access_token)
                }
            }
            RefreshOutcome::Ended(reason) => {
                let cause = reason.into_error();
                if leader {
                    Err(cause)
                } else {
                    Err(AuthError::RaceLost {
                        cause: Box::new(cause),
                    })
                }
            }
            RefreshOutcome::Interrupted(reason) => {
                if !strict {
                    if let Some(pair) = self.inner.store.get().await {
                        if self.inner.policy.classify(&pair.access_token, self.inner.clock.now())
                            != Freshness::Expired
                        {
                            return Ok(pair.access_token);
                        }
                    }
                }
                Err(AuthError::RefreshFailed(reason))
            }
        }
    }

    // ===== Sign in / sign out =====

    pub async fn sign_in(&self, credentials: &Credentials) -> Result<(), AuthError> {
        let pair = self.inner.api.login(credentials).await?;
        info!(email = %credentials.email, "Signed in");
        self.establish(pair).await;
        Ok(())
    }

    /// Register a new account and sign it in.
    ///
    /// When the server does not hand out tokens on registration, the same
    /// credentials are used to log in.
    pub async fn register(&self, credentials: &Credentials) -> Result<(), AuthError> {
        match self.inner.api.register(credentials).await? {
            Some(pair) => {
                info!(email = %credentials.email, "Registered and signed in");
                self.establish(pair).await;
                Ok(())
            }
            None => {
                debug!(email = %credentials.email, "Registered, signing in");
                self.sign_in(credentials).await
            }
        }
    }

    pub async fn sign_in_with_google(&self, code: &str, state: &str) -> Result<(), AuthError> {
        let pair = self.inner.api.google(code, state).await?;
        info!("Signed in with Google");
        self.establish(pair).await;
        Ok(())
    }

    /// Adopt a pair obtained outside this coordinator.
    pub async fn establish(&self, pair: TokenPair) {
        self.inner.store.set(pair).await;
    }

    /// End the session. The server is told on a best-effort basis; the local
    /// session is cleared whether or not that call succeeds.
    pub async fn sign_out(&self) {
        if let Some(pair) = self.inner.store.get().await {
            let logout = self.inner.api.logout(&pair.access_token);
            match tokio::time::timeout(self.inner.refresh_timeout, logout).await {
                Ok(Ok(())) => debug!("Server-side logout acknowledged"),
                Ok(Err(e)) => warn!(error = %e, "Server-side logout failed"),
                Err(_) => warn!("Server-side logout timed out"),
            }
        }
        if self.inner.store.clear().await {
            info!("Signed out");
        }
    }

    // ===== Inspection =====

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.store.subscribe()
    }

    pub async fn session(&self) -> Session {
        self.inner.store.session().await
    }

    pub async fn is_signed_in(&self) -> bool {
        self.session().await.is_signed_in()
    }

    pub async fn is_refreshing(&self) -> bool {
        self.inner.in_flight.lock().await.is_some()
    }

    pub async fn status(&self) -> SessionStatus {
        let session = self.session().await;
        let Some(pair) = session.pair() else {
            return SessionStatus::SignedOut;
        };
        let now = self.inner.clock.now();
        SessionStatus::Active {
            freshness: self.inner.policy.classify(&pair.access_token, now),
            expires_in_secs: seconds_until_expiry(&pair.access_token, now),
            subject: decode_claims(&pair.access_token).ok().and_then(|c| c.sub),
        }
    }

    /// Claims of the current access token.
    pub async fn access_claims(&self) -> Result<Claims, AuthError> {
        let pair = self.inner.store.get().await.ok_or(AuthError::NotAuthenticated)?;
        Ok(decode_claims(&pair.access_token)?)
    }
}

impl Inner {
    /// Spawn the refresh so it runs to completion even if every caller
    /// stops waiting. The task itself resets the refresh state before it
    /// resolves, so a finished refresh is never joined later.
    fn start_refresh(inner: &Arc<Inner>, id: u64, pair: TokenPair) -> SharedRefresh {
        let task_inner = Arc::clone(inner);
        let task = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(Arc::clone(&task_inner).refresh(pair))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    warn!("Refresh task panicked");
                    RefreshOutcome::Interrupted("refresh task panicked".to_string())
                });
            task_inner.finish_refresh(id).await;
            outcome
        });

        async move {
            task.await.unwrap_or_else(|e| {
                warn!(error = %e, "Refresh task failed");
                RefreshOutcome::Interrupted(e.to_string())
            })
        }
        .boxed()
        .shared()
    }

    async fn finish_refresh(&self, id: u64) {
        let mut slot = self.in_flight.lock().await;
        if matches!(slot.as_ref(), Some((current, _)) if *current == id) {
            *slot = None;
        }
    }

    async fn refresh(self: Arc<Self>, pair: TokenPair) -> RefreshOutcome {
        if !self.policy.refresh_token_viable(&pair.refresh_token, self.clock.now()) {
            info!("Refresh token has expired, ending session");
            return self.end_session(&pair, EndReason::SignedOut).await;
        }

        debug!("Refreshing access token");
        let call = self.api.refresh(&pair.refresh_token);
        let result = match tokio::time::timeout(self.refresh_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                let reason = format!("refresh timed out after {}ms", self.refresh_timeout.as_millis());
                return self.transient_failure(&pair, reason).await;
            }
        };

        match result {
            Ok(tokens) => {
                let rotated = tokens.refresh_token.is_some();
                let new_pair = TokenPair {
                    access_token: tokens.access_token,
                    refresh_token: tokens
                        .refresh_token
                        .unwrap_or_else(|| pair.refresh_token.clone()),
                };
                let access_token = new_pair.access_token.clone();
                if self.store.replace_if_current(&pair.refresh_token, new_pair).await {
                    info!(rotated, "Access token refreshed");
                    RefreshOutcome::Refreshed(access_token)
                } else {
                    debug!("Session changed during refresh, discarding result");
                    self.current_outcome().await
                }
            }
            Err(e) if e.is_rejection() => {
                warn!(error = %e, "Refresh token rejected");
                self.end_session(&pair, EndReason::Rejected).await
            }
            Err(e) => self.transient_failure(&pair, e.to_string()).await,
        }
    }

    /// A failed refresh is survivable only while the old token is still valid.
    async fn transient_failure(&self, pair: &TokenPair, reason: String) -> RefreshOutcome {
        match self.policy.classify(&pair.access_token, self.clock.now()) {
            Freshness::Expired => {
                warn!(reason = %reason, "Refresh failed and access token has expired");
                self.end_session(pair, EndReason::SignedOut).await
            }
            Freshness::Fresh | Freshness::NearExpiry => match self.store.get().await {
                Some(current) if current.refresh_token == pair.refresh_token => RefreshOutcome::Degraded {
                    access_token: current.access_token,
                    reason,
                },
                _ => self.current_outcome().await,
            },
        }
    }

    async fn end_session(&self, pair: &TokenPair, reason: EndReason) -> RefreshOutcome {
        if !self.store.clear_if_current(&pair.refresh_token).await {
            debug!("Session already replaced, leaving it alone");
            return self.current_outcome().await;
        }
        RefreshOutcome::Ended(reason)
    }

    /// Outcome when the session was replaced or cleared by someone else
    /// while the refresh was running.
    async fn current_outcome(&self) -> RefreshOutcome {
        match self.store.get().await {
            Some(current) => RefreshOutcome::Refreshed(current.access_token),
            None => RefreshOutcome::Ended(EndReason::SignedOut),
        }
    }
}
