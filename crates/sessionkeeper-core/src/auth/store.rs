use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use super::session::{PersistedSession, Session, SessionEvent, TokenPair};
use super::storage::SessionStorage;

/// Capacity of the session event channel.
/// Transitions are rare; slow subscribers only lose stale events.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Holder of the current token pair.
///
/// The pair sits behind one lock, so readers see either the whole pair or
/// nothing. Every transition is written through to durable storage and
/// broadcast to subscribers. Mutation is crate-private: only the session
/// coordinator changes the session.
pub struct TokenStore {
    pair: RwLock<Option<TokenPair>>,
    storage: Arc<dyn SessionStorage>,
    events: broadcast::Sender<SessionEvent>,
}

impl TokenStore {
    /// Open the store, re-hydrating any persisted session.
    ///
    /// Unreadable or partial records are discarded and the store starts
    /// signed out.
    pub async fn open(storage: Arc<dyn SessionStorage>) -> Self {
        let pair = match storage.load().await {
            Ok(Some(record)) if record.is_empty() => None,
            Ok(Some(record)) => match record.into_pair() {
                Some(pair) => {
                    debug!("Session re-hydrated from storage");
                    Some(pair)
                }
                None => {
                    warn!("Discarding partial session record");
                    if let Err(e) = storage.remove().await {
                        warn!(error = %e, "Failed to remove partial session record");
                    }
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to load persisted session, starting signed out");
                None
            }
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            pair: RwLock::new(pair),
            storage,
            events,
        }
    }

    pub async fn get(&self) -> Option<TokenPair> {
        self.pair.read().await.clone()
    }

    pub async fn session(&self) -> Session {
        self.get().await.into()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) async fn set(&self, pair: TokenPair) {
        let mut current = self.pair.write().await;
        self.store_locked(&mut current, pair).await;
    }

    /// Swap in `pair` only if the stored refresh token is still `expected_refresh`.
    ///
    /// Returns false when the session was cleared or replaced in the meantime.
    pub(crate) async fn replace_if_current(&self, expected_refresh: &str, pair: TokenPair) -> bool {
        let mut current = self.pair.write().await;
        match current.as_ref() {
            Some(existing) if existing.refresh_token == expected_refresh => {
                self.store_locked(&mut current, pair).await;
                true
            }
            _ => false,
        }
    }

    /// Sign out. Returns whether a session was actually removed; clearing an
    /// empty store notifies nobody.
    pub(crate) async fn clear(&self) -> bool {
        let mut current = self.pair.write().await;
        self.clear_locked(&mut current).await
    }

    /// Sign out only if the stored refresh token is still `expected_refresh`,
    /// so a failed refresh never ends a session that replaced it.
    pub(crate) async fn clear_if_current(&self, expected_refresh: &str) -> bool {
        let mut current = self.pair.write().await;
        match current.as_ref() {
            Some(existing) if existing.refresh_token == expected_refresh => {
                self.clear_locked(&mut current).await
            }
            _ => false,
        }
    }

    async fn clear_locked(&self, current: &mut Option<TokenPair>) -> bool {
        if current.is_none() {
            return false;
        }

        if let Err(e) = self.storage.remove().await {
            warn!(error = %e, "Failed to remove persisted session");
        }
        *current = None;
        info!("Session cleared");
        self.notify(SessionEvent::SignedOut);
        true
    }

    async fn store_locked(&self, current: &mut Option<TokenPair>, pair: TokenPair) {
        let event = match current.as_ref() {
            None => Some(SessionEvent::SignedIn),
            Some(existing) if *existing == pair => None,
            Some(_) => Some(SessionEvent::TokensRotated),
        };

        let Some(event) = event else {
            return;
        };

        if let Err(e) = self.storage.save(&PersistedSession::from(&pair)).await {
            // The in-memory session stays authoritative for this process
            warn!(error = %e, "Failed to persist session");
        }
        *current = Some(pair);
        self.notify(event);
    }

    fn notify(&self, event: SessionEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}
