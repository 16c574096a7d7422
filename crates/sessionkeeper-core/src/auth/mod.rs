//! Session and token lifecycle.
//!
//! This module provides:
//! - `decode_claims`: read a bearer token's `exp` without verifying it
//! - `RefreshPolicy`: classify a token as fresh, near expiry or expired
//! - `TokenStore`: the current access/refresh pair, persisted and observable
//! - `SessionStorage` backends: plain file, encrypted file, OS keychain, memory
//! - `SessionCoordinator`: single-flight refresh and sign-in/sign-out flows

pub mod claims;
pub mod coordinator;
pub mod error;
pub mod policy;
pub mod session;
pub mod storage;
pub mod store;

pub use claims::{decode_claims, Claims, DecodeError};
pub use coordinator::{SessionCoordinator, SessionOptions, DEFAULT_REFRESH_TIMEOUT_SECS};
pub use error::AuthError;
pub use policy::{classify, Clock, Freshness, ManualClock, RefreshPolicy, SystemClock};
pub use session::{PersistedSession, Session, SessionEvent, SessionStatus, TokenPair};
pub use storage::{
    EncryptedFileStorage, FileStorage, KeyringStorage, MemoryStorage, SessionStorage, DEFAULT_NAMESPACE,
};
pub use store::TokenStore;
