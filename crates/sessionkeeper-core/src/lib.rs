//! Sessionkeeper core - client-side session and token lifecycle.
//!
//! Keeps an authenticated client's bearer credentials valid across any
//! number of concurrent API calls. Access tokens are refreshed shortly
//! before they expire, at most one refresh call is in flight at a time,
//! and a rejected refresh signs the session out.
//!
//! Every outbound request goes through [`api::RequestAuthorizer`]; the
//! session itself is driven by [`auth::SessionCoordinator`].

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiError, RequestAuthorizer, UnauthenticatedPolicy};
pub use auth::{AuthError, SessionCoordinator, SessionEvent, SessionStatus, TokenPair};
pub use config::Config;
