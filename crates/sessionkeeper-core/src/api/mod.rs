//! HTTP side of the session: the `/auth/*` endpoint client and the request
//! authorizer every other API call goes through.
//!
//! The API uses JWT bearer token authentication. The refresh endpoint takes
//! the refresh token as its bearer credential.

pub mod authorizer;
pub mod client;
pub mod error;

pub use authorizer::{RequestAuthorizer, UnauthenticatedPolicy};
pub use client::{AuthApi, Credentials, HttpAuthApi, RefreshedTokens, REQUEST_TIMEOUT_SECS};
pub use error::ApiError;
