//! The single gate outbound API calls pass through.
//!
//! Every request is handed to [`RequestAuthorizer`], which asks the session
//! coordinator for a usable access token and attaches it as a bearer
//! credential. Application code never reads tokens itself.

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ApiError;
use crate::auth::{AuthError, SessionCoordinator};

/// What to do with a request when there is no usable session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnauthenticatedPolicy {
    /// Send without credentials and let the endpoint decide
    #[default]
    SendAnonymous,
    /// Fail before sending
    Reject,
}

/// Clone is cheap - the client and the session are both shared.
#[derive(Clone)]
pub struct RequestAuthorizer {
    client: Client,
    base_url: String,
    session: SessionCoordinator,
    policy: UnauthenticatedPolicy,
}

impl RequestAuthorizer {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        session: SessionCoordinator,
        policy: UnauthenticatedPolicy,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
            policy,
        }
    }

    pub fn session(&self) -> &SessionCoordinator {
        &self.session
    }

    pub fn policy(&self) -> UnauthenticatedPolicy {
        self.policy
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path))
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.client.post(self.url(path))
    }

    pub fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> RequestBuilder {
        self.post(path).json(body)
    }

    /// Attach `Authorization: Bearer <token>` to `request`.
    pub async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, AuthError> {
        match self.session.ensure_fresh_token().await {
            Ok(token) => Ok(request.bearer_auth(token)),
            Err(e) if e.is_terminal() => match self.policy {
                UnauthenticatedPolicy::SendAnonymous => {
                    debug!(reason = %e, "No session, sending request anonymously");
                    Ok(request)
                }
                UnauthenticatedPolicy::Reject => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Authorize and send, turning non-success statuses into errors.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, AuthError> {
        let response = self.authorize(request).await?.send().await.map_err(ApiError::from)?;
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }

    pub async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, AuthError> {
        let response = self.send(request).await?;
        let text = response.text().await.map_err(ApiError::from)?;
        serde_json::from_str(&text).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response: {}", e)).into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::client::tests::serve;
    use crate::auth::claims::tests::token_expiring_at;
    use crate::auth::coordinator::tests::{coordinator_with, issued_access_token, FakeApi, RefreshBehavior, NOW};
    use crate::auth::TokenPair;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_attaches_bearer_token() {
        let (base, seen) = serve(vec![(200, r#"{"id":1,"email":"a@a.com"}"#)]).await;
        let api = Arc::new(FakeApi::new(RefreshBehavior::Reject));
        let (session, _, _) =
            coordinator_with(api, Some(TokenPair::new(issued_access_token(), "r"))).await;
        let authorizer = RequestAuthorizer::new(Client::new(), base, session, UnauthenticatedPolicy::default());

        let me: serde_json::Value = authorizer.send_json(authorizer.post("/auth/me")).await.unwrap();
        assert_eq!(me["email"], "a@a.com");

        let seen = seen.lock().unwrap();
        assert!(seen[0].request_line.starts_with("POST /auth/me "));
        let expected = format!("Bearer {}", issued_access_token());
        assert_eq!(seen[0].header("authorization"), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn test_refreshes_before_attaching() {
        let (base, seen) = serve(vec![(200, "{}")]).await;
        let api = Arc::new(FakeApi::new(RefreshBehavior::Succeed { delay_ms: 0 }));
        let stale = TokenPair::new(token_expiring_at(NOW - 60), "r");
        let (session, _, _) = coordinator_with(api.clone(), Some(stale)).await;
        let authorizer = RequestAuthorizer::new(Client::new(), base, session, UnauthenticatedPolicy::Reject);

        authorizer.send(authorizer.get("/locations")).await.unwrap();
        assert_eq!(api.refresh_calls(), 1);
        let expected = format!("Bearer {}", issued_access_token());
        assert_eq!(seen.lock().unwrap()[0].header("authorization"), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn test_signed_out_sends_anonymously() {
        let (base, seen) = serve(vec![(200, "[]")]).await;
        let api = Arc::new(FakeApi::new(RefreshBehavior::Reject));
        let (session, _, _) = coordinator_with(api, None).await;
        let authorizer =
            RequestAuthorizer::new(Client::new(), base, session, UnauthenticatedPolicy::SendAnonymous);

        authorizer.send(authorizer.get("/earthquakes")).await.unwrap();
        assert_eq!(seen.lock().unwrap()[0].header("authorization"), None);
    }

    #[tokio::test]
    async fn test_signed_out_rejects_without_sending() {
        let api = Arc::new(FakeApi::new(RefreshBehavior::Reject));
        let (session, _, _) = coordinator_with(api, None).await;
        // nothing listens here; a request would fail with a network error
        let authorizer = RequestAuthorizer::new(
            Client::new(),
            "http://127.0.0.1:9",
            session,
            UnauthenticatedPolicy::Reject,
        );

        let err = authorizer.send(authorizer.get("/auth/me")).await.unwrap_err();
        assert!(matches!(err, AuthError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_rejected_refresh_surfaces_sign_out() {
        let api = Arc::new(FakeApi::new(RefreshBehavior::Reject));
        let stale = TokenPair::new(token_expiring_at(NOW - 1), "r");
        let (session, _, _) = coordinator_with(api, Some(stale)).await;
        let authorizer = RequestAuthorizer::new(
            Client::new(),
            "http://127.0.0.1:9",
            session.clone(),
            UnauthenticatedPolicy::Reject,
        );

        let err = authorizer.authorize(authorizer.get("/x")).await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshRejected));
        assert!(!session.is_signed_in().await);
    }

    #[tokio::test]
    async fn test_error_status_is_mapped() {
        let (base, _) = serve(vec![(404, r#"{"message":"no such location"}"#)]).await;
        let api = Arc::new(FakeApi::new(RefreshBehavior::Reject));
        let (session, _, _) =
            coordinator_with(api, Some(TokenPair::new(issued_access_token(), "r"))).await;
        let authorizer = RequestAuthorizer::new(Client::new(), base, session, UnauthenticatedPolicy::default());

        let err = authorizer.send(authorizer.get("/locations/9")).await.unwrap_err();
        assert!(matches!(err, AuthError::Api(ApiError::NotFound(_))));
    }
}
