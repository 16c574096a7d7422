//! Client for the `/auth/*` endpoints.
//!
//! The session coordinator talks to the server only through the [`AuthApi`]
//! trait, so tests can substitute a scripted endpoint.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use super::ApiError;
use crate::auth::TokenPair;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Result of a refresh call. The refresh token is only present when the
/// server rotates it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RefreshedTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct PairResponse {
    access_token: String,
    refresh_token: String,
}

/// Registration may or may not sign the user in directly.
#[derive(Deserialize)]
struct RegisterResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<TokenPair, ApiError>;

    /// Returns the issued pair when the server signs the new user in.
    async fn register(&self, credentials: &Credentials) -> Result<Option<TokenPair>, ApiError>;

    async fn google(&self, code: &str, state: &str) -> Result<TokenPair, ApiError>;

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, ApiError>;

    async fn logout(&self, access_token: &str) -> Result<(), ApiError>;
}

/// `AuthApi` over HTTP.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpAuthApi {
    client: Client,
    base_url: String,
}

impl HttpAuthApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Share an existing connection pool.
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn parse<T: DeserializeOwned>(response: Response, url: &str) -> Result<T, ApiError> {
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e))
        })
    }

    /// POST with exponential backoff on 429.
    async fn post_with_retry<T: DeserializeOwned + Send, B: Serialize + Sync>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<T, ApiError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = self
                .client
                .post(url)
                .header(header::ACCEPT, "application/json")
                .query(query);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(ApiError::RateLimited);
                }
                warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2; // Exponential backoff
                continue;
            }

            let response = Self::check_response(response).await?;
            return Self::parse(response, url).await;
        }
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn login(&self, credentials: &Credentials) -> Result<TokenPair, ApiError> {
        let url = self.url("/auth/login");
        debug!(email = %credentials.email, "Signing in");
        let pair: PairResponse = self.post_with_retry(&url, &[], Some(credentials)).await?;
        Ok(TokenPair::new(pair.access_token, pair.refresh_token))
    }

    async fn register(&self, credentials: &Credentials) -> Result<Option<TokenPair>, ApiError> {
        let url = self.url("/auth/register");
        debug!(email = %credentials.email, "Registering");
        let response: RegisterResponse = self.post_with_retry(&url, &[], Some(credentials)).await?;
        Ok(match (response.access_token, response.refresh_token) {
            (Some(access), Some(refresh)) => Some(TokenPair::new(access, refresh)),
            _ => None,
        })
    }

    async fn google(&self, code: &str, state: &str) -> Result<TokenPair, ApiError> {
        let url = self.url("/auth/google");
        let pair: PairResponse = self
            .post_with_retry::<_, ()>(&url, &[("code", code), ("state", state)], None)
            .await?;
        Ok(TokenPair::new(pair.access_token, pair.refresh_token))
    }

    /// The refresh token rides in the `Authorization` header, not the body.
    /// No retry here: the coordinator owns timeout and failure policy.
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, ApiError> {
        let url = self.url("/auth/refresh");
        let response = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .bearer_auth(refresh_token)
            .send()
            .await?;
        let response = Self::check_response(response).await?;
        Self::parse(response, &url).await
    }

    async fn logout(&self, access_token: &str) -> Result<(), ApiError> {
        let url = self.url("/auth/logout");
        let response = self.client.post(&url).bearer_auth(access_token).send().await?;
        Self::check_response(response).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Request line, headers and body as seen by the test server.
    #[derive(Debug, Clone)]
    pub(crate) struct SeenRequest {
        pub request_line: String,
        pub headers: Vec<(String, String)>,
        pub body: String,
    }

    impl SeenRequest {
        pub(crate) fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }
    }

    /// Serve one canned response per connection, in order, recording requests.
    pub(crate) async fn serve(
        responses: Vec<(u16, &'static str)>,
    ) -> (String, Arc<Mutex<Vec<SeenRequest>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_server = seen.clone();

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let request = read_request(&mut socket).await;
                seen_by_server.lock().unwrap().push(request);
                let reply = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}", addr), seen)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> SeenRequest {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let header_end = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break buf.len();
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default().to_string();
        let headers: Vec<(String, String)> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();

        let content_length = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse::<usize>().ok())
            .unwrap_or(0);
        let mut body = buf[header_end.min(buf.len())..].to_vec();
        while body.len() < content_length {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }

        SeenRequest {
            request_line,
            headers,
            body: String::from_utf8_lossy(&body).to_string(),
        }
    }

    #[tokio::test]
    async fn test_login_posts_credentials() {
        let (base, seen) = serve(vec![(
            201,
            r#"{"status":"success","access_token":"acc","refresh_token":"ref"}"#,
        )])
        .await;
        let api = HttpAuthApi::new(format!("{}/", base)).unwrap();

        let pair = api.login(&Credentials::new("a@a.com", "123456")).await.unwrap();
        assert_eq!(pair, TokenPair::new("acc", "ref"));

        let seen = seen.lock().unwrap();
        assert!(seen[0].request_line.starts_with("POST /auth/login "));
        let body: serde_json::Value = serde_json::from_str(&seen[0].body).unwrap();
        assert_eq!(body, serde_json::json!({"email": "a@a.com", "password": "123456"}));
    }

    #[tokio::test]
    async fn test_refresh_sends_refresh_token_as_bearer() {
        let (base, seen) = serve(vec![(201, r#"{"status":"success","access_token":"new"}"#)]).await;
        let api = HttpAuthApi::new(base).unwrap();

        let refreshed = api.refresh("the-refresh-token").await.unwrap();
        assert_eq!(refreshed.access_token, "new");
        assert_eq!(refreshed.refresh_token, None);

        let seen = seen.lock().unwrap();
        assert!(seen[0].request_line.starts_with("POST /auth/refresh "));
        assert_eq!(seen[0].header("authorization"), Some("Bearer the-refresh-token"));
    }

    #[tokio::test]
    async fn test_refresh_rejection_maps_to_unauthorized() {
        let (base, _) = serve(vec![(401, r#"{"status":"fail","message":"expired"}"#)]).await;
        let api = HttpAuthApi::new(base).unwrap();
        let err = api.refresh("stale").await.unwrap_err();
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn test_register_without_tokens() {
        let (base, _) = serve(vec![(201, r#"{"status":"success","data":{"id":1,"email":"a@a.com"}}"#)]).await;
        let api = HttpAuthApi::new(base).unwrap();
        let issued = api.register(&Credentials::new("a@a.com", "pw")).await.unwrap();
        assert_eq!(issued, None);
    }

    #[tokio::test]
    async fn test_google_passes_code_and_state_in_query() {
        let (base, seen) = serve(vec![(201, r#"{"access_token":"g-acc","refresh_token":"g-ref"}"#)]).await;
        let api = HttpAuthApi::new(base).unwrap();
        let pair = api.google("abc", "xyz").await.unwrap();
        assert_eq!(pair, TokenPair::new("g-acc", "g-ref"));
        let seen = seen.lock().unwrap();
        assert!(seen[0].request_line.starts_with("POST /auth/google?code=abc&state=xyz "));
    }

    #[tokio::test]
    async fn test_unparseable_body_is_invalid_response() {
        let (base, _) = serve(vec![(200, "<html>oops</html>")]).await;
        let api = HttpAuthApi::new(base).unwrap();
        assert!(matches!(api.refresh("r").await, Err(ApiError::InvalidResponse(_))));
    }
}
