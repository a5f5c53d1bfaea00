//! Rate-limited HTTP access to the graph API with classified retries.

use crate::error::{GraphApiError, Result, ScanError};
use crate::result::NodeMetadata;
use reqwest::Client;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error};

pub const DEFAULT_GRAPH_URL: &str = "https://graph.facebook.com/v2.11";

/// Attempt ceilings and backoff for transient failures.
///
/// Each class of failure keeps its own attempt counter. The n-th retry of a
/// class waits `error_delay * n`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub too_much_data_attempts: u32,
    pub error_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            too_much_data_attempts: 4,
            error_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryClass {
    Connection,
    Status,
    Transient,
    TooMuchData,
    Permanent,
}

impl RetryClass {
    fn of(error: &ScanError) -> Self {
        match error {
            ScanError::Transport(e)
                if e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() =>
            {
                RetryClass::Connection
            }
            ScanError::RetryableStatus { .. } => RetryClass::Status,
            ScanError::RemoteProtocol(api) if api.is_too_much_data() => RetryClass::TooMuchData,
            ScanError::RemoteProtocol(api) if api.transient || api.is_unsupported_request() => {
                RetryClass::Transient
            }
            _ => RetryClass::Permanent,
        }
    }
}

#[derive(Debug, Default)]
struct Attempts {
    connection: u32,
    status: u32,
    transient: u32,
    too_much_data: u32,
}

#[derive(Debug, Clone, Copy)]
enum Method {
    Get,
    Post,
}

pub struct GraphClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    min_interval: Duration,
    retry: RetryPolicy,
    last_request: Mutex<Option<Instant>>,
    requests: AtomicUsize,
}

impl GraphClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        Self::with_timeout(base_url, token, 60)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("grapharc/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(timeout_secs / 2))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            min_interval: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            last_request: Mutex::new(None),
            requests: AtomicUsize::new(0),
        })
    }

    /// Minimum spacing between the start of consecutive requests.
    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn node_url(&self, node_id: &str) -> String {
        format!("{}/{}", self.base_url, node_id)
    }

    /// Number of HTTP requests sent so far, retries included.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    pub async fn get(&self, url: &str, params: &[(String, String)], use_token: bool) -> Result<Value> {
        self.execute(Method::Get, url, params, use_token).await
    }

    pub async fn post(&self, url: &str, params: &[(String, String)], use_token: bool) -> Result<Value> {
        self.execute(Method::Post, url, params, use_token).await
    }

    /// Raw `metadata=1` response for a node.
    pub async fn metadata(&self, node_id: &str) -> Result<Value> {
        let params = vec![("metadata".to_string(), "1".to_string())];
        self.get(&self.node_url(node_id), &params, true).await
    }

    pub async fn parsed_metadata(&self, node_id: &str) -> Result<NodeMetadata> {
        NodeMetadata::from_response(&self.metadata(node_id).await?)
    }

    /// The type the API declares for a node.
    pub async fn discover_type(&self, node_id: &str) -> Result<String> {
        Ok(self.parsed_metadata(node_id).await?.node_type)
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        params: &[(String, String)],
        use_token: bool,
    ) -> Result<Value> {
        let mut params = params.to_vec();
        if use_token && let Some(token) = &self.token {
            params.push(("access_token".to_string(), token.clone()));
        }

        let mut attempts = Attempts::default();
        loop {
            let error = match self.send_once(method, url, &params).await {
                Ok(body) => return Ok(body),
                Err(e) => e,
            };

            let class = RetryClass::of(&error);
            let (attempt, ceiling) = match class {
                RetryClass::Permanent => return Err(error),
                RetryClass::Connection => {
                    attempts.connection += 1;
                    (attempts.connection, self.retry.max_attempts)
                }
                RetryClass::Status => {
                    attempts.status += 1;
                    (attempts.status, self.retry.max_attempts)
                }
                RetryClass::Transient => {
                    attempts.transient += 1;
                    (attempts.transient, self.retry.max_attempts)
                }
                RetryClass::TooMuchData => {
                    attempts.too_much_data += 1;
                    (attempts.too_much_data, self.retry.too_much_data_attempts)
                }
            };

            error!("Caught {} on try {} for {}", error, attempt, url);
            if attempt >= ceiling {
                error!("Received too many errors for {} ({:?})", url, class);
                return Err(error);
            }
            tokio::time::sleep(self.retry.error_delay * attempt).await;
        }
    }

    async fn send_once(&self, method: Method, url: &str, params: &[(String, String)]) -> Result<Value> {
        self.throttle().await;
        self.requests.fetch_add(1, Ordering::Relaxed);
        debug!("{:?} {}", method, url);

        let request = match method {
            Method::Get => self.client.get(url).query(params),
            Method::Post => self.client.post(url).form(params),
        };
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| ScanError::Parse(format!("invalid JSON from {}: {}", url, e)));
        }

        if let Ok(json) = serde_json::from_str::<Value>(&body)
            && let Some(api_error) = GraphApiError::from_body(&json)
        {
            error!("Error for {}: {}", url, api_error);
            return Err(ScanError::RemoteProtocol(api_error));
        }

        let status = status.as_u16();
        let url = url.to_string();
        match status {
            408 | 503 | 504 => Err(ScanError::RetryableStatus { status, url }),
            _ => Err(ScanError::Status { status, url }),
        }
    }

    async fn throttle(&self) {
        let mut last_request = self.last_request.lock().await;
        if let Some(previous) = *last_request {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                debug!("Sleeping {:?}", wait);
                tokio::time::sleep(wait).await;
            }
        }
        *last_request = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use wiremock::{
        matchers::{body_string_contains, method, path, query_param},
        Mock, MockServer, Request, Respond, ResponseTemplate,
    };

    fn fast_client(uri: &str) -> GraphClient {
        GraphClient::new(uri, Some("secret".to_string()))
            .unwrap()
            .with_min_interval(Duration::ZERO)
            .with_retry_policy(RetryPolicy {
                max_attempts: 4,
                too_much_data_attempts: 2,
                error_delay: Duration::ZERO,
            })
    }

    /// Fails with `failure` until the `succeed_on`-th call.
    struct FailThenSucceed {
        calls: Arc<AtomicUsize>,
        succeed_on: usize,
        failure: ResponseTemplate,
    }

    impl Respond for FailThenSucceed {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                ResponseTemplate::new(200).set_body_json(json!({"id": "1"}))
            } else {
                self.failure.clone()
            }
        }
    }

    fn api_error(code: i64, transient: bool) -> ResponseTemplate {
        ResponseTemplate::new(400).set_body_json(json!({
            "error": {"message": "nope", "type": "OAuthException", "code": code, "is_transient": transient}
        }))
    }

    #[tokio::test]
    async fn test_token_is_sent() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/42"))
            .and(query_param("access_token", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "42"})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = fast_client(&mock_server.uri());
        let body = client.get(&client.node_url("42"), &[], true).await.unwrap();
        assert_eq!(body["id"], "42");
    }

    #[tokio::test]
    async fn test_post_sends_form() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/42"))
            .and(body_string_contains("fields=id"))
            .and(body_string_contains("access_token=secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "42"})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = fast_client(&mock_server.uri());
        let params = vec![("fields".to_string(), "id".to_string())];
        client.post(&client.node_url("42"), &params, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_retryable_status_hits_ceiling() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(4)
            .mount(&mock_server)
            .await;

        let client = fast_client(&mock_server.uri());
        let result = client.get(&client.node_url("42"), &[], true).await;
        assert!(matches!(result, Err(ScanError::RetryableStatus { status: 503, .. })));
        assert_eq!(client.request_count(), 4);
    }

    #[tokio::test]
    async fn test_retryable_status_recovers() {
        let mock_server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));
        Mock::given(method("GET"))
            .respond_with(FailThenSucceed {
                calls: calls.clone(),
                succeed_on: 4,
                failure: ResponseTemplate::new(504),
            })
            .mount(&mock_server)
            .await;

        let client = fast_client(&mock_server.uri());
        let body = client.get(&client.node_url("1"), &[], true).await.unwrap();
        assert_eq!(body["id"], "1");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    /// Plays `responses` in order, then succeeds.
    struct Sequence {
        calls: Arc<AtomicUsize>,
        responses: Vec<ResponseTemplate>,
    }

    impl Respond for Sequence {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses.get(call).cloned().unwrap_or_else(|| {
                ResponseTemplate::new(200).set_body_json(json!({"id": "1"}))
            })
        }
    }

    #[tokio::test]
    async fn test_connection_failure_hits_ceiling() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let uri = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let client = fast_client(&uri);
        let result = client.get(&client.node_url("1"), &[], true).await;
        assert!(matches!(result, Err(ScanError::Transport(_))));
        assert_eq!(client.request_count(), 4);
    }

    #[tokio::test]
    async fn test_retry_classes_count_separately() {
        let mock_server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));
        Mock::given(method("GET"))
            .respond_with(Sequence {
                calls: calls.clone(),
                responses: vec![
                    ResponseTemplate::new(503),
                    ResponseTemplate::new(503),
                    ResponseTemplate::new(503),
                    api_error(2, true),
                    api_error(2, true),
                    api_error(2, true),
                    api_error(1, false),
                ],
            })
            .mount(&mock_server)
            .await;

        let client = fast_client(&mock_server.uri());
        let body = client.get(&client.node_url("1"), &[], true).await.unwrap();
        assert_eq!(body["id"], "1");
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_permanent_api_error_not_retried() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(api_error(190, false))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = fast_client(&mock_server.uri());
        let error = client.get(&client.node_url("1"), &[], true).await.unwrap_err();
        assert_eq!(error.api_error().unwrap().code, 190);
    }

    #[tokio::test]
    async fn test_transient_api_error_retried() {
        let mock_server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));
        Mock::given(method("GET"))
            .respond_with(FailThenSucceed {
                calls: calls.clone(),
                succeed_on: 3,
                failure: api_error(2, true),
            })
            .mount(&mock_server)
            .await;

        let client = fast_client(&mock_server.uri());
        client.get(&client.node_url("1"), &[], true).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_too_much_data_has_lower_ceiling() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(api_error(1, false))
            .expect(2)
            .mount(&mock_server)
            .await;

        let client = fast_client(&mock_server.uri());
        let error = client.get(&client.node_url("1"), &[], true).await.unwrap_err();
        assert!(error.api_error().unwrap().is_too_much_data());
    }

    #[tokio::test]
    async fn test_other_status_is_permanent() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = fast_client(&mock_server.uri());
        let result = client.get(&client.node_url("1"), &[], false).await;
        assert!(matches!(result, Err(ScanError::Status { status: 404, .. })));
    }

    #[tokio::test]
    async fn test_requests_are_spaced() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&mock_server)
            .await;

        let client = fast_client(&mock_server.uri()).with_min_interval(Duration::from_millis(150));
        let start = std::time::Instant::now();
        for _ in 0..3 {
            client.get(&client.node_url("1"), &[], false).await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_discover_type() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cnn"))
            .and(query_param("metadata", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "5550296508",
                "metadata": {"type": "page", "fields": [], "connections": {}}
            })))
            .mount(&mock_server)
            .await;

        let client = fast_client(&mock_server.uri());
        assert_eq!(client.discover_type("cnn").await.unwrap(), "page");
    }
}
