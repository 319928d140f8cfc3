use crate::api::cache::FetchCache;
use crate::api::error::{FetchError, TransportError};
use crate::api::interceptor::{ErrorInterceptor, Notice};
use crate::api::session::Session;
use crate::api::transport::{ApiRequest, HttpTransport, Method, Transport};
use crate::core::settings::Settings;
use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(9);

/// Options recognised by every request.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub headers: Vec<(String, String)>,
    /// Part of a recurring background cycle; counts towards the
    /// connection-lost warning.
    pub poller: bool,
    /// `false` suppresses user-facing notices for this call.
    pub intercept: bool,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            poller: false,
            intercept: true,
        }
    }
}

impl RequestConfig {
    pub fn poller() -> Self {
        Self {
            poller: true,
            ..Self::default()
        }
    }

    pub fn without_intercept() -> Self {
        Self {
            intercept: false,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    Changed(Value),
    /// The server confirmed the cached validator; the caller's last payload
    /// is still current.
    Unchanged,
}

pub type FetchResult = Result<Fetched, FetchError>;

/// Callback-style delivery of a [`FetchResult`]: exactly one callback runs,
/// or neither for an unchanged resource.
pub trait Resolve {
    fn resolve<S, E>(self, on_success: S, on_error: E)
    where
        S: FnOnce(Value),
        E: FnOnce(&FetchError);
}

impl Resolve for FetchResult {
    fn resolve<S, E>(self, on_success: S, on_error: E)
    where
        S: FnOnce(Value),
        E: FnOnce(&FetchError),
    {
        match self {
            Ok(Fetched::Changed(payload)) => on_success(payload),
            Ok(Fetched::Unchanged) => {}
            Err(error) => on_error(&error),
        }
    }
}

#[derive(Clone)]
pub struct FetchClient {
    base_url: Arc<str>,
    timeout: Duration,
    transport: Arc<dyn Transport>,
    cache: FetchCache,
    interceptor: Arc<ErrorInterceptor>,
}

impl FetchClient {
    pub fn new(transport: Arc<dyn Transport>, base_url: &str) -> Self {
        Self {
            base_url: Arc::from(base_url.trim_end_matches('/')),
            timeout: DEFAULT_TIMEOUT,
            transport,
            cache: FetchCache::new(),
            interceptor: Arc::new(ErrorInterceptor::new(Session::default())),
        }
    }

    pub fn from_settings(
        settings: &Settings,
        notices: mpsc::UnboundedSender<Notice>,
    ) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new()?);
        let session = Session::new(settings.server.token.clone());
        let interceptor = ErrorInterceptor::new(session).with_notices(notices);

        Ok(Self::new(transport, &settings.server.base_url)
            .with_timeout(settings.request_timeout())
            .with_interceptor(interceptor))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interceptor(mut self, interceptor: ErrorInterceptor) -> Self {
        self.interceptor = Arc::new(interceptor);
        self
    }

    pub fn cache(&self) -> &FetchCache {
        &self.cache
    }

    pub fn session(&self) -> &Session {
        self.interceptor.session()
    }

    pub fn interceptor(&self) -> &ErrorInterceptor {
        &self.interceptor
    }

    pub fn flush_cache(&self) {
        self.cache.flush();
    }

    pub fn url(&self, uri: &str) -> String {
        format!("{}/{}", self.base_url, uri.trim_start_matches('/'))
    }

    pub async fn get(&self, uri: &str, config: &RequestConfig) -> FetchResult {
        self.execute(Method::Get, uri, None, config).await
    }

    pub async fn post(&self, uri: &str, body: Option<Value>, config: &RequestConfig) -> FetchResult {
        self.execute(Method::Post, uri, body, config).await
    }

    pub async fn put(&self, uri: &str, body: Option<Value>, config: &RequestConfig) -> FetchResult {
        self.execute(Method::Put, uri, body, config).await
    }

    pub async fn delete(
        &self,
        uri: &str,
        body: Option<Value>,
        config: &RequestConfig,
    ) -> FetchResult {
        self.execute(Method::Delete, uri, body, config).await
    }

    async fn execute(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        config: &RequestConfig,
    ) -> FetchResult {
        let mut headers = Vec::with_capacity(config.headers.len() + 2);
        if let Some(token) = self.session().token() {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }
        if method == Method::Get {
            if let Some(tag) = self.cache.validator(uri) {
                headers.push(("If-None-Match".to_string(), tag));
            }
        }
        headers.extend(config.headers.iter().cloned());

        if !config.poller {
            tracing::debug!(%method, uri, "Sending request");
        }

        let request = ApiRequest {
            method,
            url: self.url(uri),
            headers,
            body,
            timeout: self.timeout,
        };

        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(cause) => return self.fail(method, uri, FetchError::Network(cause), config),
        };

        match response.status {
            200..=299 => {
                if method == Method::Get {
                    self.cache
                        .remember(uri, response.etag.as_deref(), response.allow.as_deref());
                } else {
                    self.cache.replace_validator(uri, response.etag.as_deref());
                    self.cache.remember(uri, None, response.allow.as_deref());
                }
                Ok(Fetched::Changed(decode_body(&response.body)))
            }
            304 => {
                tracing::trace!(uri, "Resource not modified");
                Ok(Fetched::Unchanged)
            }
            300..=399 => {
                let cause = TransportError::Redirect(format!("status {}", response.status));
                self.fail(method, uri, FetchError::Network(cause), config)
            }
            status => {
                let error = FetchError::from_status(status, decode_body(&response.body));
                self.fail(method, uri, error, config)
            }
        }
    }

    fn fail(
        &self,
        method: Method,
        uri: &str,
        error: FetchError,
        config: &RequestConfig,
    ) -> FetchResult {
        self.interceptor.intercept(method, uri, &error, config);
        Err(error)
    }
}

fn decode_body(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::fake::{FakeTransport, Scripted, BASE_URL};
    use serde_json::json;

    fn client(transport: &Arc<FakeTransport>) -> FetchClient {
        FetchClient::new(transport.clone(), BASE_URL)
    }

    #[tokio::test]
    async fn test_get_stores_validator_and_sends_it_back() {
        let transport = FakeTransport::new();
        transport.push(
            "adapters",
            Scripted::json_with_etag(json!({"a": 1}), "v1").with_allow("GET, PUT"),
        );
        transport.push("adapters", Scripted::not_modified());
        let client = client(&transport);

        let first = client.get("adapters", &RequestConfig::default()).await;
        assert_eq!(first, Ok(Fetched::Changed(json!({"a": 1}))));
        assert!(transport.last("adapters").unwrap().header("If-None-Match").is_none());
        assert_eq!(client.cache().validator("adapters").as_deref(), Some("v1"));
        assert_eq!(
            client.cache().allowed_methods("adapters"),
            Some(vec!["GET".to_string(), "PUT".to_string()])
        );

        let second = client.get("adapters", &RequestConfig::poller()).await;
        assert_eq!(second, Ok(Fetched::Unchanged));
        assert_eq!(
            transport.last("adapters").unwrap().header("If-None-Match"),
            Some("v1")
        );
    }

    #[tokio::test]
    async fn test_not_modified_fires_neither_callback() {
        let transport = FakeTransport::new();
        transport.push("adapters", Scripted::json_with_etag(json!({"state": "old"}), "v1"));
        transport.push("adapters", Scripted::not_modified());
        let client = client(&transport);

        let mut held = Value::Null;
        client
            .get("adapters", &RequestConfig::default())
            .await
            .resolve(|payload| held = payload, |_| panic!("unexpected error"));
        assert_eq!(held, json!({"state": "old"}));

        let mut successes = 0;
        let mut errors = 0;
        client
            .get("adapters", &RequestConfig::default())
            .await
            .resolve(|_| successes += 1, |_| errors += 1);
        assert_eq!((successes, errors), (0, 0));
        assert_eq!(held, json!({"state": "old"}));
    }

    #[tokio::test]
    async fn test_errors_resolve_through_error_callback() {
        let transport = FakeTransport::new();
        transport.push("adapters", Scripted::status(500, json!({"error": "boom"})));
        transport.push("adapters", Scripted::network());
        let client = client(&transport);

        let mut status = 0;
        client
            .get("adapters", &RequestConfig::default())
            .await
            .resolve(|_| panic!("unexpected success"), |e| status = e.status());
        assert_eq!(status, 500);

        let result = client.get("adapters", &RequestConfig::default()).await;
        assert!(result.unwrap_err().is_network());
        assert!(client.cache().validator("adapters").is_none());
    }

    #[tokio::test]
    async fn test_unfollowed_redirect_is_a_network_error() {
        let transport = FakeTransport::new();
        transport.push("adapters", Scripted::status(302, Value::Null));
        let client = client(&transport);

        let err = client
            .get("adapters", &RequestConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.status(), -1);
    }

    #[tokio::test]
    async fn test_mutations_replace_validator_and_send_body() {
        let transport = FakeTransport::new();
        transport.push("configurations", Scripted::json_with_etag(json!([]), "v1"));
        transport.push("configurations", Scripted::json(json!({"status": "ok"})));
        let client = client(&transport);

        client
            .get("configurations", &RequestConfig::default())
            .await
            .unwrap();
        assert!(client.cache().validator("configurations").is_some());

        let body = json!({"action": "reload"});
        client
            .put("configurations", Some(body.clone()), &RequestConfig::default())
            .await
            .unwrap();

        let sent = transport.last("configurations").unwrap();
        assert_eq!(sent.method, Method::Put);
        assert_eq!(sent.body, Some(body));
        assert!(sent.header("If-None-Match").is_none());
        assert!(client.cache().validator("configurations").is_none());
    }

    #[tokio::test]
    async fn test_headers_token_and_body_decoding() {
        let transport = FakeTransport::new();
        transport.push("logs", Scripted::status(200, Value::String("plain".into())));
        transport.push("jobs", Scripted::status(204, Value::Null));
        let client = client(&transport);
        client.session().set_token("secret".to_string());

        let config = RequestConfig::default().with_header("X-Trace", "1");
        let result = client.get("/logs", &config).await;
        // A JSON string body decodes to the string itself.
        assert_eq!(result, Ok(Fetched::Changed(json!("plain"))));

        let sent = transport.last("logs").unwrap();
        assert_eq!(sent.header("authorization"), Some("Bearer secret"));
        assert_eq!(sent.header("X-Trace"), Some("1"));
        assert_eq!(sent.timeout, DEFAULT_TIMEOUT);

        let result = client.delete("jobs", None, &RequestConfig::default()).await;
        assert_eq!(result, Ok(Fetched::Changed(Value::Null)));
    }

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body(""), Value::Null);
        assert_eq!(decode_body("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(decode_body("not json"), json!("not json"));
    }
}
