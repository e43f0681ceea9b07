use crate::auth::{Credential, SignOutHook};
use crate::error::{AuthExpiredError, CredentialError, RequestError, TransportError};
use crate::token::TokenProvider;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

pub use reqwest::Method;

/// Live response body.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

pub const AUTHORIZATION: &str = "Authorization";
pub const IDEMPOTENCY_KEY: &str = "Idempotency-Key";
const CONTENT_TYPE: &str = "Content-Type";

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// Sets `name`, replacing any earlier value.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_json(self, body: &Value) -> Result<Self, TransportError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|err| TransportError::Request(format!("unserializable body: {err}")))?;
        let mut request = self.with_header(CONTENT_TYPE, "application/json");
        request.body = Some(Bytes::from(bytes));
        Ok(request)
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Status line plus a body that is still being received.
pub struct HttpResponse {
    status: u16,
    body: ByteStream,
}

impl HttpResponse {
    pub fn new(status: u16, body: ByteStream) -> Self {
        Self { status, body }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    pub fn into_body(self) -> ByteStream {
        self.body
    }

    /// Buffers the remaining body.
    pub async fn bytes(self) -> Result<Bytes, TransportError> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T, TransportError> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|err| TransportError::Body(format!("invalid JSON response: {err}")))
    }

    /// Turns a non-2xx response into `TransportError::Status`, keeping the backend's detail.
    pub async fn error_for_status(self) -> Result<Self, TransportError> {
        if self.is_success() {
            return Ok(self);
        }
        let status = self.status;
        let bytes = self.bytes().await.unwrap_or_default();
        Err(TransportError::Status {
            status,
            message: error_detail(&bytes),
        })
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct ErrorDetail {
    detail: Value,
}

fn error_detail(bytes: &[u8]) -> String {
    if let Ok(parsed) = serde_json::from_slice::<ErrorDetail>(bytes) {
        return match parsed.detail {
            Value::String(text) => text,
            other => other.to_string(),
        };
    }
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.chars().count() > 200 {
        format!("{}…", text.chars().take(200).collect::<String>())
    } else {
        text.to_string()
    }
}

/// Sends one HTTP request. Implemented over reqwest, and by fakes in tests.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

pub struct ReqwestBackend {
    client: reqwest::Client,
}

impl ReqwestBackend {
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.request(request.method, request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from))
            .boxed();
        Ok(HttpResponse::new(status, body))
    }
}

/// Authorization retries consumed by one logical request.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext {
    retries: u32,
    max_retries: u32,
}

impl RetryContext {
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn exhausted(&self) -> bool {
        self.retries >= self.max_retries
    }

    fn record(&mut self) {
        self.retries += 1;
    }
}

/// Retry-on-unauthorized policy: on a 401 the credential is force-refreshed and
/// the identical request is sent again, at most `max_retries` times.
#[derive(Debug, Clone, Copy)]
pub struct UnauthorizedRetry {
    max_retries: u32,
}

impl Default for UnauthorizedRetry {
    fn default() -> Self {
        Self { max_retries: 1 }
    }
}

impl UnauthorizedRetry {
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn context(&self) -> RetryContext {
        RetryContext {
            retries: 0,
            max_retries: self.max_retries,
        }
    }

    /// `send` is called with the credential to attach; `refresh` produces a
    /// forced replacement after a 401.
    pub async fn execute<S, SF, R, RF>(
        &self,
        credential: Credential,
        mut send: S,
        mut refresh: R,
    ) -> Result<HttpResponse, RequestError>
    where
        S: FnMut(Credential) -> SF,
        SF: Future<Output = Result<HttpResponse, TransportError>>,
        R: FnMut() -> RF,
        RF: Future<Output = Result<Credential, CredentialError>>,
    {
        let mut retry = self.context();
        let mut response = send(credential).await?;
        while response.is_unauthorized() {
            if retry.exhausted() {
                return Err(AuthExpiredError::new("backend rejected the refreshed credential").into());
            }
            retry.record();
            drop(response);
            warn!(attempt = retry.retries(), "backend answered 401; forcing credential refresh");
            let credential = refresh().await.map_err(|err| {
                AuthExpiredError::new(format!("credential refresh after 401 failed: {err}"))
            })?;
            response = send(credential).await?;
        }
        Ok(response)
    }
}

/// Outbound requests with the current bearer credential attached.
#[derive(Clone)]
pub struct AuthenticatedHttpClient {
    backend: Arc<dyn HttpBackend>,
    tokens: TokenProvider,
    base_url: Url,
    retry: UnauthorizedRetry,
    sign_out: SignOutHook,
    timeout: Option<Duration>,
}

impl AuthenticatedHttpClient {
    pub fn new(
        backend: Arc<dyn HttpBackend>,
        tokens: TokenProvider,
        base_url: Url,
        sign_out: SignOutHook,
    ) -> Self {
        Self {
            backend,
            tokens,
            base_url,
            retry: UnauthorizedRetry::default(),
            sign_out,
            timeout: None,
        }
    }

    /// Deadline for buffered (non-streaming) calls.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn tokens(&self) -> &TokenProvider {
        &self.tokens
    }

    pub fn sign_out_hook(&self) -> &SignOutHook {
        &self.sign_out
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| TransportError::Request(format!("invalid path `{path}`: {err}")))
    }

    /// Builds an unauthenticated request for `path`.
    pub fn prepare(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<HttpRequest, TransportError> {
        let request = HttpRequest::new(method, self.endpoint(path)?);
        match body {
            Some(body) => request.with_json(body),
            None => Ok(request),
        }
    }

    /// The credential for a new request. A terminal credential failure signs out.
    pub async fn authorize(&self) -> Result<Credential, RequestError> {
        match self.tokens.get_token(false).await {
            Ok(credential) => Ok(credential),
            Err(err) => {
                if err.is_terminal() {
                    self.sign_out.sign_out(err.to_string());
                }
                Err(err.into())
            }
        }
    }

    /// Sends `request` with `credential`, retrying once after a forced refresh
    /// if the backend answers 401. Both attempts carry the same idempotency key.
    pub async fn execute(
        &self,
        credential: Credential,
        request: HttpRequest,
    ) -> Result<HttpResponse, RequestError> {
        let request = request.with_header(IDEMPOTENCY_KEY, Uuid::new_v4().to_string());
        debug!(method = %request.method, url = %request.url, "sending request");
        let result = self
            .retry
            .execute(
                credential,
                |credential| {
                    let attempt = request
                        .clone()
                        .with_header(AUTHORIZATION, credential.authorization_header());
                    self.backend.execute(attempt)
                },
                || self.tokens.get_token(true),
            )
            .await;
        if let Err(RequestError::AuthExpired(expired)) = &result {
            self.sign_out.sign_out(expired.reason.clone());
        }
        result
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<HttpResponse, RequestError> {
        let request = self.prepare(method, path, body)?;
        let credential = self.authorize().await?;
        self.execute(credential, request).await
    }

    async fn buffered(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<HttpResponse, RequestError> {
        let request = self.prepare(method, path, body)?.with_timeout(self.timeout);
        let credential = self.authorize().await?;
        let response = self.execute(credential, request).await?;
        Ok(response.error_for_status().await?)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestError> {
        let response = self.buffered(Method::GET, path, None).await?;
        Ok(response.json().await?)
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, RequestError> {
        let response = self.buffered(Method::POST, path, Some(body)).await?;
        Ok(response.json().await?)
    }

    pub async fn put_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, RequestError> {
        let response = self.buffered(Method::PUT, path, Some(body)).await?;
        Ok(response.json().await?)
    }

    pub async fn delete(&self, path: &str) -> Result<(), RequestError> {
        let response = self.buffered(Method::DELETE, path, None).await?;
        drop(response);
        Ok(())
    }
}
