use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue, USER_AGENT};
use http::Method;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::auth::Auth;
use crate::backoff::{
    BackoffStrategy, ConstantBackoff, ExponentialJitterBackoff, JitterSource, LinearJitterBackoff,
};
use crate::body::DEFAULT_DRAIN_LIMIT;
use crate::error::Failure;
use crate::proxy::ProxyConfig;
use crate::request::Request;
use crate::response::Response;
use crate::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::transport::{HyperTransport, Transport, TransportConfig};
use crate::util::parse_header_value;

const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_USER_AGENT: &str = concat!("resend/", env!("CARGO_PKG_VERSION"));

pub struct ClientBuilder {
    max_retries: u32,
    retry_policy: Arc<dyn RetryPolicy>,
    backoff_strategy: Arc<dyn BackoffStrategy>,
    auth: Option<Auth>,
    transport: Option<Arc<dyn Transport>>,
    transport_config: TransportConfig,
    user_agent: String,
    drain_limit: usize,
    dump_wire: bool,
    jitter_source: Arc<JitterSource>,
}

impl ClientBuilder {
    pub(crate) fn new() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_policy: Arc::new(DefaultRetryPolicy),
            backoff_strategy: Arc::new(ConstantBackoff::default()),
            auth: None,
            transport: None,
            transport_config: TransportConfig::default(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            drain_limit: DEFAULT_DRAIN_LIMIT,
            dump_wire: false,
            jitter_source: Arc::new(JitterSource::from_time()),
        }
    }

    /// Retries after the first attempt; `0` sends exactly once.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_policy<P>(self, retry_policy: P) -> Self
    where
        P: RetryPolicy + 'static,
    {
        self.retry_policy_arc(Arc::new(retry_policy))
    }

    pub fn retry_policy_arc(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn backoff_strategy<B>(self, backoff_strategy: B) -> Self
    where
        B: BackoffStrategy + 'static,
    {
        self.backoff_strategy_arc(Arc::new(backoff_strategy))
    }

    pub fn backoff_strategy_arc(mut self, backoff_strategy: Arc<dyn BackoffStrategy>) -> Self {
        self.backoff_strategy = backoff_strategy;
        self
    }

    /// Jittered exponential backoff drawing from this builder's random source.
    pub fn exponential_jitter_backoff(&self) -> ExponentialJitterBackoff {
        ExponentialJitterBackoff::new(Arc::clone(&self.jitter_source))
    }

    /// Jittered linear backoff drawing from this builder's random source.
    pub fn linear_jitter_backoff(&self) -> LinearJitterBackoff {
        LinearJitterBackoff::new(Arc::clone(&self.jitter_source))
    }

    pub fn jitter_source(mut self, jitter_source: Arc<JitterSource>) -> Self {
        self.jitter_source = jitter_source;
        self
    }

    pub fn basic_auth(self, username: &str, password: &str) -> Self {
        self.auth(Auth::basic(username, password))
    }

    pub fn bearer_auth(self, token: impl Into<String>) -> Self {
        self.auth(Auth::bearer(token))
    }

    pub fn custom_auth(self, scheme: impl Into<String>, token: impl Into<String>) -> Self {
        self.auth(Auth::custom(scheme, token))
    }

    pub fn auth(mut self, auth: Auth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Replaces the default hyper transport. Transport tuning setters are
    /// ignored when a custom transport is installed.
    pub fn transport<T>(self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.transport_arc(Arc::new(transport))
    }

    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.transport_config.connect_timeout = connect_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn tcp_keepalive(mut self, tcp_keepalive: Duration) -> Self {
        self.transport_config.tcp_keepalive = tcp_keepalive.max(Duration::from_millis(1));
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.transport_config.pool_idle_timeout = pool_idle_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.transport_config.pool_max_idle_per_host = pool_max_idle_per_host.max(1);
        self
    }

    /// Stops after `max_redirects` requests in one redirect chain; see
    /// [`TransportConfig::max_redirects`].
    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.transport_config.max_redirects = max_redirects;
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.transport_config.request_timeout = Some(request_timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn tls_handshake_timeout(mut self, tls_handshake_timeout: Duration) -> Self {
        self.transport_config.tls_handshake_timeout =
            tls_handshake_timeout.max(Duration::from_millis(1));
        self
    }

    /// Uses `proxy` instead of the proxy environment variables. An empty
    /// [`ProxyConfig`] connects directly.
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.transport_config.proxy = Some(proxy);
        self
    }

    /// Whether `HTTP_PROXY`, `HTTPS_PROXY` and `NO_PROXY` are honoured when
    /// no explicit proxy is set. On by default.
    pub fn proxy_from_env(mut self, proxy_from_env: bool) -> Self {
        self.transport_config.proxy_from_env = proxy_from_env;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Bytes read from a discarded response body before it is dropped.
    pub fn drain_limit(mut self, drain_limit: usize) -> Self {
        self.drain_limit = drain_limit;
        self
    }

    /// Captures the raw request and response of the final attempt.
    pub fn dump_wire(mut self, dump_wire: bool) -> Self {
        self.dump_wire = dump_wire;
        self
    }

    pub fn try_build(self) -> Result<Client> {
        let user_agent = parse_header_value(USER_AGENT.as_str(), &self.user_agent)?;
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new(self.transport_config)?),
        };

        Ok(Client {
            transport,
            retry_policy: self.retry_policy,
            backoff_strategy: self.backoff_strategy,
            max_retries: self.max_retries,
            auth: self.auth,
            user_agent,
            drain_limit: self.drain_limit,
            dump_wire: self.dump_wire,
        })
    }

    #[track_caller]
    pub fn build(self) -> Client {
        self.try_build().unwrap_or_else(|error| {
            panic!("failed to build resend client: {error}; use try_build() to handle configuration errors")
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClientBuilder")
            .field("max_retries", &self.max_retries)
            .field("auth", &self.auth)
            .field("transport_config", &self.transport_config)
            .field("user_agent", &self.user_agent)
            .field("drain_limit", &self.drain_limit)
            .field("dump_wire", &self.dump_wire)
            .finish_non_exhaustive()
    }
}

/// Executes requests with retries. Cheap to clone; clones share the
/// transport and its connection pool.
#[derive(Clone)]
pub struct Client {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) retry_policy: Arc<dyn RetryPolicy>,
    pub(crate) backoff_strategy: Arc<dyn BackoffStrategy>,
    pub(crate) max_retries: u32,
    pub(crate) auth: Option<Auth>,
    user_agent: HeaderValue,
    pub(crate) drain_limit: usize,
    pub(crate) dump_wire: bool,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn auth(&self) -> Option<&Auth> {
        self.auth.as_ref()
    }

    pub fn new_request(
        &self,
        cancellation: &CancellationToken,
        method: Method,
        uri: &str,
        body: Option<Bytes>,
    ) -> Result<Request> {
        let request = match body {
            Some(body) => Request::with_body(method, uri, body)?,
            None => Request::new(method, uri)?,
        };
        Ok(request.with_cancellation(cancellation.clone()))
    }

    pub fn new_json_request<T>(
        &self,
        cancellation: &CancellationToken,
        method: Method,
        uri: &str,
        payload: &T,
    ) -> Result<Request>
    where
        T: Serialize + ?Sized,
    {
        Ok(Request::with_json(method, uri, payload)?.with_cancellation(cancellation.clone()))
    }

    pub async fn get(
        &self,
        cancellation: &CancellationToken,
        uri: &str,
    ) -> std::result::Result<Response, Failure> {
        self.send_without_body(cancellation, Method::GET, uri).await
    }

    pub async fn head(
        &self,
        cancellation: &CancellationToken,
        uri: &str,
    ) -> std::result::Result<Response, Failure> {
        self.send_without_body(cancellation, Method::HEAD, uri).await
    }

    pub async fn delete(
        &self,
        cancellation: &CancellationToken,
        uri: &str,
    ) -> std::result::Result<Response, Failure> {
        self.send_without_body(cancellation, Method::DELETE, uri).await
    }

    pub async fn options(
        &self,
        cancellation: &CancellationToken,
        uri: &str,
    ) -> std::result::Result<Response, Failure> {
        self.send_without_body(cancellation, Method::OPTIONS, uri).await
    }

    /// Sends `body` encoded as JSON, labelled with `content_type`.
    pub async fn post<T>(
        &self,
        cancellation: &CancellationToken,
        uri: &str,
        content_type: &str,
        body: &T,
    ) -> std::result::Result<Response, Failure>
    where
        T: Serialize + ?Sized,
    {
        self.send_with_body(cancellation, Method::POST, uri, content_type, body)
            .await
    }

    pub async fn put<T>(
        &self,
        cancellation: &CancellationToken,
        uri: &str,
        content_type: &str,
        body: &T,
    ) -> std::result::Result<Response, Failure>
    where
        T: Serialize + ?Sized,
    {
        self.send_with_body(cancellation, Method::PUT, uri, content_type, body)
            .await
    }

    pub async fn patch<T>(
        &self,
        cancellation: &CancellationToken,
        uri: &str,
        content_type: &str,
        body: &T,
    ) -> std::result::Result<Response, Failure>
    where
        T: Serialize + ?Sized,
    {
        self.send_with_body(cancellation, Method::PATCH, uri, content_type, body)
            .await
    }

    async fn send_without_body(
        &self,
        cancellation: &CancellationToken,
        method: Method,
        uri: &str,
    ) -> std::result::Result<Response, Failure> {
        let request = self
            .new_request(cancellation, method, uri, None)?
            .header(USER_AGENT, self.user_agent.clone());
        self.execute(request).await
    }

    async fn send_with_body<T>(
        &self,
        cancellation: &CancellationToken,
        method: Method,
        uri: &str,
        content_type: &str,
        body: &T,
    ) -> std::result::Result<Response, Failure>
    where
        T: Serialize + ?Sized,
    {
        let content_type = parse_header_value(CONTENT_TYPE.as_str(), content_type)?;
        let request = self
            .new_json_request(cancellation, method, uri, body)?
            .header(CONTENT_TYPE, content_type)
            .header(USER_AGENT, self.user_agent.clone());
        self.execute(request).await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("max_retries", &self.max_retries)
            .field("auth", &self.auth)
            .field("user_agent", &self.user_agent)
            .field("drain_limit", &self.drain_limit)
            .field("dump_wire", &self.dump_wire)
            .finish_non_exhaustive()
    }
}

