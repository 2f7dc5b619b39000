use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, PROXY_AUTHORIZATION};
use http::{HeaderMap, Method, Uri};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::Result;
use crate::body::{
    DEFAULT_DRAIN_LIMIT, ReqBody, ResBody, box_res_body, buffered_req_body, drain_body,
};
use crate::error::{Error, TransportErrorKind};
use crate::proxy::{ProxyConfig, ProxyConnector};
use crate::util::{
    classify_transport_error, is_http_scheme, is_redirect_status, lock_unpoisoned,
    redact_uri_for_logs, redirect_location, redirect_method, resolve_redirect_uri, same_origin,
    sanitize_headers_for_redirect,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_MAX_REDIRECTS: usize = 10;
const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<http::Response<ResBody>>> + Send + 'a>>;

/// Sends one physical attempt.
///
/// Implementations are shared between concurrent executions and must be
/// safe to call from many tasks at once.
pub trait Transport: Send + Sync {
    fn send(&self, request: http::Request<Bytes>) -> TransportFuture<'_>;

    /// Releases pooled connections that are not currently in use.
    fn close_idle_connections(&self) {}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub tcp_keepalive: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    /// Cap on requests sent for one attempt, the original included. A
    /// redirect received once this many requests were sent fails with
    /// `Error::RedirectLimitExceeded`, so at most `max_redirects - 1`
    /// redirects are followed.
    pub max_redirects: usize,
    /// Applies to each hop separately; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Time allowed for the TLS handshake once the TCP connection is up.
    pub tls_handshake_timeout: Duration,
    /// Explicit proxies. When `None`, `proxy_from_env` decides.
    pub proxy: Option<ProxyConfig>,
    /// Reads `HTTP_PROXY`, `HTTPS_PROXY` and `NO_PROXY` when the transport
    /// is built and no explicit proxy is set.
    pub proxy_from_env: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tcp_keepalive: DEFAULT_TCP_KEEPALIVE,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            request_timeout: None,
            tls_handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
            proxy: None,
            proxy_from_env: true,
        }
    }
}

impl TransportConfig {
    fn resolve_proxy(&self) -> Result<Option<Arc<ProxyConfig>>> {
        let proxy = match &self.proxy {
            Some(proxy) => Some(proxy.clone()),
            None if self.proxy_from_env => ProxyConfig::from_env()?,
            None => None,
        };
        Ok(proxy.filter(|proxy| !proxy.is_empty()).map(Arc::new))
    }
}

fn default_pool_max_idle_per_host() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
        + 1
}

type HyperClient = Client<HttpsConnector<ProxyConnector>, ReqBody>;

/// Pooled hyper client over rustls that follows redirects.
pub struct HyperTransport {
    config: TransportConfig,
    proxy: Option<Arc<ProxyConfig>>,
    client: Mutex<HyperClient>,
}

impl HyperTransport {
    /// Fails with `Error::InvalidProxy` when proxy variables in the
    /// environment cannot be parsed.
    pub fn new(config: TransportConfig) -> Result<Self> {
        let proxy = config.resolve_proxy()?;
        let client = build_hyper_client(&config, proxy.clone())?;
        Ok(Self {
            config,
            proxy,
            client: Mutex::new(client),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn current_client(&self) -> HyperClient {
        lock_unpoisoned(&self.client).clone()
    }

    async fn send_following_redirects(
        &self,
        request: http::Request<Bytes>,
    ) -> Result<http::Response<ResBody>> {
        let client = self.current_client();
        let (parts, mut body) = request.into_parts();
        let mut method = parts.method;
        let mut uri = parts.uri;
        let mut headers = parts.headers;
        let mut redirect_count = 0_usize;

        loop {
            let redacted_uri = redact_uri_for_logs(&uri.to_string());
            if !is_http_scheme(&uri) {
                return Err(Error::UnsupportedScheme {
                    scheme: uri.scheme_str().unwrap_or_default().to_owned(),
                    method,
                    uri: redacted_uri,
                });
            }

            let proxy_authorization = self
                .proxy
                .as_deref()
                .and_then(|proxy| proxy.forward_authorization(&uri));
            let request = build_hyper_request(
                &method,
                &uri,
                &headers,
                proxy_authorization,
                body.clone(),
            )?;
            let response = self
                .send_once(&client, request, &method, &redacted_uri)
                .await?;
            let status = response.status();
            if !is_redirect_status(status) {
                return Ok(response.map(box_res_body));
            }

            // `redirect_count + 1` requests have been sent on this hop chain.
            if redirect_count + 1 >= self.config.max_redirects {
                return Err(Error::RedirectLimitExceeded {
                    max_redirects: self.config.max_redirects,
                    method,
                    uri: redacted_uri,
                });
            }
            let Some(location) = redirect_location(response.headers()) else {
                return Err(Error::MissingRedirectLocation {
                    status: status.as_u16(),
                    method,
                    uri: redacted_uri,
                });
            };
            let Some(next_uri) = resolve_redirect_uri(&uri, &location) else {
                return Err(Error::InvalidRedirectLocation {
                    location,
                    method,
                    uri: redacted_uri,
                });
            };
            if let Err(error) =
                drain_body(box_res_body(response.into_body()), DEFAULT_DRAIN_LIMIT).await
            {
                debug!(uri = %redacted_uri, error = %error, "failed to drain redirect body");
            }

            let next_method = redirect_method(&method, status);
            let method_changed_to_get = next_method == Method::GET && method != Method::GET;
            sanitize_headers_for_redirect(
                &mut headers,
                method_changed_to_get,
                same_origin(&uri, &next_uri),
            );
            if method_changed_to_get {
                body = Bytes::new();
            }
            debug!(
                method = %next_method,
                from = %redacted_uri,
                to = %redact_uri_for_logs(&next_uri.to_string()),
                status = status.as_u16(),
                "following redirect"
            );
            method = next_method;
            uri = next_uri;
            redirect_count += 1;
        }
    }

    async fn send_once(
        &self,
        client: &HyperClient,
        request: http::Request<ReqBody>,
        method: &Method,
        uri: &str,
    ) -> Result<http::Response<Incoming>> {
        let result = match self.config.request_timeout {
            Some(limit) => match timeout(limit, client.request(request)).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(Error::Transport {
                        kind: TransportErrorKind::Timeout,
                        method: method.clone(),
                        uri: uri.to_owned(),
                        source: Arc::new(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            format!("no response within {} ms", limit.as_millis()),
                        )),
                    });
                }
            },
            None => client.request(request).await,
        };
        result.map_err(|source| {
            let mut kind = classify_transport_error(&source);
            if source.is_connect()
                && matches!(kind, TransportErrorKind::Other | TransportErrorKind::Read)
            {
                kind = TransportErrorKind::Connect;
            }
            Error::Transport {
                kind,
                method: method.clone(),
                uri: uri.to_owned(),
                source: Arc::new(source),
            }
        })
    }
}

impl Transport for HyperTransport {
    fn send(&self, request: http::Request<Bytes>) -> TransportFuture<'_> {
        Box::pin(self.send_following_redirects(request))
    }

    /// Swaps in a fresh pool. Requests already holding the old pool finish
    /// on it; its idle connections close once the last of them drops it.
    fn close_idle_connections(&self) {
        match build_hyper_client(&self.config, self.proxy.clone()) {
            Ok(client) => *lock_unpoisoned(&self.client) = client,
            Err(error) => warn!(error = %error, "failed to rebuild connection pool"),
        }
    }
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HyperTransport")
            .field("config", &self.config)
            .field("proxy", &self.proxy)
            .finish_non_exhaustive()
    }
}

fn build_hyper_client(
    config: &TransportConfig,
    proxy: Option<Arc<ProxyConfig>>,
) -> Result<HyperClient> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(config.connect_timeout));
    http.set_keepalive(Some(config.tcp_keepalive));
    let connector = ProxyConnector::new(http, proxy, config.tls_handshake_timeout);
    let https = HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
        .map_err(|source| Error::TransportInit {
            message: source.to_string(),
        })?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(connector);
    Ok(Client::builder(TokioExecutor::new())
        .pool_timer(TokioTimer::new())
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .build(https))
}

fn build_hyper_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    proxy_authorization: Option<&HeaderValue>,
    body: Bytes,
) -> Result<http::Request<ReqBody>> {
    let mut request = http::Request::builder()
        .method(method.clone())
        .uri(uri.clone())
        .body(buffered_req_body(body))
        .map_err(|source| Error::RequestBuild {
            source: Arc::new(source),
        })?;
    *request.headers_mut() = headers.clone();
    if let Some(value) = proxy_authorization {
        request
            .headers_mut()
            .insert(PROXY_AUTHORIZATION, value.clone());
    }
    Ok(request)
}
