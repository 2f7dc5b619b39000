use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use http::Uri;
use http::header::{HeaderValue, PROXY_AUTHORIZATION};
use hyper::rt::{Read as HyperRead, ReadBufCursor, Write as HyperWrite};
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use tokio::time::Sleep;
use tower_service::Service;
use url::Url;

use crate::Result;
use crate::auth::Auth;
use crate::error::{BoxError, Error};
use crate::util::{default_port, parse_header_value, redact_uri_for_logs};

const HTTP_PROXY_VARS: [&str; 2] = ["HTTP_PROXY", "http_proxy"];
const HTTPS_PROXY_VARS: [&str; 2] = ["HTTPS_PROXY", "https_proxy"];
const NO_PROXY_VARS: [&str; 2] = ["NO_PROXY", "no_proxy"];

/// Forward proxies for outgoing connections.
///
/// `http` destinations are forwarded to the HTTP proxy in absolute form.
/// `https` destinations are tunnelled through the HTTPS proxy with
/// `CONNECT`. Loopback destinations and hosts matching a no-proxy rule
/// always connect directly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    http: Option<ProxyEndpoint>,
    https: Option<ProxyEndpoint>,
    no_proxy_rules: Vec<NoProxyRule>,
}

impl ProxyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `HTTP_PROXY`, `HTTPS_PROXY` and `NO_PROXY`, falling back to
    /// their lowercase forms. `None` when neither proxy variable is set.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |names: [&str; 2]| {
            names
                .into_iter()
                .filter_map(&lookup)
                .map(|value| value.trim().to_owned())
                .find(|value| !value.is_empty())
        };

        let http = read(HTTP_PROXY_VARS);
        let https = read(HTTPS_PROXY_VARS);
        if http.is_none() && https.is_none() {
            return Ok(None);
        }

        let mut config = Self::new();
        if let Some(proxy) = http {
            config = config.http(&proxy)?;
        }
        if let Some(proxy) = https {
            config = config.https(&proxy)?;
        }
        if let Some(rules) = read(NO_PROXY_VARS) {
            config.no_proxy_rules = rules.split(',').filter_map(NoProxyRule::parse).collect();
        }
        Ok(Some(config))
    }

    /// Proxy for `http` destinations. Accepts `http://[user:pass@]host[:port]`
    /// or a bare `host:port`; credentials are sent as written.
    pub fn http(mut self, proxy: &str) -> Result<Self> {
        self.http = Some(ProxyEndpoint::parse(proxy)?);
        Ok(self)
    }

    /// Proxy for `https` destinations, reached with `CONNECT`.
    pub fn https(mut self, proxy: &str) -> Result<Self> {
        self.https = Some(ProxyEndpoint::parse(proxy)?);
        Ok(self)
    }

    /// Same proxy for both schemes.
    pub fn all(self, proxy: &str) -> Result<Self> {
        self.http(proxy)?.https(proxy)
    }

    /// Hosts reached directly, in `NO_PROXY` syntax: `*`, domains (which
    /// also match subdomains), `host:port`, IP addresses and CIDR blocks.
    pub fn no_proxy<I, S>(mut self, rules: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.no_proxy_rules = parse_no_proxy_rules(rules)?;
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.http.is_none() && self.https.is_none()
    }

    pub(crate) fn endpoint_for(&self, uri: &Uri) -> Option<&ProxyEndpoint> {
        let scheme = uri.scheme_str()?;
        let endpoint = if scheme.eq_ignore_ascii_case("https") {
            self.https.as_ref()
        } else if scheme.eq_ignore_ascii_case("http") {
            self.http.as_ref()
        } else {
            None
        };
        let endpoint = endpoint?;
        if is_loopback_host(uri) || should_bypass_proxy_uri(&self.no_proxy_rules, uri) {
            return None;
        }
        Some(endpoint)
    }

    /// `Proxy-Authorization` for a plain-http request forwarded to a proxy.
    /// Tunnelled requests authenticate on the `CONNECT` instead.
    pub(crate) fn forward_authorization(&self, uri: &Uri) -> Option<&HeaderValue> {
        if !uri
            .scheme_str()
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("http"))
        {
            return None;
        }
        self.endpoint_for(uri)?.authorization.as_ref()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ProxyEndpoint {
    pub(crate) uri: Uri,
    pub(crate) authorization: Option<HeaderValue>,
}

impl ProxyEndpoint {
    fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let invalid = |reason: &str| Error::InvalidProxy {
            proxy: redact_uri_for_logs(text),
            reason: reason.to_owned(),
        };

        let url = match Url::parse(text) {
            Ok(url) if url.has_host() => url,
            _ => Url::parse(&format!("http://{text}"))
                .map_err(|source| invalid(&source.to_string()))?,
        };
        if url.scheme() != "http" {
            return Err(invalid("only http proxies are supported"));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let uri = format!("http://{host}:{port}")
            .parse()
            .map_err(|_| invalid("invalid proxy address"))?;

        let authorization = if url.username().is_empty() {
            None
        } else {
            let auth = Auth::basic(url.username(), url.password().unwrap_or_default());
            let mut value = parse_header_value(
                PROXY_AUTHORIZATION.as_str(),
                &format!("{} {}", auth.scheme(), auth.token()),
            )?;
            value.set_sensitive(true);
            Some(value)
        };
        Ok(Self { uri, authorization })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum NoProxyRule {
    Any,
    Domain { host: String, port: Option<u16> },
    Network { address: IpAddr, prefix_len: u8 },
}

impl NoProxyRule {
    pub(crate) fn parse(text: &str) -> Option<Self> {
        let mut candidate = text.trim().to_owned();
        let mut port = None;
        if candidate.is_empty() {
            return None;
        }
        if candidate == "*" {
            return Some(Self::Any);
        }
        if let Some((address, prefix_len)) = candidate.split_once('/')
            && let Ok(address) = address.parse::<IpAddr>()
        {
            let prefix_len = prefix_len.parse::<u8>().ok()?;
            let max_len = if address.is_ipv4() { 32 } else { 128 };
            if prefix_len > max_len {
                return None;
            }
            return Some(Self::Network {
                address,
                prefix_len,
            });
        }
        if let Ok(url) = Url::parse(&candidate)
            && let Some(host) = url.host_str()
        {
            candidate = host.to_owned();
            port = url.port();
        }
        candidate = candidate.trim_start_matches('.').to_owned();
        if candidate.is_empty() {
            return None;
        }
        if let Some(stripped) = candidate.strip_prefix('[') {
            let end = stripped.find(']')?;
            let host = &stripped[..end];
            let suffix = &stripped[end + 1..];
            if suffix.is_empty() {
                port = None;
            } else if let Some(raw_port) = suffix.strip_prefix(':') {
                port = Some(raw_port.parse::<u16>().ok()?);
            } else {
                return None;
            }
            candidate = host.to_owned();
        } else if candidate.matches(':').count() == 1 {
            let (host, raw_port) = candidate.rsplit_once(':')?;
            if host.is_empty() {
                return None;
            }
            port = Some(raw_port.parse::<u16>().ok()?);
            candidate = host.to_owned();
        }
        if candidate.is_empty() {
            return None;
        }
        Some(Self::Domain {
            host: candidate.to_ascii_lowercase(),
            port,
        })
    }

    pub(crate) fn matches(&self, host: &str, port: Option<u16>) -> bool {
        match self {
            Self::Any => true,
            Self::Domain {
                host: domain,
                port: rule_port,
            } => {
                let host_matches = host == domain || host.ends_with(&format!(".{domain}"));
                if !host_matches {
                    return false;
                }
                match rule_port {
                    Some(rule_port) => port == Some(*rule_port),
                    None => true,
                }
            }
            Self::Network {
                address,
                prefix_len,
            } => host
                .parse::<IpAddr>()
                .is_ok_and(|candidate| in_network(candidate, *address, *prefix_len)),
        }
    }
}

fn in_network(candidate: IpAddr, network: IpAddr, prefix_len: u8) -> bool {
    match (candidate, network) {
        (IpAddr::V4(candidate), IpAddr::V4(network)) => {
            let mask = u32::MAX
                .checked_shl(32 - u32::from(prefix_len))
                .unwrap_or(0);
            u32::from(candidate) & mask == u32::from(network) & mask
        }
        (IpAddr::V6(candidate), IpAddr::V6(network)) => {
            let mask = u128::MAX
                .checked_shl(128 - u32::from(prefix_len))
                .unwrap_or(0);
            u128::from(candidate) & mask == u128::from(network) & mask
        }
        _ => false,
    }
}

fn normalized_host(uri: &Uri) -> Option<String> {
    let host = uri.host()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some(host.to_ascii_lowercase())
}

fn is_loopback_host(uri: &Uri) -> bool {
    normalized_host(uri).is_some_and(|host| {
        host == "localhost" || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
    })
}

pub(crate) fn should_bypass_proxy_uri(no_proxy_rules: &[NoProxyRule], uri: &Uri) -> bool {
    let Some(host) = normalized_host(uri) else {
        return false;
    };
    let port = default_port(uri);
    no_proxy_rules.iter().any(|rule| rule.matches(&host, port))
}

pub(crate) fn parse_no_proxy_rules<I, S>(rules: I) -> Result<Vec<NoProxyRule>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    rules
        .into_iter()
        .map(|rule| {
            let rule = rule.as_ref();
            NoProxyRule::parse(rule).ok_or_else(|| Error::InvalidNoProxyRule {
                rule: rule.to_owned(),
            })
        })
        .collect()
}

struct HandshakeDeadline {
    sleep: Pin<Box<Sleep>>,
    limit: Duration,
    established: AtomicBool,
}

/// Connection handed to the TLS layer.
///
/// For `https` destinations the deadline runs from the moment the TCP
/// connection (or proxy tunnel) is up until hyper takes the connection
/// over, which happens once the TLS handshake has completed.
pub(crate) struct ProxyConnection<T> {
    inner: T,
    proxied: bool,
    handshake: Option<HandshakeDeadline>,
}

impl<T> ProxyConnection<T> {
    fn new(inner: T, proxied: bool, handshake_timeout: Option<Duration>) -> Self {
        Self {
            inner,
            proxied,
            handshake: handshake_timeout.map(|limit| HandshakeDeadline {
                sleep: Box::pin(tokio::time::sleep(limit)),
                limit,
                established: AtomicBool::new(false),
            }),
        }
    }

    fn poll_handshake_deadline(&mut self, cx: &mut Context<'_>) -> std::io::Result<()> {
        let Some(deadline) = self.handshake.as_mut() else {
            return Ok(());
        };
        if deadline.established.load(Ordering::Acquire) {
            self.handshake = None;
            return Ok(());
        }
        match deadline.sleep.as_mut().poll(cx) {
            Poll::Ready(()) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!(
                    "TLS handshake timed out after {} ms",
                    deadline.limit.as_millis()
                ),
            )),
            Poll::Pending => Ok(()),
        }
    }
}

impl<T> HyperRead for ProxyConnection<T>
where
    T: HyperRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if let Err(error) = this.poll_handshake_deadline(cx) {
            return Poll::Ready(Err(error));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T> HyperWrite for ProxyConnection<T>
where
    T: HyperWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if let Err(error) = this.poll_handshake_deadline(cx) {
            return Poll::Ready(Err(error));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if let Err(error) = this.poll_handshake_deadline(cx) {
            return Poll::Ready(Err(error));
        }
        Pin::new(&mut this.inner).poll_write_vectored(cx, bufs)
    }
}

impl<T> Connection for ProxyConnection<T>
where
    T: Connection,
{
    fn connected(&self) -> Connected {
        if let Some(deadline) = &self.handshake {
            deadline.established.store(true, Ordering::Release);
        }
        self.inner.connected().proxy(self.proxied)
    }
}

type DirectConnection = <HttpConnector as Service<Uri>>::Response;

/// TCP connector that routes through the configured proxies and arms the
/// TLS handshake deadline for `https` destinations.
#[derive(Clone)]
pub(crate) struct ProxyConnector {
    direct: HttpConnector,
    proxy: Option<Arc<ProxyConfig>>,
    https_tunnel: Option<Tunnel<HttpConnector>>,
    tls_handshake_timeout: Duration,
}

impl ProxyConnector {
    pub(crate) fn new(
        direct: HttpConnector,
        proxy: Option<Arc<ProxyConfig>>,
        tls_handshake_timeout: Duration,
    ) -> Self {
        let https_tunnel = proxy
            .as_deref()
            .and_then(|config| config.https.as_ref())
            .map(|endpoint| {
                let tunnel = Tunnel::new(endpoint.uri.clone(), direct.clone());
                match &endpoint.authorization {
                    Some(authorization) => tunnel.with_auth(authorization.clone()),
                    None => tunnel,
                }
            });
        Self {
            direct,
            proxy,
            https_tunnel,
            tls_handshake_timeout,
        }
    }
}

impl Service<Uri> for ProxyConnector {
    type Response = ProxyConnection<DirectConnection>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        let direct = self.direct.poll_ready(cx)?;
        let tunnel = match &mut self.https_tunnel {
            Some(tunnel) => tunnel.poll_ready(cx)?,
            None => Poll::Ready(()),
        };
        if direct.is_ready() && tunnel.is_ready() {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let is_https = dst
            .scheme_str()
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https"));
        let handshake_timeout = is_https.then_some(self.tls_handshake_timeout);
        let endpoint = self
            .proxy
            .as_deref()
            .and_then(|config| config.endpoint_for(&dst))
            .map(|endpoint| endpoint.uri.clone());

        match (endpoint, &mut self.https_tunnel) {
            (Some(_), Some(tunnel)) if is_https => {
                let connecting = tunnel.call(normalize_tunnel_target_uri(dst));
                Box::pin(async move {
                    let connection = connecting.await.map_err(BoxError::from)?;
                    Ok::<_, BoxError>(ProxyConnection::new(
                        connection,
                        false,
                        handshake_timeout,
                    ))
                })
            }
            (Some(proxy_uri), _) if !is_https => {
                let connecting = self.direct.call(proxy_uri);
                Box::pin(async move {
                    let connection = connecting.await.map_err(BoxError::from)?;
                    Ok::<_, BoxError>(ProxyConnection::new(connection, true, None))
                })
            }
            _ => {
                let connecting = self.direct.call(dst);
                Box::pin(async move {
                    let connection = connecting.await.map_err(BoxError::from)?;
                    Ok::<_, BoxError>(ProxyConnection::new(
                        connection,
                        false,
                        handshake_timeout,
                    ))
                })
            }
        }
    }
}

/// `CONNECT` needs an explicit port.
pub(crate) fn normalize_tunnel_target_uri(dst: Uri) -> Uri {
    if dst.port().is_some() {
        return dst;
    }
    let (Some(port), Some(host)) = (default_port(&dst), dst.host()) else {
        return dst;
    };
    let authority_text = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let Ok(authority) = authority_text.parse() else {
        return dst;
    };
    let original = dst.clone();
    let mut parts = dst.into_parts();
    parts.authority = Some(authority);
    Uri::from_parts(parts).unwrap_or(original)
}
