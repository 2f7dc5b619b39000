use std::sync::Arc;

use http::{Method, StatusCode};
use thiserror::Error;

use crate::response::Response;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub(crate) type SharedError = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Certificate,
    Timeout,
    Read,
    Other,
}

impl TransportErrorKind {
    /// Network-level failures worth surfacing when a retry is scheduled.
    pub const fn is_network(self) -> bool {
        matches!(
            self,
            Self::Dns | Self::Connect | Self::Tls | Self::Timeout | Self::Read
        )
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Certificate => "certificate",
            Self::Timeout => "timeout",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    SerializeJson,
    RequestBuild,
    InvalidHeaderName,
    InvalidHeaderValue,
    Transport,
    UnsupportedScheme,
    RedirectLimitExceeded,
    MissingRedirectLocation,
    InvalidRedirectLocation,
    UnexpectedStatus,
    RetriesExhausted,
    Cancelled,
    ReadBody,
    ResponseBodyTooLarge,
    Deserialize,
    BodyConsumed,
    TransportInit,
    InvalidProxy,
    InvalidNoProxyRule,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::SerializeJson => "serialize_json",
            Self::RequestBuild => "request_build",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::Transport => "transport",
            Self::UnsupportedScheme => "unsupported_scheme",
            Self::RedirectLimitExceeded => "redirect_limit_exceeded",
            Self::MissingRedirectLocation => "missing_redirect_location",
            Self::InvalidRedirectLocation => "invalid_redirect_location",
            Self::UnexpectedStatus => "unexpected_status",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Cancelled => "cancelled",
            Self::ReadBody => "read_body",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::Deserialize => "deserialize",
            Self::BodyConsumed => "body_consumed",
            Self::TransportInit => "transport_init",
            Self::InvalidProxy => "invalid_proxy",
            Self::InvalidNoProxyRule => "invalid_no_proxy_rule",
        }
    }
}

#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("failed to serialize request json: {source}")]
    Serialize {
        #[source]
        source: Arc<serde_json::Error>,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: Arc<http::Error>,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: Arc<http::header::InvalidHeaderName>,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: Arc<http::header::InvalidHeaderValue>,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: SharedError,
    },
    #[error("unsupported protocol scheme {scheme:?} for {method} {uri}")]
    UnsupportedScheme {
        scheme: String,
        method: Method,
        uri: String,
    },
    #[error("stopped after {max_redirects} redirects for {method} {uri}")]
    RedirectLimitExceeded {
        max_redirects: usize,
        method: Method,
        uri: String,
    },
    #[error("redirect response {status} missing location header for {method} {uri}")]
    MissingRedirectLocation {
        status: u16,
        method: Method,
        uri: String,
    },
    #[error("invalid redirect location {location} for {method} {uri}")]
    InvalidRedirectLocation {
        location: String,
        method: Method,
        uri: String,
    },
    #[error("unexpected HTTP status {}", status_line(*.status))]
    UnexpectedStatus { status: StatusCode },
    #[error("giving up after {attempts} attempt(s){}", last_status_suffix(*.status))]
    RetriesExhausted {
        attempts: usize,
        status: Option<StatusCode>,
    },
    #[error("request cancelled")]
    Cancelled,
    #[error("failed to read response body: {source}")]
    ReadBody {
        #[source]
        source: SharedError,
    },
    #[error("response body too large ({actual_bytes} bytes > {limit_bytes} bytes)")]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
    },
    #[error("failed to decode response json: {source}")]
    Deserialize {
        #[source]
        source: Arc<serde_json::Error>,
    },
    #[error("response body was already consumed")]
    BodyConsumed,
    #[error("failed to initialize http transport: {message}")]
    TransportInit { message: String },
    #[error("invalid proxy {proxy}: {reason}")]
    InvalidProxy { proxy: String, reason: String },
    #[error("invalid no_proxy rule: {rule}")]
    InvalidNoProxyRule { rule: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::Serialize { .. } => ErrorCode::SerializeJson,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::UnsupportedScheme { .. } => ErrorCode::UnsupportedScheme,
            Self::RedirectLimitExceeded { .. } => ErrorCode::RedirectLimitExceeded,
            Self::MissingRedirectLocation { .. } => ErrorCode::MissingRedirectLocation,
            Self::InvalidRedirectLocation { .. } => ErrorCode::InvalidRedirectLocation,
            Self::UnexpectedStatus { .. } => ErrorCode::UnexpectedStatus,
            Self::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::BodyConsumed => ErrorCode::BodyConsumed,
            Self::TransportInit { .. } => ErrorCode::TransportInit,
            Self::InvalidProxy { .. } => ErrorCode::InvalidProxy,
            Self::InvalidNoProxyRule { .. } => ErrorCode::InvalidNoProxyRule,
        }
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub const fn transport_error_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Terminal outcome of an execution that did not succeed.
///
/// Carries the determining error together with whatever response the last
/// attempt produced. The response body has already been drained, so only
/// its status and headers are meaningful.
#[derive(Debug)]
pub struct Failure {
    error: Error,
    response: Option<Response>,
    attempts: usize,
}

impl Failure {
    pub(crate) fn new(error: Error, response: Option<Response>, attempts: usize) -> Self {
        Self {
            error,
            response,
            attempts,
        }
    }

    pub fn error(&self) -> &Error {
        &self.error
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn into_response(self) -> Option<Response> {
        self.response
    }

    pub fn into_error(self) -> Error {
        self.error
    }

    /// Number of physical attempts made; zero when the request could not be built.
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.error, formatter)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        Self::new(error, None, 0)
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        failure.error
    }
}

pub(crate) fn status_line(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {reason}", status.as_u16()),
        None => status.as_u16().to_string(),
    }
}

fn last_status_suffix(status: Option<StatusCode>) -> String {
    status
        .map(|status| format!(" (last status: {})", status_line(status)))
        .unwrap_or_default()
}
