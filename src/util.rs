use std::error::Error as StdError;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use http::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HeaderName, HeaderValue, LOCATION,
    RETRY_AFTER,
};
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::error::{Error, TransportErrorKind};

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn redact_uri_for_logs(uri_text: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(uri_text) else {
        return uri_text.split('?').next().unwrap_or(uri_text).to_owned();
    };

    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.to_string()
}

pub(crate) fn parse_uri(uri_text: &str) -> Result<Uri, Error> {
    uri_text.parse().map_err(|_| Error::InvalidUri {
        uri: redact_uri_for_logs(uri_text),
    })
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, Error> {
    name.parse()
        .map_err(|source| Error::InvalidHeaderName {
            name: name.to_owned(),
            source: std::sync::Arc::new(source),
        })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, Error> {
    value
        .parse()
        .map_err(|source| Error::InvalidHeaderValue {
            name: name.to_owned(),
            source: std::sync::Arc::new(source),
        })
}

/// Server-provided wait for throttled (429) or unavailable (503) responses.
pub(crate) fn server_retry_after(
    status: StatusCode,
    headers: &HeaderMap,
    now: SystemTime,
) -> Option<Duration> {
    if status != StatusCode::TOO_MANY_REQUESTS && status != StatusCode::SERVICE_UNAVAILABLE {
        return None;
    }
    parse_retry_after(headers, now)
}

pub(crate) fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?;
    let raw_value = value.to_str().ok()?.trim();
    if let Ok(seconds) = raw_value.parse::<i64>() {
        return Some(Duration::from_secs(seconds.max(0).unsigned_abs()));
    }

    let date = httpdate::parse_http_date(raw_value).ok()?;
    match date.duration_since(now) {
        Ok(duration) => Some(duration),
        Err(_) => Some(Duration::ZERO),
    }
}

/// Classifies a transport failure by walking its source chain.
pub(crate) fn classify_transport_error(error: &(dyn StdError + 'static)) -> TransportErrorKind {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(error) = current {
        if let Some(io_error) = error.downcast_ref::<std::io::Error>() {
            if io_error.kind() == std::io::ErrorKind::TimedOut {
                return TransportErrorKind::Timeout;
            }
            // TLS connectors re-wrap handshake I/O errors without chaining them.
            if io_error
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<std::io::Error>())
                .is_some_and(|inner| inner.kind() == std::io::ErrorKind::TimedOut)
            {
                return TransportErrorKind::Timeout;
            }
            if let Some(rustls_error) = io_error
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<rustls::Error>())
            {
                return classify_rustls_error(rustls_error);
            }
        }
        if let Some(rustls_error) = error.downcast_ref::<rustls::Error>() {
            return classify_rustls_error(rustls_error);
        }
        current = error.source();
    }

    classify_transport_error_text(&error_chain_text(error))
}

fn classify_rustls_error(error: &rustls::Error) -> TransportErrorKind {
    match error {
        rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented => {
            TransportErrorKind::Certificate
        }
        _ => TransportErrorKind::Tls,
    }
}

fn classify_transport_error_text(text: &str) -> TransportErrorKind {
    if text.contains("unknownissuer")
        || text.contains("unknown issuer")
        || text.contains("invalid peer certificate")
        || text.contains("certificate verify failed")
    {
        return TransportErrorKind::Certificate;
    }
    if text.contains("dns")
        || text.contains("name or service not known")
        || text.contains("failed to lookup address")
    {
        return TransportErrorKind::Dns;
    }
    if text.contains("tls") || text.contains("handshake") {
        return TransportErrorKind::Tls;
    }
    if text.contains("timed out") || text.contains("timeout") {
        return TransportErrorKind::Timeout;
    }
    if text.contains("connection refused")
        || text.contains("tcp connect error")
        || text.contains("client error (connect)")
    {
        return TransportErrorKind::Connect;
    }
    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("connection closed")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
        || text.contains("incomplete message")
    {
        return TransportErrorKind::Read;
    }

    TransportErrorKind::Other
}

fn error_chain_text(error: &(dyn StdError + 'static)) -> String {
    let mut text = error.to_string();
    let mut current = error.source();
    while let Some(source) = current {
        text.push_str(": ");
        text.push_str(&source.to_string());
        current = source.source();
    }
    text.to_ascii_lowercase()
}

pub(crate) fn is_redirect_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

pub(crate) fn redirect_method(method: &Method, status: StatusCode) -> Method {
    match status {
        StatusCode::SEE_OTHER if *method != Method::HEAD => Method::GET,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND if *method == Method::POST => Method::GET,
        _ => method.clone(),
    }
}

pub(crate) fn redirect_location(headers: &HeaderMap) -> Option<String> {
    headers
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
}

pub(crate) fn default_port(uri: &Uri) -> Option<u16> {
    uri.port_u16().or_else(|| match uri.scheme_str() {
        Some(scheme) if scheme.eq_ignore_ascii_case("https") => Some(443),
        Some(scheme) if scheme.eq_ignore_ascii_case("http") => Some(80),
        _ => None,
    })
}

pub(crate) fn same_origin(left: &Uri, right: &Uri) -> bool {
    let left_scheme = left.scheme_str().unwrap_or_default();
    let right_scheme = right.scheme_str().unwrap_or_default();
    if !left_scheme.eq_ignore_ascii_case(right_scheme) {
        return false;
    }

    let left_host = left.host().unwrap_or_default();
    let right_host = right.host().unwrap_or_default();
    if !left_host.eq_ignore_ascii_case(right_host) {
        return false;
    }

    default_port(left) == default_port(right)
}

pub(crate) fn resolve_redirect_uri(current_uri: &Uri, location: &str) -> Option<Uri> {
    let base = url::Url::parse(&current_uri.to_string()).ok()?;
    let joined = base.join(location).ok()?;
    joined.as_str().parse().ok()
}

pub(crate) fn sanitize_headers_for_redirect(
    headers: &mut HeaderMap,
    method_changed_to_get: bool,
    same_origin_redirect: bool,
) {
    if method_changed_to_get {
        headers.remove(CONTENT_LENGTH);
        headers.remove(CONTENT_TYPE);
    }
    if !same_origin_redirect {
        headers.remove(AUTHORIZATION);
        headers.remove(COOKIE);
    }
}

pub(crate) fn is_http_scheme(uri: &Uri) -> bool {
    uri.scheme_str().is_some_and(|scheme| {
        scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https")
    })
}
