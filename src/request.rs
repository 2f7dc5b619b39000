use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::auth::Auth;
use crate::error::Error;
use crate::util::{parse_header_name, parse_header_value, parse_uri, redact_uri_for_logs};

/// A logical request whose body can be replayed on every attempt.
///
/// The body is captured once as immutable [`Bytes`]; each attempt sends a
/// fresh view over the same buffer. `GET`, `HEAD`, `DELETE` and `OPTIONS`
/// requests never carry a body, whatever was passed at construction.
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Bytes>,
    content_length: u64,
    cancellation: CancellationToken,
}

impl Request {
    pub fn new(method: Method, uri: &str) -> Result<Self> {
        Ok(Self {
            method,
            uri: parse_uri(uri)?,
            headers: HeaderMap::new(),
            body: None,
            content_length: 0,
            cancellation: CancellationToken::new(),
        })
    }

    pub fn with_body(method: Method, uri: &str, body: impl Into<Bytes>) -> Result<Self> {
        let mut request = Self::new(method, uri)?;
        if method_allows_body(&request.method) {
            let body = body.into();
            request.content_length = body.len() as u64;
            request.body = Some(body);
        }
        Ok(request)
    }

    /// Encodes `payload` as JSON. Encoding is skipped for body-less methods.
    pub fn with_json<T>(method: Method, uri: &str, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        if !method_allows_body(&method) {
            return Self::new(method, uri);
        }
        let body = serde_json::to_vec(payload).map_err(|source| Error::Serialize {
            source: std::sync::Arc::new(source),
        })?;
        Self::with_body(method, uri, body)
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<&mut Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn set_headers<I, K, V>(&mut self, headers: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in headers {
            self.set_header(name.as_ref(), value.as_ref())?;
        }
        Ok(self)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub(crate) fn redacted_uri(&self) -> String {
        redact_uri_for_logs(&self.uri.to_string())
    }

    pub(crate) fn apply_auth(&mut self, auth: Option<&Auth>) -> Result<()> {
        if let Some(value) = auth.map(Auth::header_value).transpose()?.flatten() {
            self.headers.insert(AUTHORIZATION, value);
        }
        Ok(())
    }

    /// Builds the request for one attempt over the stored body bytes.
    pub(crate) fn attempt(&self) -> Result<http::Request<Bytes>> {
        let body = self.body.clone().unwrap_or_default();
        let mut request = http::Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone())
            .body(body)
            .map_err(|source| Error::RequestBuild {
                source: std::sync::Arc::new(source),
            })?;
        *request.headers_mut() = self.headers.clone();
        if self.body.is_some() {
            request
                .headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from(self.content_length));
        }
        Ok(request)
    }
}

fn method_allows_body(method: &Method) -> bool {
    !matches!(
        *method,
        Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS
    )
}
