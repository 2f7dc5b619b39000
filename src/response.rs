use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;

use crate::Result;
use crate::body::{ResBody, read_all_body_limited};
use crate::error::{Error, status_line};

/// Request and response of the final attempt in HTTP/1.1 wire form,
/// captured when wire dumps are enabled.
///
/// Values of sensitive headers, such as `Authorization`, are written as
/// `<redacted>`, so the dump is not byte-identical to what was sent.
/// Headers the connection adds itself are not included.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataDump {
    pub request: Bytes,
    pub response: Bytes,
}

/// Final response of an execution.
///
/// The body is handed over unread and can be consumed once, through
/// [`bytes`](Self::bytes), [`text`](Self::text), [`json`](Self::json) or
/// [`into_body`](Self::into_body).
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Option<ResBody>,
    dump: Option<DataDump>,
}

impl Response {
    pub(crate) fn new(response: http::Response<ResBody>, dump: Option<DataDump>) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            body: Some(body),
            dump,
        }
    }

    /// Status and headers only; the body was drained by the engine.
    pub(crate) fn head_only(parts: http::response::Parts) -> Self {
        Self {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            body: None,
            dump: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    /// `"200 OK"`.
    pub fn status_line(&self) -> String {
        status_line(self.status)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn data_dump(&self) -> Option<&DataDump> {
        self.dump.as_ref()
    }

    pub fn is_body_consumed(&self) -> bool {
        self.body.is_none()
    }

    pub async fn bytes(&mut self) -> Result<Bytes> {
        self.bytes_limited(usize::MAX).await
    }

    pub async fn bytes_limited(&mut self, max_bytes: usize) -> Result<Bytes> {
        let body = self.take_body()?;
        read_all_body_limited(body, max_bytes)
            .await
            .map_err(|error| error.into_error(max_bytes))
    }

    pub async fn text(&mut self) -> Result<String> {
        let body = self.bytes().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    pub async fn json<T>(&mut self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let body = self.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| Error::Deserialize {
            source: std::sync::Arc::new(source),
        })
    }

    pub fn into_body(mut self) -> Result<ResBody> {
        self.take_body()
    }

    fn take_body(&mut self) -> Result<ResBody> {
        self.body.take().ok_or(Error::BodyConsumed)
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("body_consumed", &self.body.is_none())
            .field("dump", &self.dump)
            .finish()
    }
}

pub(crate) fn dump_request(request: &http::Request<Bytes>) -> Bytes {
    let path = request
        .uri()
        .path_and_query()
        .map(|path| path.as_str())
        .unwrap_or("/");
    let mut out = BytesMut::new();
    out.put_slice(
        format!(
            "{} {path} {}\r\n",
            request.method(),
            version_text(request.version())
        )
        .as_bytes(),
    );
    if !request.headers().contains_key(http::header::HOST)
        && let Some(authority) = request.uri().authority()
    {
        out.put_slice(format!("host: {authority}\r\n").as_bytes());
    }
    put_headers(&mut out, request.headers());
    out.put_slice(request.body());
    out.freeze()
}

pub(crate) fn dump_response(parts: &http::response::Parts, body: &Bytes) -> Bytes {
    let mut out = BytesMut::new();
    out.put_slice(
        format!(
            "{} {}\r\n",
            version_text(parts.version),
            status_line(parts.status)
        )
        .as_bytes(),
    );
    put_headers(&mut out, &parts.headers);
    out.put_slice(body);
    out.freeze()
}

fn put_headers(out: &mut BytesMut, headers: &HeaderMap) {
    for (name, value) in headers {
        out.put_slice(name.as_str().as_bytes());
        out.put_slice(b": ");
        if value.is_sensitive() {
            out.put_slice(b"<redacted>");
        } else {
            out.put_slice(value.as_bytes());
        }
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"\r\n");
}

fn version_text(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}
