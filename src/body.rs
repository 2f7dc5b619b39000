use std::convert::Infallible;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};

use crate::error::{BoxError, Error};

/// Body type produced by every [`Transport`](crate::Transport).
pub type ResBody = BoxBody<Bytes, BoxError>;

pub(crate) type ReqBody = BoxBody<Bytes, BoxError>;

/// Default cap for draining discarded response bodies.
pub(crate) const DEFAULT_DRAIN_LIMIT: usize = 4096;

fn map_infallible_to_box_error(never: Infallible) -> BoxError {
    match never {}
}

pub(crate) fn empty_req_body() -> ReqBody {
    Empty::<Bytes>::new()
        .map_err(map_infallible_to_box_error)
        .boxed()
}

pub(crate) fn buffered_req_body(body: Bytes) -> ReqBody {
    if body.is_empty() {
        return empty_req_body();
    }
    Full::new(body).map_err(map_infallible_to_box_error).boxed()
}

/// Wraps already-buffered bytes as a response body.
pub fn full_res_body(body: impl Into<Bytes>) -> ResBody {
    Full::new(body.into())
        .map_err(map_infallible_to_box_error)
        .boxed()
}

pub(crate) fn box_res_body<B>(body: B) -> ResBody
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed()
}

pub(crate) enum ReadBodyError {
    Read(BoxError),
    TooLarge { actual_bytes: usize },
}

impl ReadBodyError {
    pub(crate) fn into_error(self, limit_bytes: usize) -> Error {
        match self {
            Self::Read(source) => Error::ReadBody {
                source: source.into(),
            },
            Self::TooLarge { actual_bytes } => Error::ResponseBodyTooLarge {
                limit_bytes,
                actual_bytes,
            },
        }
    }
}

pub(crate) async fn read_all_body_limited(
    mut body: ResBody,
    max_bytes: usize,
) -> Result<Bytes, ReadBodyError> {
    let mut collected = Vec::new();
    let mut total_len = 0_usize;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(ReadBodyError::Read)?;
        if let Some(data) = frame.data_ref() {
            total_len = total_len.saturating_add(data.len());
            if total_len > max_bytes {
                return Err(ReadBodyError::TooLarge {
                    actual_bytes: total_len,
                });
            }
            collected.extend_from_slice(data);
        }
    }

    Ok(Bytes::from(collected))
}

/// Reads and discards frames until `limit` bytes have been seen, then drops
/// the body. The limit is checked between frames, so the frame that crosses
/// it is read whole and the returned count may exceed `limit`.
pub(crate) async fn drain_body(mut body: ResBody, limit: usize) -> Result<usize, BoxError> {
    let mut drained = 0_usize;
    while drained < limit {
        let Some(frame) = body.frame().await else {
            break;
        };
        if let Some(data) = frame?.data_ref() {
            drained = drained.saturating_add(data.len());
        }
    }
    Ok(drained)
}
