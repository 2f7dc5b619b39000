//! `resend` executes each HTTP request over one or more attempts, with a
//! pluggable retry policy and backoff strategy between them.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use resend::prelude::{Client, ExponentialBackoff};
//! use serde::Deserialize;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug, Deserialize)]
//! struct Item {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .max_retries(3)
//!         .backoff_strategy(ExponentialBackoff)
//!         .bearer_auth("token")
//!         .request_timeout(Duration::from_secs(10))
//!         .try_build()?;
//!
//!     let cancellation = CancellationToken::new();
//!     let mut response = client
//!         .post(
//!             &cancellation,
//!             "https://api.example.com/v1/items",
//!             "application/json",
//!             &serde_json::json!({ "name": "demo" }),
//!         )
//!         .await?;
//!     let item: Item = response.json().await?;
//!
//!     println!("created id={}", item.id);
//!     Ok(())
//! }
//! ```
//!
//! # Defaults
//!
//! - Two retries after the first attempt, one second apart.
//! - Connection failures, `429` and `5xx` other than `501` are retried.
//! - `Retry-After` on `429` and `503` replaces the backoff for that wait.
//! - Proxies come from `HTTP_PROXY`, `HTTPS_PROXY` and `NO_PROXY`.

mod auth;
mod backoff;
mod body;
mod client;
mod error;
mod execute;
mod proxy;
mod request;
mod response;
mod retry;
mod transport;
mod util;

pub use crate::auth::Auth;
pub use crate::backoff::{
    BackoffStrategy, ConstantBackoff, ExponentialBackoff, ExponentialJitterBackoff, JitterSource,
    LinearBackoff, LinearJitterBackoff,
};
pub use crate::body::{ResBody, full_res_body};
pub use crate::client::{Client, ClientBuilder};
pub use crate::error::{Error, ErrorCode, Failure, TransportErrorKind};
pub use crate::proxy::ProxyConfig;
pub use crate::request::Request;
pub use crate::response::{DataDump, Response};
pub use crate::retry::{DefaultRetryPolicy, RetryDecision, RetryPolicy};
pub use crate::transport::{HyperTransport, Transport, TransportConfig, TransportFuture};

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod prelude {
    pub use crate::{
        Auth, BackoffStrategy, Client, ClientBuilder, ConstantBackoff, DataDump,
        DefaultRetryPolicy, Error, ErrorCode, ExponentialBackoff, ExponentialJitterBackoff,
        Failure, JitterSource, LinearBackoff, LinearJitterBackoff, ProxyConfig, Request,
        Response, RetryDecision, RetryPolicy, Transport, TransportErrorKind,
    };
}

#[cfg(test)]
mod tests;
