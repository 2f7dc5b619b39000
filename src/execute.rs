//! The retry loop.
//!
//! One call to [`Client::execute`] drives a single logical request through
//! as many physical attempts as the retry policy and `max_retries` allow:
//!
//! 1. apply auth and build a fresh attempt over the stored body bytes,
//! 2. send it, racing the request's cancellation token,
//! 3. stop on cancellation, otherwise ask the retry policy,
//! 4. on retry, drain the discarded body and wait for the server's
//!    `Retry-After` hint or the backoff strategy, again racing cancellation.

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::StatusCode;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::body::{ResBody, drain_body, full_res_body, read_all_body_limited};
use crate::client::Client;
use crate::error::{Error, Failure};
use crate::request::Request;
use crate::response::{DataDump, Response, dump_request, dump_response};
use crate::retry::RetryDecision;
use crate::util::server_retry_after;

struct Outcome {
    response: Option<http::Response<ResBody>>,
    transport_error: Option<Error>,
    decision_error: Option<Error>,
    attempts: usize,
    exhausted: bool,
    request_dump: Option<Bytes>,
}

impl Client {
    /// Executes `request`, retrying according to the client's policy.
    ///
    /// A [`Failure`] carries the determining error, the last response's
    /// status and headers when there was one, and the number of attempts.
    pub async fn execute(&self, mut request: Request) -> Result<Response, Failure> {
        request.apply_auth(self.auth.as_ref())?;
        let cancellation = request.cancellation().clone();
        let method = request.method().clone();
        let uri = request.redacted_uri();
        let mut attempt = 0_u32;

        loop {
            let outgoing = request.attempt()?;
            let request_dump = self.dump_wire.then(|| dump_request(&outgoing));
            debug!(method = %method, uri = %uri, attempt = attempt + 1, "sending request");

            let sent = tokio::select! {
                biased;
                _ = cancellation.cancelled() => Err(Error::Cancelled),
                result = self.transport.send(outgoing) => result,
            };
            let (response, transport_error) = match sent {
                Ok(response) => (Some(response), None),
                Err(error) => (None, Some(error)),
            };

            let decision = if cancellation.is_cancelled() {
                RetryDecision::stop_with(Error::Cancelled)
            } else {
                self.retry_policy
                    .decide(&cancellation, response.as_ref(), transport_error.as_ref())
            };
            let status = response.as_ref().map(http::Response::status);
            let attempts = attempt as usize + 1;

            let remaining = self.max_retries.saturating_sub(attempt);
            if !decision.retry || remaining == 0 {
                return self
                    .finish(Outcome {
                        response,
                        transport_error,
                        decision_error: decision.error,
                        attempts,
                        exhausted: decision.retry,
                        request_dump,
                    })
                    .await;
            }

            let wait = response
                .as_ref()
                .and_then(|response| {
                    server_retry_after(response.status(), response.headers(), SystemTime::now())
                })
                .unwrap_or_else(|| self.backoff_strategy.wait(attempt));
            if let Some(response) = response {
                self.discard_body(response.into_body()).await;
            }
            log_retry(
                &method,
                &uri,
                attempts,
                status,
                decision.error.as_ref().or(transport_error.as_ref()),
                wait,
                remaining,
            );

            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    self.transport.close_idle_connections();
                    debug!(
                        method = %method,
                        uri = %uri,
                        attempt = attempts,
                        "cancelled while waiting to retry"
                    );
                    return Err(Failure::new(Error::Cancelled, None, attempts));
                }
                _ = sleep(wait) => {}
            }
            attempt += 1;
        }
    }

    async fn finish(&self, outcome: Outcome) -> Result<Response, Failure> {
        let Outcome {
            response,
            transport_error,
            decision_error,
            attempts,
            exhausted,
            request_dump,
        } = outcome;
        let status = response.as_ref().map(http::Response::status);

        let (error, response) = match (decision_error.or(transport_error), response) {
            (None, Some(response)) if !exhausted => {
                return self.success(response, request_dump, attempts).await;
            }
            (error, response) => (
                error.unwrap_or(Error::RetriesExhausted { attempts, status }),
                response,
            ),
        };

        let response = match response {
            Some(response) => {
                let (parts, body) = response.into_parts();
                self.discard_body(body).await;
                Some(Response::head_only(parts))
            }
            None => None,
        };
        self.transport.close_idle_connections();
        warn!(
            attempts = attempts,
            status = status.map(|status| status.as_u16()),
            error = %error,
            "request failed"
        );
        Err(Failure::new(error, response, attempts))
    }

    async fn success(
        &self,
        response: http::Response<ResBody>,
        request_dump: Option<Bytes>,
        attempts: usize,
    ) -> Result<Response, Failure> {
        debug!(
            status = response.status().as_u16(),
            attempts = attempts,
            "request completed"
        );
        let Some(request_dump) = request_dump else {
            return Ok(Response::new(response, None));
        };

        let (parts, body) = response.into_parts();
        let body = read_all_body_limited(body, usize::MAX)
            .await
            .map_err(|error| Failure::new(error.into_error(usize::MAX), None, attempts))?;
        let dump = DataDump {
            request: request_dump,
            response: dump_response(&parts, &body),
        };
        Ok(Response::new(
            http::Response::from_parts(parts, full_res_body(body)),
            Some(dump),
        ))
    }

    async fn discard_body(&self, body: ResBody) {
        if let Err(error) = drain_body(body, self.drain_limit).await {
            debug!(error = %error, "failed to drain response body");
        }
    }
}

fn log_retry(
    method: &http::Method,
    uri: &str,
    attempt: usize,
    status: Option<StatusCode>,
    error: Option<&Error>,
    wait: Duration,
    remaining: u32,
) {
    let delay_ms = wait.as_millis() as u64;
    let status = status.map(|status| status.as_u16());
    match error {
        Some(error) => warn!(
            method = %method,
            uri = %uri,
            attempt = attempt,
            status = status,
            delay_ms = delay_ms,
            remaining = remaining,
            error = %error,
            "attempt failed; retrying"
        ),
        None => debug!(
            method = %method,
            uri = %uri,
            attempt = attempt,
            status = status,
            delay_ms = delay_ms,
            remaining = remaining,
            "retrying request"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use bytes::Bytes;
    use http::header::AUTHORIZATION;
    use http::{Method, StatusCode};
    use tokio_util::sync::CancellationToken;

    use crate::body::full_res_body;
    use crate::error::{Error, ErrorCode, TransportErrorKind};
    use crate::request::Request;
    use crate::retry::RetryDecision;
    use crate::transport::{Transport, TransportFuture};
    use crate::{Client, ResBody};

    enum Scripted {
        Status(u16),
        StatusWithHeader(u16, &'static str, &'static str),
        Fail(TransportErrorKind),
    }

    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Scripted>>,
        seen: Mutex<Vec<http::Request<Bytes>>>,
        idle_closes: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: impl IntoIterator<Item = Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().collect()),
                ..Self::default()
            })
        }

        fn attempts(&self) -> usize {
            self.seen.lock().expect("lock").len()
        }
    }

    impl Transport for ScriptedTransport {
        fn send(&self, request: http::Request<Bytes>) -> TransportFuture<'_> {
            let uri = request.uri().to_string();
            let method = request.method().clone();
            self.seen.lock().expect("lock").push(request);
            let step = self
                .script
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or(Scripted::Status(200));
            Box::pin(async move {
                let (status, header) = match step {
                    Scripted::Status(status) => (status, None),
                    Scripted::StatusWithHeader(status, name, value) => {
                        (status, Some((name, value)))
                    }
                    Scripted::Fail(kind) => {
                        return Err(Error::Transport {
                            kind,
                            method,
                            uri,
                            source: Arc::new(std::io::Error::other("scripted failure")),
                        });
                    }
                };
                let mut builder = http::Response::builder().status(status);
                if let Some((name, value)) = header {
                    builder = builder.header(name, value);
                }
                Ok(builder
                    .body(full_res_body(format!("status {status}")))
                    .expect("response should build"))
            })
        }

        fn close_idle_connections(&self) {
            self.idle_closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn client(transport: &Arc<ScriptedTransport>, max_retries: u32) -> Client {
        Client::builder()
            .transport_arc(transport.clone())
            .max_retries(max_retries)
            .backoff_strategy(|_attempt: u32| Duration::from_millis(1))
            .build()
    }

    fn get(uri: &str) -> Request {
        Request::new(Method::GET, uri).expect("request should build")
    }

    #[tokio::test]
    async fn zero_retries_means_a_single_attempt() {
        let transport = ScriptedTransport::new([Scripted::Status(503)]);
        let failure = client(&transport, 0)
            .execute(get("http://service.test/items"))
            .await
            .expect_err("503 is not a success");
        assert_eq!(transport.attempts(), 1);
        assert_eq!(failure.attempts(), 1);
        assert_eq!(failure.error().code(), ErrorCode::UnexpectedStatus);
        assert_eq!(
            failure.response().map(|response| response.status()),
            Some(StatusCode::SERVICE_UNAVAILABLE)
        );
    }

    #[tokio::test]
    async fn always_retrying_policy_makes_retries_plus_one_attempts() {
        let transport = ScriptedTransport::new([]);
        let client = Client::builder()
            .transport_arc(transport.clone())
            .max_retries(3)
            .backoff_strategy(|_attempt: u32| Duration::from_millis(1))
            .retry_policy(
                |_: &CancellationToken, _: Option<&http::Response<ResBody>>, _: Option<&Error>| {
                    RetryDecision::retry()
                },
            )
            .build();
        let failure = client
            .execute(get("http://service.test/items"))
            .await
            .expect_err("policy never accepts");
        assert_eq!(transport.attempts(), 4);
        assert_eq!(failure.attempts(), 4);
        assert_eq!(failure.error().code(), ErrorCode::RetriesExhausted);
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let transport = ScriptedTransport::new([
            Scripted::Status(500),
            Scripted::Status(502),
            Scripted::Status(200),
        ]);
        let mut response = client(&transport, 2)
            .execute(get("http://service.test/items"))
            .await
            .expect("third attempt succeeds");
        assert_eq!(transport.attempts(), 3);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.expect("body"), "status 200");
    }

    #[tokio::test]
    async fn exhausted_server_errors_surface_unexpected_status() {
        let transport = ScriptedTransport::new([
            Scripted::Status(500),
            Scripted::Status(500),
            Scripted::Status(500),
        ]);
        let failure = client(&transport, 2)
            .execute(get("http://service.test/items"))
            .await
            .expect_err("all attempts fail");
        assert_eq!(transport.attempts(), 3);
        assert_eq!(
            failure.to_string(),
            "unexpected HTTP status 500 Internal Server Error"
        );
        let response = failure.into_response().expect("last response is kept");
        assert!(response.is_body_consumed());
        assert_eq!(transport.idle_closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_implemented_is_returned_as_a_response() {
        let transport = ScriptedTransport::new([Scripted::Status(501)]);
        let response = client(&transport, 2)
            .execute(get("http://service.test/items"))
            .await
            .expect("501 is not retried and not an error");
        assert_eq!(transport.attempts(), 1);
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn throttling_until_exhaustion_reports_retries_exhausted() {
        let transport = ScriptedTransport::new([Scripted::Status(429), Scripted::Status(429)]);
        let failure = client(&transport, 1)
            .execute(get("http://service.test/items"))
            .await
            .expect_err("throttled on every attempt");
        assert_eq!(transport.attempts(), 2);
        assert_eq!(failure.error().code(), ErrorCode::RetriesExhausted);
        assert_eq!(
            failure.to_string(),
            "giving up after 2 attempt(s) (last status: 429 Too Many Requests)"
        );
    }

    #[tokio::test]
    async fn network_errors_are_retried_and_surface_when_exhausted() {
        let transport = ScriptedTransport::new([
            Scripted::Fail(TransportErrorKind::Connect),
            Scripted::Fail(TransportErrorKind::Connect),
        ]);
        let failure = client(&transport, 1)
            .execute(get("http://service.test/items"))
            .await
            .expect_err("never connects");
        assert_eq!(transport.attempts(), 2);
        assert_eq!(
            failure.error().transport_error_kind(),
            Some(TransportErrorKind::Connect)
        );
        assert!(failure.response().is_none());
    }

    #[tokio::test]
    async fn certificate_errors_are_not_retried() {
        let transport = ScriptedTransport::new([Scripted::Fail(TransportErrorKind::Certificate)]);
        let failure = client(&transport, 5)
            .execute(get("https://service.test/items"))
            .await
            .expect_err("untrusted certificate");
        assert_eq!(transport.attempts(), 1);
        assert_eq!(
            failure.error().transport_error_kind(),
            Some(TransportErrorKind::Certificate)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_overrides_the_backoff() {
        let transport = ScriptedTransport::new([
            Scripted::StatusWithHeader(429, "retry-after", "120"),
            Scripted::Status(200),
        ]);
        let client = client(&transport, 1);
        let started = tokio::time::Instant::now();
        let response = client
            .execute(get("http://service.test/items"))
            .await
            .expect("second attempt succeeds");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(started.elapsed() >= Duration::from_secs(120));
    }

    #[tokio::test]
    async fn retry_after_is_ignored_for_other_statuses() {
        let transport = ScriptedTransport::new([
            Scripted::StatusWithHeader(500, "retry-after", "3600"),
            Scripted::Status(200),
        ]);
        let response = tokio::time::timeout(
            Duration::from_secs(5),
            client(&transport, 1).execute(get("http://service.test/items")),
        )
        .await
        .expect("backoff strategy is used instead of the header")
        .expect("second attempt succeeds");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cancellation_during_the_wait_returns_promptly() {
        let transport = ScriptedTransport::new([Scripted::Status(503)]);
        let client = Client::builder()
            .transport_arc(transport.clone())
            .max_retries(5)
            .backoff_strategy(|_attempt: u32| Duration::from_secs(3600))
            .build();
        let cancellation = CancellationToken::new();
        let request = get("http://service.test/items").with_cancellation(cancellation.clone());

        let canceller = cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let failure = tokio::time::timeout(Duration::from_secs(5), client.execute(request))
            .await
            .expect("cancellation interrupts the wait")
            .expect_err("cancelled");
        assert!(failure.error().is_cancelled());
        assert_eq!(transport.attempts(), 1);
        assert_eq!(transport.idle_closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn already_cancelled_requests_are_never_retried() {
        let transport = ScriptedTransport::new([Scripted::Status(503)]);
        let cancellation = CancellationToken::new();
        cancellation.cancel();
        let request = get("http://service.test/items").with_cancellation(cancellation);
        let failure = client(&transport, 3)
            .execute(request)
            .await
            .expect_err("cancelled");
        assert!(failure.error().is_cancelled());
        assert_eq!(failure.attempts(), 1);
    }

    #[tokio::test]
    async fn body_and_auth_are_sent_on_every_attempt() {
        let transport = ScriptedTransport::new([Scripted::Status(502), Scripted::Status(201)]);
        let client = Client::builder()
            .transport_arc(transport.clone())
            .backoff_strategy(|_attempt: u32| Duration::from_millis(1))
            .bearer_auth("token")
            .build();
        let request = Request::with_body(Method::POST, "http://service.test/items", "payload")
            .expect("request should build");
        client.execute(request).await.expect("second attempt succeeds");

        let seen = transport.seen.lock().expect("lock");
        assert_eq!(seen.len(), 2);
        for request in seen.iter() {
            assert_eq!(request.body(), &Bytes::from_static(b"payload"));
            assert_eq!(
                request.headers().get(AUTHORIZATION).expect("auth header"),
                "Bearer token"
            );
        }
    }

    #[tokio::test]
    async fn wire_dump_captures_the_final_attempt() {
        let transport = ScriptedTransport::new([Scripted::Status(200)]);
        let client = Client::builder()
            .transport_arc(transport.clone())
            .dump_wire(true)
            .build();
        let mut response = client
            .execute(get("http://service.test/items"))
            .await
            .expect("success");
        let dump = response.data_dump().cloned().expect("dump enabled");
        assert!(dump.request.starts_with(b"GET /items HTTP/1.1\r\n"));
        assert!(dump.response.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(dump.response.ends_with(b"status 200"));
        assert_eq!(response.text().await.expect("body still readable"), "status 200");
    }

    #[tokio::test]
    async fn custom_policy_errors_take_precedence() {
        let transport = ScriptedTransport::new([Scripted::Status(200)]);
        let client = Client::builder()
            .transport_arc(transport.clone())
            .retry_policy(
                |_: &CancellationToken, _: Option<&http::Response<ResBody>>, _: Option<&Error>| {
                    RetryDecision::stop_with(Error::UnexpectedStatus {
                        status: StatusCode::OK,
                    })
                },
            )
            .build();
        let failure = client
            .execute(get("http://service.test/items"))
            .await
            .expect_err("policy rejects the response");
        assert_eq!(failure.error().code(), ErrorCode::UnexpectedStatus);
        assert_eq!(transport.attempts(), 1);
    }
}
