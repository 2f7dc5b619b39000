use http::{Response as HttpResponse, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::body::ResBody;
use crate::error::{Error, TransportErrorKind};

/// Outcome of a [`RetryPolicy`] consultation.
#[derive(Clone, Debug)]
pub struct RetryDecision {
    pub retry: bool,
    pub error: Option<Error>,
}

impl RetryDecision {
    pub const fn retry() -> Self {
        Self {
            retry: true,
            error: None,
        }
    }

    pub const fn retry_with(error: Error) -> Self {
        Self {
            retry: true,
            error: Some(error),
        }
    }

    pub const fn stop() -> Self {
        Self {
            retry: false,
            error: None,
        }
    }

    pub const fn stop_with(error: Error) -> Self {
        Self {
            retry: false,
            error: Some(error),
        }
    }
}

/// Decides whether the attempt that just completed should be retried.
///
/// Exactly one of `response` and `error` is present. The engine checks the
/// cancellation token itself before asking the policy, so a custom policy
/// that ignores it still never retries a cancelled request.
pub trait RetryPolicy: Send + Sync {
    fn decide(
        &self,
        cancellation: &CancellationToken,
        response: Option<&HttpResponse<ResBody>>,
        error: Option<&Error>,
    ) -> RetryDecision;
}

impl<F> RetryPolicy for F
where
    F: Fn(&CancellationToken, Option<&HttpResponse<ResBody>>, Option<&Error>) -> RetryDecision
        + Send
        + Sync,
{
    fn decide(
        &self,
        cancellation: &CancellationToken,
        response: Option<&HttpResponse<ResBody>>,
        error: Option<&Error>,
    ) -> RetryDecision {
        self(cancellation, response, error)
    }
}

/// Retries connection failures, 429 and 5xx responses other than 501.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn decide(
        &self,
        cancellation: &CancellationToken,
        response: Option<&HttpResponse<ResBody>>,
        error: Option<&Error>,
    ) -> RetryDecision {
        if cancellation.is_cancelled() {
            return RetryDecision::stop_with(Error::Cancelled);
        }
        base_decision(response.map(HttpResponse::status), error)
    }
}

pub(crate) fn base_decision(status: Option<StatusCode>, error: Option<&Error>) -> RetryDecision {
    if let Some(error) = error {
        return transport_error_decision(error);
    }

    let Some(status) = status else {
        return RetryDecision::stop();
    };
    if status == StatusCode::TOO_MANY_REQUESTS {
        return RetryDecision::retry();
    }
    if status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED {
        return RetryDecision::retry_with(Error::UnexpectedStatus { status });
    }
    RetryDecision::stop()
}

fn transport_error_decision(error: &Error) -> RetryDecision {
    match error {
        Error::Cancelled
        | Error::RedirectLimitExceeded { .. }
        | Error::UnsupportedScheme { .. }
        | Error::Transport {
            kind: TransportErrorKind::Certificate,
            ..
        } => RetryDecision::stop_with(error.clone()),
        Error::Transport { kind, .. } if kind.is_network() => {
            RetryDecision::retry_with(error.clone())
        }
        _ => RetryDecision::retry(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::{Method, StatusCode};
    use tokio_util::sync::CancellationToken;

    use super::{DefaultRetryPolicy, RetryPolicy, base_decision};
    use crate::body::full_res_body;
    use crate::error::{Error, ErrorCode, TransportErrorKind};

    fn transport_error(kind: TransportErrorKind) -> Error {
        Error::Transport {
            kind,
            method: Method::GET,
            uri: "https://api.example.com/v1/items".to_owned(),
            source: Arc::new(std::io::Error::other("boom")),
        }
    }

    fn response(status: u16) -> http::Response<crate::ResBody> {
        http::Response::builder()
            .status(status)
            .body(full_res_body(""))
            .expect("response should build")
    }

    #[test]
    fn retries_throttled_responses_without_error() {
        let decision = base_decision(Some(StatusCode::TOO_MANY_REQUESTS), None);
        assert!(decision.retry);
        assert!(decision.error.is_none());
    }

    #[test]
    fn retries_server_errors_with_unexpected_status() {
        for status in [500_u16, 502, 503, 504, 599] {
            let status = StatusCode::from_u16(status).expect("valid status");
            let decision = base_decision(Some(status), None);
            assert!(decision.retry, "{status} should retry");
            let error = decision.error.expect("server error should be surfaced");
            assert_eq!(error.code(), ErrorCode::UnexpectedStatus);
        }
        let error = base_decision(Some(StatusCode::INTERNAL_SERVER_ERROR), None)
            .error
            .expect("error present");
        assert_eq!(
            error.to_string(),
            "unexpected HTTP status 500 Internal Server Error"
        );
    }

    #[test]
    fn never_retries_not_implemented() {
        let decision = base_decision(Some(StatusCode::NOT_IMPLEMENTED), None);
        assert!(!decision.retry);
        assert!(decision.error.is_none());
    }

    #[test]
    fn does_not_retry_success_or_client_errors() {
        for status in [200_u16, 204, 301, 400, 401, 404, 409] {
            let status = StatusCode::from_u16(status).expect("valid status");
            let decision = base_decision(Some(status), None);
            assert!(!decision.retry, "{status} should not retry");
            assert!(decision.error.is_none());
        }
    }

    #[test]
    fn network_errors_retry_and_surface_the_error() {
        for kind in [
            TransportErrorKind::Dns,
            TransportErrorKind::Connect,
            TransportErrorKind::Tls,
            TransportErrorKind::Timeout,
            TransportErrorKind::Read,
        ] {
            let error = transport_error(kind);
            let decision = base_decision(None, Some(&error));
            assert!(decision.retry, "{kind} should retry");
            assert_eq!(
                decision.error.and_then(|error| error.transport_error_kind()),
                Some(kind)
            );
        }
    }

    #[test]
    fn unclassified_transport_errors_retry_silently() {
        let error = transport_error(TransportErrorKind::Other);
        let decision = base_decision(None, Some(&error));
        assert!(decision.retry);
        assert!(decision.error.is_none());
    }

    #[test]
    fn certificate_redirect_and_scheme_errors_are_terminal() {
        let errors = [
            transport_error(TransportErrorKind::Certificate),
            Error::RedirectLimitExceeded {
                max_redirects: 10,
                method: Method::GET,
                uri: "https://api.example.com/loop".to_owned(),
            },
            Error::UnsupportedScheme {
                scheme: "ftp".to_owned(),
                method: Method::GET,
                uri: "ftp://files.example.com/a".to_owned(),
            },
        ];
        for error in errors {
            let decision = base_decision(None, Some(&error));
            assert!(!decision.retry, "{error} should not retry");
            assert_eq!(
                decision.error.map(|error| error.code()),
                Some(error.code())
            );
        }
    }

    #[test]
    fn cancellation_wins_over_retryable_outcomes() {
        let cancellation = CancellationToken::new();
        cancellation.cancel();
        let response = response(503);
        let decision = DefaultRetryPolicy.decide(&cancellation, Some(&response), None);
        assert!(!decision.retry);
        assert!(decision.error.is_some_and(|error| error.is_cancelled()));
    }

    #[test]
    fn default_policy_delegates_when_not_cancelled() {
        let cancellation = CancellationToken::new();
        let response = response(502);
        let decision = DefaultRetryPolicy.decide(&cancellation, Some(&response), None);
        assert!(decision.retry);
    }
}
