//! JSON error responses for the proxy path.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// The single error code returned for proxy failures.
///
/// Timeouts and collateral transport failures share one code on purpose: the
/// most common non-timeout failure is the worker having already been killed
/// by another request timing out on it, and distinguishing the two is not
/// useful to callers.
pub const WORKER_TIMEOUT_CODE: &str = "hss_worker_timeout";

/// Wire format of the 503 envelope.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
}

impl ErrorBody {
    pub fn new(pid: u32, message: &str) -> Self {
        Self {
            error: format!("worker {}: {}", pid, message),
            code: WORKER_TIMEOUT_CODE,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","code":"{}"}}"#,
                self.error.replace('"', "\\\""),
                self.code
            )
        })
    }
}

/// Build the 503 response for a failed proxy attempt, stamped with the
/// worker's pid in `X-Worker` like every other response.
pub fn worker_error_response(pid: u32, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorBody::new(pid, message).to_json();

    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header("Content-Type", "application/json")
        .header("X-Worker", pid)
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_format() {
        let body = ErrorBody::new(4321, "restarted due to timeout");
        let json = body.to_json();

        assert_eq!(
            json,
            r#"{"error":"worker 4321: restarted due to timeout","code":"hss_worker_timeout"}"#
        );
    }

    #[test]
    fn response_is_503_with_worker_header() {
        let response = worker_error_response(99, "connection refused");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(response.headers().get("X-Worker").unwrap(), "99");
    }

    #[test]
    fn spawn_failed_worker_reports_pid_zero() {
        let json = ErrorBody::new(0, "connect failure").to_json();
        assert!(json.contains("worker 0: connect failure"));
        assert!(json.contains(WORKER_TIMEOUT_CODE));
    }
}
