//! HTTP rendering of request failures.
//!
//! Every failure becomes a plain-text body with the status from
//! [`Error::status_code`].

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};

use modcache_core::Error;

/// Request failure as seen by the HTTP caller.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::BAD_GATEWAY)
    }

    /// Body text shown to the caller.
    pub fn message(&self) -> String {
        match &self.0 {
            Error::UpstreamStatus { status } => format!("Upstream error: {status}"),
            Error::Resolution(msg) | Error::Dial(msg) | Error::UpstreamTransport(msg) => {
                format!("Failed to fetch: {msg}")
            }
            Error::Validation(msg) => msg.clone(),
            Error::Storage(e) => format!("Cache error: {e}"),
            Error::NotFound(_) | Error::InvalidKey(_) => "Not found".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], self.message()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_status_passthrough() {
        let err = ApiError(Error::UpstreamStatus { status: 410 });
        assert_eq!(err.status(), StatusCode::GONE);
        assert_eq!(err.message(), "Upstream error: 410");
    }

    #[test]
    fn test_gateway_errors() {
        for err in [
            Error::Resolution("no records".into()),
            Error::Dial("refused".into()),
            Error::UpstreamTransport("reset".into()),
        ] {
            let err = ApiError(err);
            assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
            assert!(err.message().starts_with("Failed to fetch: "));
        }
        assert_eq!(ApiError(Error::Validation("Invalid JSON".into())).message(), "Invalid JSON");
    }

    #[test]
    fn test_storage_is_internal() {
        let err = ApiError(Error::Storage(std::io::Error::other("disk full")));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_invalid_key_is_not_found() {
        let response = ApiError(Error::InvalidKey("../etc".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain; charset=utf-8");
    }
}
