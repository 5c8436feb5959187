//! Error-to-HTTP response conversion.
//!
//! Wraps [`mf_core::Error`] so route handlers can return
//! `Result<T, AppError>` and use `?` on library calls.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Wrapper so we can implement `IntoResponse` for an external type.
pub struct AppError {
    inner: mf_core::Error,
    request_id: Option<String>,
}

impl AppError {
    pub fn new(inner: mf_core::Error) -> Self {
        Self {
            inner,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, id: String) -> Self {
        self.request_id = Some(id);
        self
    }
}

impl From<mf_core::Error> for AppError {
    fn from(e: mf_core::Error) -> Self {
        Self::new(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.inner.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(
                status = %status,
                error = %self.inner,
                "Server error in API handler"
            );
        }

        let kind = self.inner.kind();
        let body = json!({
            "error": self.inner.to_string(),
            "code": kind.as_str(),
            "retryable": kind.is_retryable(),
            "request_id": self.request_id,
        });

        let mut response = (status, axum::Json(body)).into_response();
        if status == StatusCode::TOO_MANY_REQUESTS {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("5"));
        }
        response
    }
}
