//! Proxy rejections and how they are written to the caller

use super::xml;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use thiserror::Error;

/// Diagnostic header carried by every rejection.
pub const ERROR_HEADER: &str = "x-s3gate-error";

/// Every way the proxy itself can refuse or fail a request.
///
/// Statuses returned by the backend are not errors here; they are passed
/// through to the caller as they are.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),

    /// The backend could not be reached or failed mid-request.
    #[error("{0}")]
    Backend(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ProxyError::Forbidden(_) => StatusCode::FORBIDDEN,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Internal(_) | ProxyError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) => "Bad request",
            ProxyError::Unauthorized(_) => "Unauthorized",
            ProxyError::Forbidden(_) => "Forbidden",
            ProxyError::NotFound(_) => "Not found",
            ProxyError::Internal(_) => "Internal server error",
            ProxyError::Backend(_) => "Backend error",
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) => "bad_request",
            ProxyError::Unauthorized(_) => "unauthorized",
            ProxyError::Forbidden(_) => "forbidden",
            ProxyError::NotFound(_) => "not_found",
            ProxyError::Internal(_) => "internal",
            ProxyError::Backend(_) => "backend",
        }
    }

    /// `<code> - <Title>. <reason>`
    pub fn diagnostic(&self) -> String {
        format!("{} - {}. {}", self.status_code().as_u16(), self.title(), self)
    }

    /// Build the response. 401 and 403 carry the XML envelope; everything else
    /// carries the diagnostic line as plain text.
    pub fn render(&self, bucket: Option<&str>, request_id: &str, host_id: &str) -> Response {
        let status = self.status_code();
        let diagnostic = self.diagnostic();

        let (content_type, body) = match self {
            ProxyError::Unauthorized(_) | ProxyError::Forbidden(_) => (
                "application/xml",
                xml::access_denied(bucket.unwrap_or_default(), request_id, host_id),
            ),
            _ => ("text/plain; charset=utf-8", diagnostic.clone()),
        };

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        // Reasons can echo request data, so anything that is not a valid
        // header value is replaced.
        let value = HeaderValue::from_str(&diagnostic).unwrap_or_else(|_| {
            HeaderValue::from_str(&format!("{} - {}.", status.as_u16(), self.title()))
                .unwrap_or(HeaderValue::from_static("error"))
        });
        headers.insert(ERROR_HEADER, value);
        response
    }
}
