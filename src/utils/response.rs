//! Response builders for the HTTP endpoint.

use http::{header, HeaderValue, Response, StatusCode};
use serde::Serialize;

/// Standard content types
pub mod content_type {
    pub const TEXT_PLAIN: &str = "text/plain";
    pub const APPLICATION_JSON: &str = "application/json";
}

pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Plain-text response with the given status.
    pub fn text(status: StatusCode, message: &str) -> Response<Vec<u8>> {
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, content_type::TEXT_PLAIN)
            .body(message.as_bytes().to_vec())
            .unwrap_or_else(|e| {
                log::error!("Failed to build text response: {}", e);
                Self::fallback()
            })
    }

    /// JSON response with the given status.
    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Response<Vec<u8>> {
        let body = match serde_json::to_vec(data) {
            Ok(body) => body,
            Err(e) => {
                log::error!("Failed to serialize JSON response: {}", e);
                return Self::text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "JSON serialization failed",
                );
            }
        };

        Response::builder()
            .status(status)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static(content_type::APPLICATION_JSON),
            )
            .body(body)
            .unwrap_or_else(|e| {
                log::error!("Failed to build JSON response: {}", e);
                Self::fallback()
            })
    }

    /// Bodiless response, used for preflight answers.
    pub fn empty(status: StatusCode) -> Response<Vec<u8>> {
        let mut resp = Response::new(Vec::new());
        *resp.status_mut() = status;
        resp
    }

    fn fallback() -> Response<Vec<u8>> {
        let mut resp = Response::new(b"Internal Server Error".to_vec());
        *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        resp
    }
}

/// Common error response helpers
pub struct CommonErrors;

impl CommonErrors {
    pub fn not_found() -> Response<Vec<u8>> {
        ResponseBuilder::text(StatusCode::NOT_FOUND, "Not Found")
    }

    pub fn method_not_allowed() -> Response<Vec<u8>> {
        ResponseBuilder::empty(StatusCode::METHOD_NOT_ALLOWED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_response() {
        let response = ResponseBuilder::text(StatusCode::OK, "running");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), b"running");
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            content_type::TEXT_PLAIN
        );
    }

    #[test]
    fn test_json_response() {
        use serde_json::json;
        let data = json!({"error": "Invalid JSON"});
        let response = ResponseBuilder::json(StatusCode::BAD_REQUEST, &data);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.body(), br#"{"error":"Invalid JSON"}"#);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            content_type::APPLICATION_JSON
        );
    }

    #[test]
    fn test_common_errors() {
        let response = CommonErrors::not_found();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.body(), b"Not Found");

        let response = CommonErrors::method_not_allowed();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(response.body().is_empty());
    }
}
