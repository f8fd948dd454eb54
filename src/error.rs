//! Gateway errors and JSON error responses for host-level faults
//!
//! Configuration, transform and target failures never surface here: they are
//! rendered into diagnostic pages by the pipeline. What remains are faults the
//! host has to answer itself (a route table that matches nothing, a request
//! outside `/gateway`, an unreadable body).

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Errors raised by the gateway library
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The route table has no entry for this path
    #[error("no route matched path '{0}'")]
    NoRouteMatched(String),

    /// The blocking worker running the pipeline failed
    #[error("gateway worker failed: {0}")]
    Worker(String),
}

/// Error codes for host-level responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Request path is outside the `/gateway` namespace
    NotFound,
    /// The request body could not be read
    BadRequest,
    /// The route table matched nothing (misconfigured table)
    RoutingFault,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            GatewayErrorCode::RoutingFault => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::BadRequest => "BAD_REQUEST",
            GatewayErrorCode::RoutingFault => "ROUTING_FAULT",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&GatewayError> for GatewayErrorCode {
    fn from(err: &GatewayError) -> Self {
        match err {
            GatewayError::NoRouteMatched(_) => GatewayErrorCode::RoutingFault,
            GatewayError::Worker(_) => GatewayErrorCode::InternalError,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: GatewayErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(code: GatewayErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(GatewayErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(GatewayErrorCode::BadRequest.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            GatewayErrorCode::RoutingFault.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_code_from_gateway_error() {
        let err = GatewayError::NoRouteMatched("x".to_string());
        assert_eq!(GatewayErrorCode::from(&err), GatewayErrorCode::RoutingFault);
        assert_eq!(err.to_string(), "no route matched path 'x'");

        let err = GatewayError::Worker("panicked".to_string());
        assert_eq!(GatewayErrorCode::from(&err), GatewayErrorCode::InternalError);
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(GatewayErrorCode::NotFound, "Not a gateway path: /x");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"NOT_FOUND\""));
        assert!(json.contains("\"message\":\"Not a gateway path: /x\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(GatewayErrorCode::RoutingFault, "no route");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "application/json");
        assert_eq!(response.headers().get("X-Gateway-Error").unwrap(), "ROUTING_FAULT");
    }
}
