//! Gateway error types and their HTTP dispositions.
//!
//! Every error that reaches a client is rendered in the downstream error
//! envelope: `{"type":"error","error":{"type":...,"message":...}}`.

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use serde_json::json;

#[derive(Debug)]
pub enum GatewayError {
    /// Request body failed to parse or a required field is missing.
    InvalidRequest(String),
    /// An image block carried a source kind the upstream cannot accept.
    UnsupportedImage(String),
    /// The upstream API rejected or failed the call; status preserved
    /// when the upstream supplied one.
    Upstream {
        status: Option<u16>,
        message: String,
    },
    /// Per-request timeout expired (client-closed-request).
    Timeout,
    Internal(String),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::UnsupportedImage(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Upstream { status, .. } => status
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            // 499 has no StatusCode constant; nginx's client-closed-request.
            GatewayError::Timeout => StatusCode::from_u16(499).unwrap(),
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::UnsupportedImage(_) => {
                "invalid_request_error"
            }
            GatewayError::Upstream { .. } => "api_error",
            GatewayError::Timeout => "timeout_error",
            GatewayError::Internal(_) => "api_error",
        }
    }

    fn message(&self) -> String {
        match self {
            GatewayError::InvalidRequest(msg)
            | GatewayError::UnsupportedImage(msg)
            | GatewayError::Internal(msg) => msg.clone(),
            GatewayError::Upstream { message, .. } => message.clone(),
            GatewayError::Timeout => "request timed out".to_string(),
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type(), self.message())
    }
}

impl std::error::Error for GatewayError {}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response<Body> {
        let status = self.status();
        let body = json!({
            "type": "error",
            "error": {
                "type": self.error_type(),
                "message": self.message(),
            }
        });

        tracing::error!("request failed: {} - {}", status, self.message());

        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(Body::from("internal error building error response")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_request_maps_to_400_with_envelope() {
        let err = GatewayError::InvalidRequest("missing field `model`".to_string());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_type(), "invalid_request_error");
    }

    #[test]
    fn upstream_status_is_preserved() {
        let err = GatewayError::Upstream {
            status: Some(429),
            message: "rate limited".to_string(),
        };
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);

        let err = GatewayError::Upstream {
            status: None,
            message: "connection refused".to_string(),
        };
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn timeout_is_client_closed_request() {
        assert_eq!(GatewayError::Timeout.status().as_u16(), 499);
    }
}
