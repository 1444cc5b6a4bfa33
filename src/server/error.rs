use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Server error type that provides automatic logging and clean error responses.
///
/// Admission decisions are always answered with an AdmissionReview, even when
/// the pod is rejected. This type covers the cases where no review can be
/// produced at all: bodies that are not an AdmissionReview, and readiness checks that
/// report the webhook as unavailable.
///
/// # Example
///
/// ```rust,ignore
/// use crate::server::error::ServerError;
///
/// let err = ServerError::bad_request("AdmissionReview has no request")
///     .with_context("api_version", review.api_version);
/// ```
#[derive(Debug)]
pub struct ServerError {
    /// HTTP status code to return
    pub status: StatusCode,
    /// User-facing error message (returned in response)
    pub message: String,
    /// Structured context for logging (key-value pairs)
    pub context: Vec<(&'static str, String)>,
}

impl ServerError {
    /// Create a new error with status and message
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            context: Vec::new(),
        }
    }

    /// Add a context field for logging (chainable)
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    /// Create a 400 Bad Request error
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// Create a 503 Service Unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        // Log with structured fields to prevent log injection
        if self.status.is_client_error() {
            tracing::warn!(
                status = self.status.as_u16(),
                message = %self.message,
                context = ?self.context,
                "Rejected webhook request"
            );
        } else {
            tracing::debug!(
                status = self.status.as_u16(),
                message = %self.message,
                context = ?self.context,
                "Webhook request failed"
            );
        }

        let body = Json(json!({
            "error": self.message,
        }));

        (self.status, body).into_response()
    }
}
