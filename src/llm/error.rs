//! Typed errors for backend calls
//!
//! A backend call can fail on the wire, on the HTTP status, or while decoding
//! the body. Keeping these apart lets the pool treat a refused probe differently
//! from a model call that came back garbled.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    /// Model is not present on the server (HTTP 404)
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Malformed request (HTTP 400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Server is shedding load (HTTP 429)
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Server-side error (HTTP 5xx)
    #[error("Service error: {0}")]
    ServiceError(String),

    /// Any other non-success status
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Connection refused, reset, timed out
    #[error("Network error: {0}")]
    Network(String),

    /// Body arrived but could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Whether the same request could succeed on another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited(_) | LlmError::ServiceError(_) | LlmError::Network(_)
        )
    }

    /// Convert HTTP status code and error text into typed LlmError
    pub fn from_http_status(status: reqwest::StatusCode, error_text: String) -> Self {
        match status.as_u16() {
            400 => LlmError::BadRequest(error_text),
            404 => LlmError::ModelNotFound(error_text),
            429 => LlmError::RateLimited(error_text),
            500..=599 => LlmError::ServiceError(error_text),
            code => LlmError::Status {
                status: code,
                body: error_text,
            },
        }
    }

    /// Convert reqwest transport errors into typed LlmError
    pub fn from_network_error(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Network(format!("Request timeout: {}", e))
        } else if e.is_connect() {
            LlmError::Network(format!("Connection failed: {}", e))
        } else if e.is_decode() {
            LlmError::InvalidResponse(e.to_string())
        } else if let Some(status) = e.status() {
            Self::from_http_status(status, e.to_string())
        } else {
            LlmError::Network(e.to_string())
        }
    }
}
