//! JSON error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use cardstream_types::StreamError;

/// Anything a handler can fail with. Rejections never carry SSE bytes.
#[derive(Debug)]
pub enum ApiError {
    Stream(StreamError),
    /// The client did not accept `text/event-stream`.
    NotAcceptable,
    /// Body could not be decoded.
    BadRequest(String),
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        ApiError::Stream(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Stream(e) => {
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ApiError::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Stream(e) => e.code(),
            ApiError::NotAcceptable => "NOT_ACCEPTABLE",
            ApiError::BadRequest(_) => "INVALID_REQUEST",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Stream(e) => e.to_string(),
            ApiError::NotAcceptable => {
                "This endpoint requires Accept: text/event-stream header".to_string()
            }
            ApiError::BadRequest(msg) => msg.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self.message(), "Request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self.message(), "Request rejected");
        }

        let mut body = json!({
            "error": status.canonical_reason().unwrap_or("Error"),
            "message": self.message(),
            "code": self.code(),
        });
        if let ApiError::Stream(StreamError::UnknownTopic { available, .. }) = &self {
            body["availableTopics"] = json!(available);
        }
        if let ApiError::Stream(StreamError::UnknownProvider { available, .. }) = &self {
            body["availableProviders"] = json!(available);
        }
        (status, Json(body)).into_response()
    }
}
