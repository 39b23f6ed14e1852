// Typed errors for the ingest HTTP surface
// Worker-side code stays on anyhow; this enum exists to pin status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors produced while handling an ingest request. Each variant maps onto
/// exactly one HTTP status so handlers can use `?` and still honor the
/// documented error contract.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Malformed or out-of-bounds request metadata.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or unrecognized bearer token.
    #[error("unauthorized")]
    Unauthorized,

    /// Valid token for a device that has been disabled.
    #[error("device disabled")]
    DeviceDisabled,

    /// Requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Payload exceeded the configured maximum.
    #[error("payload too large")]
    PayloadTooLarge,

    /// Storage or database failure; details go to the log, not the client.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl IngestError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            IngestError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            IngestError::Unauthorized => StatusCode::UNAUTHORIZED,
            IngestError::DeviceDisabled => StatusCode::FORBIDDEN,
            IngestError::NotFound(_) => StatusCode::NOT_FOUND,
            IngestError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            IngestError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal details are logged server-side only; token material never
        // reaches either channel.
        let message = match &self {
            IngestError::Internal(err) => {
                log::error!("internal error handling request: {:#}", err);
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(json!({ "status": "error", "error": message }))).into_response()
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Internal(anyhow::Error::new(err).context("database error"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_contract() {
        assert_eq!(
            IngestError::invalid("bad").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(IngestError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(IngestError::DeviceDisabled.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            IngestError::PayloadTooLarge.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            IngestError::Internal(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
