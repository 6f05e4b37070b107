//! Error types for the query API.
//!
//! [`QueryError`] converts into an Axum response with a JSON body of the
//! form `{"error": ..., "status": ...}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors that can occur in the query API layer.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// No committed victory matches the request.
    #[error("not found: {0}")]
    NotFound(String),

    /// A query parameter was malformed or out of order.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidQuery(_) => StatusCode::BAD_REQUEST,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_http_codes() {
        let not_found = QueryError::NotFound(String::from("a/r")).into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        let invalid = QueryError::InvalidQuery(String::from("from > to")).into_response();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }
}
