//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// API error type; maps the shared taxonomy onto HTTP statuses.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<girder_core::Error> for ApiError {
    fn from(err: girder_core::Error) -> Self {
        match err {
            girder_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            girder_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            girder_core::Error::Conflict(msg) => ApiError::Conflict(msg),
            girder_core::Error::StoreUnavailable(msg) => ApiError::Unavailable(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<girder_db::DbError> for ApiError {
    fn from(err: girder_db::DbError) -> Self {
        match err {
            girder_db::DbError::NotFound(msg) => ApiError::NotFound(msg),
            girder_db::DbError::Duplicate(msg) => ApiError::Conflict(msg),
            girder_db::DbError::Conflict(msg) => ApiError::Conflict(msg),
            girder_db::DbError::Database(e) => ApiError::Unavailable(e.to_string()),
            girder_db::DbError::Migration(e) => ApiError::Unavailable(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn status_mapping() {
        let cases = [
            (ApiError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (ApiError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ApiError::Conflict("x".into()), StatusCode::CONFLICT),
            (
                ApiError::Unavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::Internal("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn cas_conflicts_surface_as_409() {
        let err: ApiError = girder_db::DbError::Conflict("stale status".into()).into();
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn store_failures_surface_as_503() {
        let err: ApiError = girder_db::DbError::Database(sqlx::Error::PoolClosed).into();
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
