//! The response envelope.
//!
//! Every API response carries `{status, request_id, timestamp, data|error,
//! pagination?}`. Error codes come from a closed set so clients can switch
//! on them.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use rowe_core::error::ServerError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
    pub total: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub details: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T: Serialize> {
    pub status: &'static str,
    pub request_id: String,
    pub timestamp: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

impl<T: Serialize> Envelope<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success",
            request_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            data: Some(data),
            error: None,
            pagination: None,
        }
    }

    pub fn paginated(data: T, pagination: Pagination) -> Self {
        let mut envelope = Self::success(data);
        envelope.pagination = Some(pagination);
        envelope
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Handler error type: wraps the core error and renders the envelope.
#[derive(Debug)]
pub struct ApiError(pub ServerError);

impl From<ServerError> for ApiError {
    fn from(error: ServerError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServerError::Database(_) | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::BadRequest(_) | ServerError::Validation(_) => StatusCode::BAD_REQUEST,
            ServerError::Conflict(_) => StatusCode::CONFLICT,
            ServerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        };
        let envelope: Envelope<()> = Envelope {
            status: "error",
            request_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            data: None,
            error: Some(ErrorBody {
                code: self.0.code(),
                message: self.0.to_string(),
                details: self.0.details(),
            }),
            pagination: None,
        };
        (status, Json(envelope)).into_response()
    }
}

/// Clamped list parameters: `limit` capped at 100.
pub fn clamp_page(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    let limit = limit.unwrap_or(20).clamp(1, 100);
    let offset = offset.unwrap_or(0).max(0);
    (limit, offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_page_caps_limit_at_100() {
        assert_eq!(clamp_page(Some(500), Some(-3)), (100, 0));
        assert_eq!(clamp_page(None, None), (20, 0));
        assert_eq!(clamp_page(Some(5), Some(40)), (5, 40));
    }

    #[test]
    fn error_envelope_carries_code_and_details() {
        let error = ApiError(ServerError::Validation(vec!["a".into(), "b".into()]));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
