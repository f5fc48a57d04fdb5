use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rollout_cache_core::CacheError;
use serde::Serialize;

#[derive(Debug)]
pub enum ApiError {
    InvalidRequest(String),
    CapacityExhausted(String),
    Internal(String),
}

impl From<CacheError> for ApiError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::InvalidInput(msg) => ApiError::InvalidRequest(msg),
            CacheError::ArenaCapacityExceeded { .. } | CacheError::RegistryFull { .. } => {
                ApiError::CapacityExhausted(e.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    r#type: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error", msg)
            }
            ApiError::CapacityExhausted(msg) => {
                (StatusCode::INSUFFICIENT_STORAGE, "capacity_error", msg)
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", msg),
        };

        let body = ErrorResponse {
            error: ErrorBody {
                message,
                r#type: error_type,
            },
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_map_to_507() {
        let api: ApiError = CacheError::ArenaCapacityExceeded {
            requested: 100,
            remaining: 0,
        }
        .into();
        assert!(matches!(api, ApiError::CapacityExhausted(_)));
    }

    #[test]
    fn invalid_input_maps_to_bad_request() {
        let api: ApiError = CacheError::InvalidInput("nope".into()).into();
        assert!(matches!(api, ApiError::InvalidRequest(_)));
    }
}
