//! JSON error responses mapped from the shared error taxonomy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dd_domain::Error;

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
pub fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Wrapper so handlers can `?` on domain errors.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        api_error(status, self.0.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_maps_to_409() {
        let response = ApiError(Error::Conflict("illegal transition".into())).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn forbidden_and_auth_are_distinct() {
        assert_eq!(
            ApiError(Error::Auth("no cookie".into())).into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError(Error::Forbidden("role too low".into()))
                .into_response()
                .status(),
            StatusCode::FORBIDDEN
        );
    }
}
