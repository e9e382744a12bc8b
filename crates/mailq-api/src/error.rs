//! HTTP error response conversion
//!
//! Handlers return `Result<_, HttpAppError>`. Anything convertible into
//! [`AppError`] renders with the status, code and body described by its
//! [`ErrorMetadata`]. The body starts without debugging details;
//! [`error_details_middleware`] adds them back for non-production
//! configurations.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use mailq_core::{AppError, ErrorMetadata, LogLevel};
use mailq_db::StoreError;
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::state::AppState;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Machine-readable error code for programmatic handling
    pub code: String,
    /// Whether the same request may succeed later
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

/// Full error body, carried in the response extensions of non-sensitive errors.
#[derive(Clone)]
struct DetailedError(ErrorResponse);

/// Wrapper so `IntoResponse` can be implemented for the core error type.
#[derive(Debug)]
pub struct HttpAppError(pub AppError);

impl From<AppError> for HttpAppError {
    fn from(err: AppError) -> Self {
        HttpAppError(err)
    }
}

impl From<StoreError> for HttpAppError {
    fn from(err: StoreError) -> Self {
        HttpAppError(err.into())
    }
}

fn log_error(error: &AppError) {
    let error_type = error.error_type();
    match error.log_level() {
        LogLevel::Debug => {
            tracing::debug!(error = %error, error_type = error_type, "Request rejected");
        }
        LogLevel::Warn => {
            tracing::warn!(error = %error, error_type = error_type, "Request rejected");
        }
        LogLevel::Error => {
            tracing::error!(error = %error, error_type = error_type, "Request failed");
        }
    }
}

fn error_response(error: &AppError, expose_details: bool) -> ErrorResponse {
    ErrorResponse {
        error: error.client_message(),
        details: expose_details.then(|| error.detailed_message()),
        error_type: expose_details.then(|| error.error_type().to_string()),
        code: error.error_code().to_string(),
        recoverable: error.is_recoverable(),
        suggested_action: error.suggested_action().map(String::from),
    }
}

impl IntoResponse for HttpAppError {
    fn into_response(self) -> Response {
        let app_error = &self.0;
        let status = StatusCode::from_u16(app_error.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        log_error(app_error);

        let mut response = (status, Json(error_response(app_error, false))).into_response();
        if !app_error.is_sensitive() {
            response
                .extensions_mut()
                .insert(DetailedError(error_response(app_error, true)));
        }
        response
    }
}

/// Re-render error bodies with details unless the configuration is production.
pub async fn error_details_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    let detailed = response.extensions_mut().remove::<DetailedError>();

    match detailed {
        Some(DetailedError(body)) if !state.config.is_production() => {
            (response.status(), Json(body)).into_response()
        }
        _ => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_input_maps_to_bad_request() {
        let response = HttpAppError(AppError::InvalidInput("Missing required fields: to".into()))
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.extensions().get::<DetailedError>().is_some());
    }

    #[test]
    fn queue_full_maps_to_service_unavailable() {
        let response = HttpAppError::from(StoreError::QueueFull { capacity: 1 }).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn sensitive_errors_carry_no_details() {
        let err = AppError::Internal("connection string leaked".into());
        let body = error_response(&err, false);
        assert_eq!(body.error, "Internal server error");
        assert!(body.details.is_none());
        assert_eq!(body.code, "INTERNAL_ERROR");

        let response = HttpAppError(err).into_response();
        assert!(response.extensions().get::<DetailedError>().is_none());
    }

    #[test]
    fn detailed_body_names_the_error_type() {
        let err = AppError::Conflict("Task 7 is sent".into());
        let body = error_response(&err, true);
        assert_eq!(body.error, "Task 7 is sent");
        assert_eq!(body.error_type.as_deref(), Some("Conflict"));
        assert!(body.details.unwrap().contains("Conflict"));
    }
}
