//! RFC7807 problem responses for the service edge.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use crm_core::CoreError;
use crm_protocol::ProblemDetails;

pub struct ApiError {
    status: StatusCode,
    title: &'static str,
    detail: Option<String>,
    code: Option<&'static str>,
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            title: "Unauthorized",
            detail: None,
            code: None,
        }
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            title: "Forbidden",
            detail: Some(detail.into()),
            code: None,
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        error!(%err, "internal error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            title: "Internal Server Error",
            detail: None,
            code: None,
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(detail) => Self {
                status: StatusCode::BAD_REQUEST,
                title: "Bad Request",
                detail: Some(detail),
                code: Some("validation"),
            },
            CoreError::NotFound(detail) => Self {
                status: StatusCode::NOT_FOUND,
                title: "Not Found",
                detail: Some(detail),
                code: None,
            },
            CoreError::Forbidden(detail) => Self {
                status: StatusCode::FORBIDDEN,
                title: "Forbidden",
                detail: Some(detail),
                code: None,
            },
            CoreError::InvalidState(detail) => Self {
                status: StatusCode::CONFLICT,
                title: "Conflict",
                detail: Some(detail),
                code: Some("invalid_state"),
            },
            CoreError::Conflict(detail) => Self {
                status: StatusCode::CONFLICT,
                title: "Conflict",
                detail: Some(detail),
                code: Some("conflict"),
            },
            CoreError::Internal(err) => Self::internal(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ProblemDetails {
            r#type: "about:blank".to_string(),
            title: self.title.to_string(),
            status: self.status.as_u16(),
            detail: self.detail,
            code: self.code.map(str::to_string),
        };
        (self.status, Json(body)).into_response()
    }
}
