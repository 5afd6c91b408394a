use axum::{http::StatusCode, response::{IntoResponse, Response}};

use crate::error::ChatError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<ChatError>() {
            Some(ChatError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(ChatError::Validation(_)) => StatusCode::BAD_REQUEST,
            Some(ChatError::AccessDenied(_)) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = ?self.0, "request failed");
        }

        (status, self.0.to_string()).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
