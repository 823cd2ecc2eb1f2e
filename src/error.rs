use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt::Display;
use thiserror::Error;

pub const ERR_UPDATED_AT_NOT_SET: &str = "permissions updated_at timestamp must be set";

/// Errors raised by the permission and sync-job stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{step}: {source}")]
    Database {
        step: &'static str,
        #[source]
        source: diesel::result::Error,
    },
    #[error("database pool error: {0}")]
    Pool(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
            || matches!(
                self,
                Self::Database {
                    source: diesel::result::Error::NotFound,
                    ..
                }
            )
    }
}

impl From<diesel::result::Error> for StoreError {
    fn from(source: diesel::result::Error) -> Self {
        Self::Database {
            step: "query",
            source,
        }
    }
}

/// Attaches the name of the workflow step to a failed query.
pub trait StepContext<T> {
    fn step(self, step: &'static str) -> StoreResult<T>;
}

impl<T> StepContext<T> for Result<T, diesel::result::Error> {
    fn step(self, step: &'static str) -> StoreResult<T> {
        self.map_err(|source| StoreError::Database { step, source })
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "resource not found")
    }

    pub fn internal<E: Display>(error: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        if value.is_not_found() {
            return match value {
                StoreError::NotFound(what) => {
                    AppError::new(StatusCode::NOT_FOUND, format!("{what} not found"))
                }
                _ => AppError::not_found(),
            };
        }
        match value {
            StoreError::Validation(message) => AppError::bad_request(message),
            other => AppError::internal(other),
        }
    }
}

impl From<diesel::result::Error> for AppError {
    fn from(value: diesel::result::Error) -> Self {
        StoreError::from(value).into()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError::internal(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_detected_through_database_wrapper() {
        let wrapped: StoreResult<()> = Err(diesel::result::Error::NotFound).step("loading job");
        let err = wrapped.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "loading job: Record not found");
    }

    #[test]
    fn store_errors_map_to_http_statuses() {
        let not_found: AppError = StoreError::not_found("permission sync job").into();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let invalid: AppError = StoreError::validation(ERR_UPDATED_AT_NOT_SET).into();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let broken: AppError = StoreError::Pool("timed out".to_string()).into();
        assert_eq!(broken.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
