//! Error types shared across the crate.
//!
//! `StoreError` covers the remote store only; `AppError` is what handlers
//! return and it renders as the portal's standard JSON error envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Failures talking to the Supabase REST API.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Network-level failure (DNS, TLS, timeout, connection refused).
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// PostgREST answered with a non-success status.
    #[error("api error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        code: Option<String>,
    },

    /// A response header or body could not be interpreted.
    #[error("unexpected response: {0}")]
    Malformed(String),
}

/// Application-level error surfaced to HTTP clients.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad client input, maps to 400.
    #[error("{0}")]
    Validation(String),

    /// Requested entity does not exist, maps to 404.
    #[error("{0}")]
    NotFound(String),

    /// Entity already exists, maps to 409.
    #[error("{0}")]
    Conflict(String),

    /// The operation needs the remote store and it is not configured.
    #[error("{0}")]
    Unavailable(String),

    /// A named lock could not be acquired within the wait window.
    #[error("timeout ao adquirir lock para {0}")]
    LockTimeout(&'static str),

    /// Remote store failure that could not be hidden by a fallback.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Spreadsheet read or write failure.
    #[error("erro de planilha: {0}")]
    Spreadsheet(String),

    /// Filesystem failure.
    #[error("erro de arquivo: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl From<calamine::Error> for AppError {
    fn from(e: calamine::Error) -> Self {
        AppError::Spreadsheet(e.to_string())
    }
}

impl From<calamine::XlsxError> for AppError {
    fn from(e: calamine::XlsxError) -> Self {
        AppError::Spreadsheet(e.to_string())
    }
}

impl From<rust_xlsxwriter::XlsxError> for AppError {
    fn from(e: rust_xlsxwriter::XlsxError) -> Self {
        AppError::Spreadsheet(e.to_string())
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("Request failed: {}", self);
        }
        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_bad_request() {
        assert_eq!(
            AppError::Validation("nome inválido".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn store_error_maps_to_internal() {
        let err = AppError::Store(StoreError::Malformed("no content-range".into()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
