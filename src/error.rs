use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::time::Duration;
use thiserror::Error;

use crate::classifier::ErrorCategory;

// Raw failure of one backend call, before classification
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timeout after {0:?}")]
    Timeout(Duration),

    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Network(format!("timeout: {err}"))
        } else if err.is_decode() {
            BackendError::InvalidResponse(err.to_string())
        } else {
            BackendError::Network(format!("fetch failed: {err}"))
        }
    }
}

// Outcome surfaced to whoever submitted the prompt
#[derive(Debug, Clone, Error)]
pub enum GenerateError {
    #[error("Prompt is required")]
    EmptyPrompt,

    #[error("{message}")]
    Failed {
        category: ErrorCategory,
        message: String,
        attempts: u32,
    },

    #[error("Generation worker is not running")]
    WorkerUnavailable,
}

impl GenerateError {
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            GenerateError::Failed { category, .. } => Some(*category),
            _ => None,
        }
    }
}

impl IntoResponse for GenerateError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            GenerateError::EmptyPrompt => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            GenerateError::WorkerUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "WORKER_UNAVAILABLE"),
            GenerateError::Failed { category, .. } => match category {
                ErrorCategory::RateLimit | ErrorCategory::QuotaExceeded => {
                    (StatusCode::TOO_MANY_REQUESTS, category.code())
                }
                ErrorCategory::Offline => (StatusCode::SERVICE_UNAVAILABLE, category.code()),
                _ => (StatusCode::BAD_GATEWAY, category.code()),
            },
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "code": code,
        });

        (status, Json(body)).into_response()
    }
}

// Local state and persistence collaborator failures; never fail a generation
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store returned HTTP {0}")]
    Status(u16),
}
