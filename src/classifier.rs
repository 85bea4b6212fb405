//! Maps a raw backend failure onto a retry decision and the message shown
//! to the user.

use serde::Serialize;

use crate::error::BackendError;

const SERVER_ERROR_CODES: [u16; 4] = [500, 502, 503, 504];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    TransientNetwork,
    ServerError,
    RateLimit,
    QuotaExceeded,
    Offline,
    Unknown,
}

impl ErrorCategory {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorCategory::TransientNetwork => "TRANSIENT_NETWORK",
            ErrorCategory::ServerError => "SERVER_ERROR",
            ErrorCategory::RateLimit => "RATE_LIMITED",
            ErrorCategory::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCategory::Offline => "OFFLINE",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub retryable: bool,
    pub user_message: String,
}

/// Classify a failed backend call.
///
/// `online` is the connectivity flag at the time of failure; anything that
/// fails while offline is reported as [`ErrorCategory::Offline`] and never
/// retried. Terminal service errors are checked before the retryable
/// categories so a 503 saying "rate limit" is not retried.
pub fn classify(err: &BackendError, online: bool) -> Classification {
    let raw = err.to_string();
    let text = raw.to_lowercase();

    let (category, user_message) = if !online {
        (
            ErrorCategory::Offline,
            "You appear to be offline. Please check your internet connection and try again."
                .to_string(),
        )
    } else if text.contains("rate limit") {
        (
            ErrorCategory::RateLimit,
            "Too many requests. Please wait a moment before trying again.".to_string(),
        )
    } else if text.contains("quota") || text.contains("limit") {
        (
            ErrorCategory::QuotaExceeded,
            "API quota exceeded. Please try again later or consider upgrading your plan."
                .to_string(),
        )
    } else if is_server_error(err, &text) {
        (
            ErrorCategory::ServerError,
            format!("The image service is temporarily unavailable ({raw}). Please try again."),
        )
    } else if is_transient(err, &text) {
        (
            ErrorCategory::TransientNetwork,
            format!("Could not reach the image service ({raw}). Please try again."),
        )
    } else {
        // surface the backend's own wording, without our status prefix
        let message = match err {
            BackendError::Http { message, .. } => message.clone(),
            _ => raw,
        };
        (ErrorCategory::Unknown, message)
    };

    let retryable = matches!(
        category,
        ErrorCategory::TransientNetwork | ErrorCategory::ServerError
    );

    Classification {
        category,
        retryable,
        user_message,
    }
}

fn is_server_error(err: &BackendError, text: &str) -> bool {
    if let Some(status) = err.status() {
        return SERVER_ERROR_CODES.contains(&status);
    }
    SERVER_ERROR_CODES
        .iter()
        .any(|code| text.contains(&code.to_string()))
}

fn is_transient(err: &BackendError, text: &str) -> bool {
    matches!(err, BackendError::Network(_) | BackendError::Timeout(_))
        || ["network", "timeout", "fetch"]
            .iter()
            .any(|needle| text.contains(needle))
}
