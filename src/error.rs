use crate::io_struct::ErrorBody;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use std::time::Duration;
use thiserror::Error;

/// Failure of a single downstream call. A dispatcher recovers from these by
/// moving on to the next instance.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AttemptError {
    #[error("timed out after {}s", .0.as_secs_f64())]
    UpstreamTimeout(Duration),
    #[error("connection failed: {0}")]
    UpstreamConnectionError(String),
    #[error("HTTP {status}: {detail}")]
    UpstreamHTTPError { status: u16, detail: String },
    #[error("malformed response body: {0}")]
    MalformedBody(String),
}

impl AttemptError {
    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            AttemptError::UpstreamTimeout(timeout)
        } else if err.is_decode() {
            AttemptError::MalformedBody(err.to_string())
        } else {
            AttemptError::UpstreamConnectionError(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("All {stage} instances failed after {attempts} attempts (last error: {last_error})")]
    AllInstancesUnavailable {
        stage: String,
        attempts: usize,
        last_error: AttemptError,
    },
}

impl ResponseError for DispatchError {
    fn status_code(&self) -> StatusCode {
        StatusCode::SERVICE_UNAVAILABLE
    }

    fn error_response(&self) -> HttpResponse {
        detail_response(self.status_code(), self.to_string())
    }
}

/// Error raised by a transform on its own input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    #[error("expected {expected} payload, found {found}")]
    WrongPayload {
        expected: &'static str,
        found: &'static str,
    },
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageError {
    #[error("{stage} processing failed: {reason}")]
    LocalProcessing { stage: String, reason: String },
    /// `stage` names the downstream stage whose dispatcher failed.
    #[error("{stage} error: {detail}")]
    Upstream { stage: String, detail: String },
    #[error("{stage} rejected request: {reason}")]
    InvalidPayload { stage: String, reason: String },
    #[error("injected failure at {stage}")]
    InjectedFailure { stage: String },
}

impl ResponseError for StageError {
    fn status_code(&self) -> StatusCode {
        match self {
            StageError::InvalidPayload { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        detail_response(self.status_code(), self.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FanOutError {
    #[error("parallelism must be at least 1")]
    ZeroParallelism,
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Dataset file not found: {name} (available: {})", .available.join(", "))]
    NotFound { name: String, available: Vec<String> },
    #[error("failed to read dataset: {0}")]
    Io(#[from] std::io::Error),
}

pub fn detail_response(status: StatusCode, detail: String) -> HttpResponse {
    HttpResponse::build(status).json(ErrorBody { detail })
}
