use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Errors that cross the HTTP boundary and must carry a status code and a
/// stable `error_type` label for the `request_errors_total` metric.
///
/// Internal subsystem code (discovery fetches, scrape loops, queue scheduling)
/// keeps using `anyhow::Result` / `anyhow::Context` the way the rest of the
/// router's plumbing does; it is converted into one of these variants only at
/// the surface that reports it to a client or to `/health`.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("unknown model `{0}`")]
    UnknownModel(String),

    #[error("no healthy endpoint available for model `{0}`")]
    NoHealthyEndpoint(String),

    #[error("upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("all upstream attempts failed: {0}")]
    FailoverExhausted(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RouterError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RouterError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            RouterError::MissingField(_) => StatusCode::BAD_REQUEST,
            RouterError::UnknownModel(_) => StatusCode::BAD_REQUEST,
            RouterError::NoHealthyEndpoint(_) => StatusCode::SERVICE_UNAVAILABLE,
            RouterError::Upstream(_) => StatusCode::BAD_GATEWAY,
            RouterError::FailoverExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            RouterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            RouterError::InvalidBody(_) => "invalid_request",
            RouterError::MissingField(_) => "invalid_request",
            RouterError::UnknownModel(_) => "unknown_model",
            RouterError::NoHealthyEndpoint(_) => "no_healthy_endpoint",
            RouterError::Upstream(_) => "upstream_error",
            RouterError::FailoverExhausted(_) => "failover_exhausted",
            RouterError::Internal(_) => "internal_error",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    code: u16,
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: ErrorDetail {
                message: self.to_string(),
                kind: self.error_type(),
                code: status.as_u16(),
            },
        };
        (status, axum::Json(body)).into_response()
    }
}

pub type RouterResult<T> = Result<T, RouterError>;
