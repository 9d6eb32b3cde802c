use std::time::Duration;

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde::Serialize;

/// The one place a structured result becomes an HTTP status code. Internal
/// components (store, executor, adapter, orchestrator) stay on
/// `anyhow::Result` and only get wrapped into this at the API boundary.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
  #[error("{0}")]
  Validation(String),
  #[error("invalid or expired session")]
  Auth(String),
  #[error("not the resource owner")]
  Forbidden,
  #[error("{0} not found")]
  NotFound(String),
  #[error("rate limited")]
  RateLimited { limit: usize, window: Duration },
  #[error(transparent)]
  Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
  error: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  limit: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  window_secs: Option<u64>,
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, body) = match self {
      ApiError::Validation(reason) => (
        StatusCode::BAD_REQUEST,
        ErrorBody { error: reason, limit: None, window_secs: None },
      ),
      // Never reveal which of missing/expired/forged/mismatched failed.
      ApiError::Auth(_) => (
        StatusCode::UNAUTHORIZED,
        ErrorBody {
          error: "invalid or expired".into(),
          limit: None,
          window_secs: None,
        },
      ),
      ApiError::Forbidden => (
        StatusCode::FORBIDDEN,
        ErrorBody {
          error: "not the resource owner".into(),
          limit: None,
          window_secs: None,
        },
      ),
      ApiError::NotFound(what) => (
        StatusCode::NOT_FOUND,
        ErrorBody {
          error: format!("{what} not found"),
          limit: None,
          window_secs: None,
        },
      ),
      ApiError::RateLimited { limit, window } => (
        StatusCode::TOO_MANY_REQUESTS,
        ErrorBody {
          error: "rate limited".into(),
          limit: Some(limit),
          window_secs: Some(window.as_secs()),
        },
      ),
      ApiError::Internal(e) => {
        tracing::error!("internal error | {e:#}");
        (
          StatusCode::INTERNAL_SERVER_ERROR,
          ErrorBody {
            error: "internal error".into(),
            limit: None,
            window_secs: None,
          },
        )
      }
    };
    (status, Json(body)).into_response()
  }
}

impl<E> From<rate_limit::RateLimitError<E>> for ApiError
where
  ApiError: From<E>,
{
  fn from(e: rate_limit::RateLimitError<E>) -> Self {
    match e {
      rate_limit::RateLimitError::TooManyAttempts {
        max_attempts,
        window,
      } => ApiError::RateLimited { limit: max_attempts, window },
      rate_limit::RateLimitError::MissingClientIp => {
        ApiError::Validation("could not determine client ip".into())
      }
      rate_limit::RateLimitError::Inner(e) => ApiError::from(e),
    }
  }
}
