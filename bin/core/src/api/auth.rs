use axum::{
  Json, Router,
  extract::Request,
  http::HeaderMap,
  middleware::Next,
  response::Response,
  routing::{get, post},
};
use rate_limit::WithFailureRateLimit;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{error::ApiError, state};

pub fn router() -> Router {
  Router::new()
    .route("/nonce", post(request_nonce))
    .route("/verify", post(verify))
    .route("/session", get(session))
    .route("/logout", post(logout))
}

/// Extracts a bearer token, resolves it to a [Session], and inserts it as a
/// request extension. Any handler behind this layer can take
/// `Extension<Session>` to get the caller's authenticated address.
pub async fn auth_request(
  headers: HeaderMap,
  mut req: Request,
  next: Next,
) -> Result<Response, ApiError> {
  let token = bearer_token(&headers)
    .ok_or_else(|| ApiError::Auth("missing bearer token".to_string()))?;
  let session = state::auth_service()
    .session(token)
    .await
    .ok_or_else(|| ApiError::Auth("invalid or expired".to_string()))?;
  req.extensions_mut().insert(session);
  Ok(next.run(req).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
  headers
    .get(axum::http::header::AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.strip_prefix("Bearer "))
}

#[derive(Deserialize)]
struct NonceRequest {
  address: String,
}

#[derive(Serialize)]
struct NonceResponse {
  nonce: String,
  message: String,
}

async fn request_nonce(
  headers: HeaderMap,
  Json(request): Json<NonceRequest>,
) -> Result<Json<NonceResponse>, ApiError> {
  let (nonce, message) = async {
    state::auth_service().request_nonce(&request.address).await
  }
  .with_failure_rate_limit_using_headers(state::nonce_rate_limiter(), &headers)
  .await
  .map_err(|e| ApiError::from(e).or_validation())?;
  Ok(Json(NonceResponse { nonce, message }))
}

#[derive(Deserialize)]
struct VerifyRequest {
  address: String,
  nonce: String,
  signature: String,
}

#[derive(Serialize)]
struct VerifyResponse {
  token: String,
  address: String,
  expires_at: i64,
}

async fn verify(
  headers: HeaderMap,
  Json(request): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
  let address = request.address.to_lowercase();
  let (token, expires_at) = async {
    state::auth_service()
      .verify(&request.address, &request.nonce, &request.signature)
      .await
  }
  .with_failure_rate_limit_using_headers(state::verify_rate_limiter(), &headers)
  .await
  .map_err(|e| match e {
    rate_limit::RateLimitError::TooManyAttempts { max_attempts, window } => {
      ApiError::RateLimited { limit: max_attempts, window }
    }
    _ => ApiError::Auth("verification failed".to_string()),
  })?;
  Ok(Json(VerifyResponse { token, address, expires_at }))
}

async fn session(headers: HeaderMap) -> Json<serde_json::Value> {
  let Some(session) = bearer_token(&headers) else {
    return Json(json!({ "authenticated": false }));
  };
  match state::auth_service().session(session).await {
    Some(session) => Json(json!({
      "authenticated": true,
      "address": session.address,
      "expires_at": session.expires_at,
    })),
    None => Json(json!({ "authenticated": false })),
  }
}

async fn logout(headers: HeaderMap) -> Json<serde_json::Value> {
  if let Some(token) = bearer_token(&headers) {
    state::auth_service().logout(token).await;
  }
  Json(json!({ "ok": true }))
}

impl ApiError {
  /// Rate-limit-wrapped handlers surface the inner nonce/verify failure as a
  /// `400`, never a `500` -- these are always caller input problems (bad
  /// address, unreachable nonce), not internal failures.
  fn or_validation(self) -> Self {
    match self {
      ApiError::Internal(e) => ApiError::Validation(format!("{e:#}")),
      other => other,
    }
  }
}
