pub mod apps;
pub mod auth;
pub mod deploy;
pub mod deployments;
pub mod network;

use axum::{
  Json, Router,
  http::{HeaderName, HeaderValue},
  routing::get,
};
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::config::cors_layer;

pub fn app() -> Router {
  Router::new()
    .route("/healthz", get(|| async { Json(json!({ "status": "ok" })) }))
    .nest("/api/auth", auth::router())
    .nest("/api/apps", apps::router())
    .nest("/api", network::router())
    .nest("/api/deploy", deploy::router())
    .nest("/api/deployments", deployments::router())
    .layer(cors_layer())
    .layer(SetResponseHeaderLayer::overriding(
      HeaderName::from_static("x-content-type-options"),
      HeaderValue::from_static("nosniff"),
    ))
    .layer(SetResponseHeaderLayer::overriding(
      HeaderName::from_static("x-frame-options"),
      HeaderValue::from_static("DENY"),
    ))
    .layer(SetResponseHeaderLayer::overriding(
      HeaderName::from_static("x-xss-protection"),
      HeaderValue::from_static("1; mode=block"),
    ))
    .layer(SetResponseHeaderLayer::overriding(
      HeaderName::from_static("referrer-policy"),
      HeaderValue::from_static("strict-origin-when-cross-origin"),
    ))
}
