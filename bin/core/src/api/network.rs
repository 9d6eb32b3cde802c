use axum::{
  Extension, Json, Router,
  extract::{Path, Query},
  middleware,
  routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;

use crate::{
  adapter::{Allocation, Balance, ComputeNode, SshKeyEntry},
  entities::Session,
  state,
};

use super::auth::auth_request;

pub fn router() -> Router {
  Router::new()
    .route("/credits/{address}", get(credits))
    .route("/ssh-keys/{address}", get(ssh_keys))
    .route("/crns", get(compute_nodes))
    .route("/marketplace-key", get(marketplace_key))
    .route("/allocation/{instance_hash}", get(allocation))
    .route(
      "/notify-allocation",
      post(notify_allocation).layer(middleware::from_fn(auth_request)),
    )
}

async fn credits(Path(address): Path<String>) -> Json<Balance> {
  Json(state::network_adapter().get_balance(&address).await)
}

async fn ssh_keys(Path(address): Path<String>) -> Json<Vec<SshKeyEntry>> {
  Json(state::network_adapter().list_ssh_keys(&address).await)
}

async fn compute_nodes() -> Json<Vec<ComputeNode>> {
  Json(state::network_adapter().list_compute_nodes().await)
}

async fn marketplace_key() -> Json<serde_json::Value> {
  Json(json!({ "public_key": state::deployment_public_key() }))
}

#[derive(Deserialize)]
struct AllocationQuery {
  crn_url: Option<String>,
}

async fn allocation(
  Path(instance_hash): Path<String>,
  Query(query): Query<AllocationQuery>,
) -> Json<Allocation> {
  Json(
    state::orchestrator()
      .lookup_allocation(&instance_hash, query.crn_url.as_deref())
      .await,
  )
}

#[derive(Deserialize)]
struct NotifyQuery {
  instance_hash: String,
  crn_url: String,
}

async fn notify_allocation(
  Extension(_session): Extension<Session>,
  Query(query): Query<NotifyQuery>,
) -> Json<serde_json::Value> {
  let status = state::orchestrator()
    .notify_allocation(&query.crn_url, &query.instance_hash)
    .await;
  Json(json!({ "status": status }))
}
