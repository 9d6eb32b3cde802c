use axum::{
  Extension, Json, Router,
  extract::Path,
  middleware,
  routing::{delete, get, post},
};
use serde::Serialize;

use crate::{
  entities::{
    ContainerSummary, Deployment, DeploymentStatus, GeneratedPasswords,
    Session, TunnelStatus,
  },
  error::ApiError,
  state,
};

use super::auth::auth_request;

pub fn router() -> Router {
  Router::new()
    .route("/my", get(my_deployments))
    .route("/{id}/status", get(status))
    .route("/{id}/stop", post(stop))
    .route("/{id}", delete(remove))
    .layer(middleware::from_fn(auth_request))
}

#[derive(Serialize)]
struct DeploymentView {
  id: String,
  owner: String,
  app_id: String,
  app_name: String,
  ssh_host: String,
  ssh_port: u16,
  instance_id: String,
  status: DeploymentStatus,
  created_at: i64,
  updated_at: i64,
  #[serde(skip_serializing_if = "Option::is_none")]
  public_url: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  containers: Option<Vec<ContainerSummary>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  error: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  warning: Option<String>,
  tunnel: TunnelStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  generated_passwords: Option<GeneratedPasswords>,
}

impl DeploymentView {
  fn from_deployment(d: Deployment, disclose_passwords: bool) -> Self {
    Self {
      id: d.id,
      owner: d.owner,
      app_id: d.app_id,
      app_name: d.app_name,
      ssh_host: d.ssh_host,
      ssh_port: d.ssh_port,
      instance_id: d.instance_id,
      status: d.status,
      created_at: d.created_at,
      updated_at: d.updated_at,
      public_url: d.public_url,
      containers: d.containers,
      error: d.error,
      warning: d.warning,
      tunnel: d.tunnel,
      generated_passwords: if disclose_passwords { d.generated_passwords } else { None },
    }
  }
}

fn require_owner(deployment: &Deployment, session: &Session) -> Result<(), ApiError> {
  if deployment.owner != session.address {
    return Err(ApiError::Forbidden);
  }
  Ok(())
}

async fn my_deployments(
  Extension(session): Extension<Session>,
) -> Json<Vec<DeploymentView>> {
  let deployments = state::deployment_store().list_by_owner(&session.address).await;
  Json(
    deployments
      .into_iter()
      .map(|d| DeploymentView::from_deployment(d, false))
      .collect(),
  )
}

/// Live per-container status. This is also the single endpoint through which
/// generated passwords are disclosed -- exactly once, on the first poll
/// after they exist on the record.
async fn status(
  Extension(session): Extension<Session>,
  Path(id): Path<String>,
) -> Result<Json<DeploymentView>, ApiError> {
  let deployment = state::deployment_store()
    .get(&id)
    .await
    .ok_or_else(|| ApiError::NotFound("deployment".to_string()))?;
  require_owner(&deployment, &session)?;

  if !deployment.status.is_terminal()
    && let Err(e) = state::orchestrator().refresh_status(&id).await
  {
    tracing::warn!("refresh_status failed for {id} | {e:#}");
  }

  let deployment = state::deployment_store()
    .get(&id)
    .await
    .ok_or_else(|| ApiError::NotFound("deployment".to_string()))?;

  let disclose =
    !deployment.passwords_disclosed && deployment.generated_passwords.is_some();
  if disclose {
    state::deployment_store()
      .update(&id, |d| d.passwords_disclosed = true)
      .await?;
  }

  Ok(Json(DeploymentView::from_deployment(deployment, disclose)))
}

async fn stop(
  Extension(session): Extension<Session>,
  Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
  let deployment = state::deployment_store()
    .get(&id)
    .await
    .ok_or_else(|| ApiError::NotFound("deployment".to_string()))?;
  require_owner(&deployment, &session)?;

  state::orchestrator().stop_deployment(&id).await?;
  Ok(Json(serde_json::json!({ "ok": true })))
}

async fn remove(
  Extension(session): Extension<Session>,
  Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
  let deployment = state::deployment_store()
    .get(&id)
    .await
    .ok_or_else(|| ApiError::NotFound("deployment".to_string()))?;
  require_owner(&deployment, &session)?;

  state::orchestrator().remove_deployment(&id).await?;
  Ok(Json(serde_json::json!({ "ok": true })))
}
