use axum::{
  Extension, Json, Router,
  extract::Path,
  middleware,
  routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::{
  catalog::catalog,
  entities::{GeneratedPasswords, JobStep, Session},
  error::ApiError,
  orchestrator::DeployRequest,
  state,
};

use super::auth::auth_request;

pub fn router() -> Router {
  Router::new()
    .route(
      "/ssh",
      post(deploy_ssh).layer(middleware::from_fn(auth_request)),
    )
    .route("/ssh/{deployment_id}", get(progress))
}

#[derive(Deserialize)]
struct DeploySshRequest {
  app_id: String,
  ssh_host: String,
  ssh_port: u16,
  #[serde(default)]
  ssh_user: Option<String>,
  #[serde(default)]
  setup_tunnel: bool,
  #[serde(default)]
  tunnel_port: Option<u16>,
  instance_hash: String,
}

#[derive(Serialize)]
struct DeploySshResponse {
  deployment_id: String,
  status: &'static str,
}

async fn deploy_ssh(
  Extension(session): Extension<Session>,
  Json(request): Json<DeploySshRequest>,
) -> Result<Json<DeploySshResponse>, ApiError> {
  let app = catalog()
    .get(&request.app_id)
    .cloned()
    .ok_or_else(|| ApiError::NotFound("app".to_string()))?;

  let deployment_id = state::orchestrator()
    .accept_request(
      &session.address,
      &app.name,
      &app.compose,
      DeployRequest {
        app_id: request.app_id,
        ssh_host: request.ssh_host,
        ssh_port: request.ssh_port,
        ssh_user: request.ssh_user,
        setup_tunnel: request.setup_tunnel,
        tunnel_port: request.tunnel_port,
        instance_id: request.instance_hash,
      },
    )
    .await
    .map_err(|e| ApiError::Validation(format!("{e:#}")))?;

  Ok(Json(DeploySshResponse { deployment_id, status: "started" }))
}

#[derive(Serialize)]
struct JobProgressResponse {
  deployment_id: String,
  step: JobStep,
  log: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  generated_passwords: Option<GeneratedPasswords>,
}

/// Unauthenticated: deployment identifiers are unguessable (embed a random
/// wallet-address prefix and timestamp), and this is the endpoint clients
/// poll immediately after a deploy request before they'd necessarily have a
/// long-lived session.
async fn progress(
  Path(deployment_id): Path<String>,
) -> Result<Json<JobProgressResponse>, ApiError> {
  let job = state::orchestrator()
    .job_snapshot(&deployment_id)
    .await
    .ok_or_else(|| ApiError::NotFound("deployment".to_string()))?;

  Ok(Json(JobProgressResponse {
    deployment_id: job.deployment_id,
    step: job.step,
    log: job.log,
    generated_passwords: None,
  }))
}
