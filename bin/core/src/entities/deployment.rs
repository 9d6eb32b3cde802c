use serde::{Deserialize, Serialize};

/// A durable record owned exclusively by the [crate::store::DeploymentStore].
/// Created when the orchestrator accepts a request, destroyed on explicit
/// delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
  /// `{app_id}-{address_prefix_8}-{unix_seconds}`
  pub id: String,
  /// Lowercase-normalized `0x...` wallet address. Immutable after creation.
  pub owner: String,
  pub app_id: String,
  pub app_name: String,
  pub ssh_host: String,
  pub ssh_port: u16,
  pub instance_id: String,
  pub status: DeploymentStatus,
  pub created_at: i64,
  pub updated_at: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub public_url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub containers: Option<Vec<ContainerSummary>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  /// Non-fatal revoke failure, or other step that failed without failing
  /// the overall deployment.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub warning: Option<String>,
  #[serde(default)]
  pub tunnel: TunnelStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub generated_passwords: Option<GeneratedPasswords>,
  /// Once true, `generated_passwords` is never serialized back to a client
  /// again even if still present on the record. Not part of the public
  /// API shape (stripped before responses are built).
  #[serde(default)]
  pub passwords_disclosed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
  Deploying,
  Running,
  Complete,
  Failed,
  Stopped,
}

impl DeploymentStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      DeploymentStatus::Complete
        | DeploymentStatus::Failed
        | DeploymentStatus::Stopped
    )
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TunnelStatus {
  #[default]
  NotRequested,
  Pending,
  Published {
    url: String,
  },
  Skipped {
    reason: String,
  },
  Failed {
    reason: String,
  },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
  pub name: String,
  pub image: String,
  pub state: String,
  #[serde(default)]
  pub ports: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedPasswords {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub password: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub root_password: Option<String>,
}
