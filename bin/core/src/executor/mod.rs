mod ssh;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use ssh::SshExecutor;

use validations::{StringValidator, StringValidatorMatches};

use crate::entities::ContainerSummary;

/// The one true choke point for embedding a caller-supplied identifier in a
/// remote command. Any future code path that needs to do so must route
/// through this.
pub fn validate_app_id(app_id: &str) -> anyhow::Result<()> {
  StringValidator::default()
    .matches(StringValidatorMatches::AppId)
    .validate(app_id)
}

/// Content-based convention (not a plugin mechanism): apps whose identifier
/// names a metrics stack get a canned scrape-config file alongside the
/// compose document.
pub fn wants_metrics_config(app_id: &str) -> bool {
  let lower = app_id.to_ascii_lowercase();
  lower.contains("prometheus") || lower.contains("grafana")
}

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
pub const COMPOSE_UP_TIMEOUT: Duration = Duration::from_secs(600);
pub const SSH_PROBE_TIMEOUT: Duration = Duration::from_secs(15);
pub const PROXY_INSTALL_TIMEOUT: Duration = Duration::from_secs(120);

/// SSH connection parameters for a single deployment target. Carries no
/// state beyond the call it's passed to.
#[derive(Debug, Clone)]
pub struct SshTarget {
  pub host: String,
  pub port: u16,
  pub user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
  pub code: i32,
  /// Last 2,000 bytes of captured stdout.
  pub stdout: String,
  /// Last 1,000 bytes of captured stderr.
  pub stderr: String,
}

impl CommandResult {
  pub fn ok(&self) -> bool {
    self.code == 0
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
  Running,
  Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployStep {
  pub name: String,
  pub ok: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResult {
  pub status: DeployStatus,
  pub steps: Vec<DeployStep>,
  pub containers: Vec<ContainerSummary>,
}

/// Executes shell commands and writes files on a remote host over SSH.
/// Introduced as a trait (rather than a concrete struct used directly) so
/// the orchestrator can be unit tested with a fake implementation, without
/// a real SSH connection.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
  async fn test_connection(&self, target: &SshTarget) -> bool;

  async fn run_command(
    &self,
    target: &SshTarget,
    cmd: &str,
    timeout: Duration,
  ) -> anyhow::Result<CommandResult>;

  async fn deploy_compose(
    &self,
    target: &SshTarget,
    app_id: &str,
    compose: &str,
  ) -> anyhow::Result<DeployResult>;

  async fn setup_caddy_proxy(
    &self,
    target: &SshTarget,
    local_port: u16,
    subdomain: &str,
    base_domain: &str,
  ) -> anyhow::Result<String>;

  async fn get_app_status(
    &self,
    target: &SshTarget,
    app_id: &str,
  ) -> anyhow::Result<Vec<ContainerSummary>>;

  async fn stop_app(
    &self,
    target: &SshTarget,
    app_id: &str,
  ) -> anyhow::Result<()>;

  async fn remove_app(
    &self,
    target: &SshTarget,
    app_id: &str,
  ) -> anyhow::Result<()>;

  /// Removes `public_key` from the target's authorized_keys, matching on
  /// key-type + base64 prefix and ignoring any trailing comment. Failure is
  /// logged by the caller, not fatal.
  async fn revoke_deployment_key(
    &self,
    target: &SshTarget,
    public_key: &str,
  ) -> anyhow::Result<()>;
}
