mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use http::HttpAdapter;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Balance {
  pub main: Option<f64>,
  pub credit: Option<f64>,
  pub locked: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKeyEntry {
  pub key: String,
  pub label: String,
  pub source_hash: String,
  pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeNode {
  pub hash: String,
  pub name: String,
  pub base_url: String,
  pub payment_address: String,
  pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Allocation {
  pub allocated: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ipv4: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ssh_port: Option<u16>,
}

/// Read-only access to the decentralized-network scheduler, compute-node
/// execution listings, the gateway's subdomain lookup, and the balance
/// service. Stateless; isolates all outbound HTTP from orchestration logic.
/// Every call swallows transport errors into empty/nil results — callers own
/// retry policy.
#[async_trait]
pub trait NetworkAdapter: Send + Sync {
  async fn get_balance(&self, address: &str) -> Balance;

  async fn list_ssh_keys(&self, address: &str) -> Vec<SshKeyEntry>;

  async fn list_compute_nodes(&self) -> Vec<ComputeNode>;

  async fn lookup_allocation(
    &self,
    instance_id: &str,
    preferred_node_url: Option<&str>,
  ) -> Allocation;

  async fn lookup_subdomain(&self, instance_id: &str) -> Option<String>;

  /// Best-effort; returns the node's HTTP status for logging and never
  /// raises.
  async fn notify_node_start(
    &self,
    node_url: &str,
    instance_id: &str,
  ) -> Option<u16>;
}
