use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{Allocation, Balance, ComputeNode, NetworkAdapter, SshKeyEntry};

/// Virtualization type compute nodes must advertise support for to be
/// listed as deployment targets.
const TARGET_VM_TYPE: &str = "qemu";
/// Post type / channel ssh keys must be published under to be considered
/// registered for a given address.
const SSH_KEY_POST_TYPE: &str = "POST";
const SSH_KEY_CHANNEL: &str = "ALEPH-SSH";

pub struct HttpAdapter {
  client: reqwest::Client,
  scheduler_url: String,
  gateway_url: String,
  credits_url: String,
}

impl HttpAdapter {
  pub fn new(
    scheduler_url: impl Into<String>,
    gateway_url: impl Into<String>,
    credits_url: impl Into<String>,
  ) -> anyhow::Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(30))
      .build()?;
    Ok(Self {
      client,
      scheduler_url: scheduler_url.into(),
      gateway_url: gateway_url.into(),
      credits_url: credits_url.into(),
    })
  }

  async fn get_json<T: for<'de> Deserialize<'de>>(
    &self,
    url: &str,
    timeout: Duration,
  ) -> Option<T> {
    let response = self
      .client
      .get(url)
      .timeout(timeout)
      .send()
      .await
      .inspect_err(|e| tracing::warn!("GET {url} failed | {e:#}"))
      .ok()?;
    if !response.status().is_success() {
      tracing::warn!("GET {url} returned {}", response.status());
      return None;
    }
    response
      .json::<T>()
      .await
      .inspect_err(|e| tracing::warn!("GET {url} bad body | {e:#}"))
      .ok()
  }
}

#[derive(Deserialize, Default)]
struct BalanceResponse {
  balance: Option<f64>,
  credit_balance: Option<f64>,
  locked_amount: Option<f64>,
}

#[derive(Deserialize)]
struct MessagesEnvelope<T> {
  #[serde(default)]
  messages: Vec<T>,
}

#[derive(Deserialize)]
struct SshKeyMessage {
  content: SshKeyContent,
  item_hash: String,
  time: f64,
}

#[derive(Deserialize)]
struct SshKeyContent {
  key: String,
  #[serde(default)]
  label: String,
}

#[derive(Deserialize)]
struct NodesEnvelope {
  #[serde(default)]
  crns: Vec<RawComputeNode>,
}

#[derive(Deserialize)]
struct RawComputeNode {
  hash: String,
  #[serde(default)]
  name: String,
  address: Option<String>,
  payment_receiver_address: Option<String>,
  #[serde(default)]
  score: f64,
  #[serde(default)]
  compatible_vms: Vec<String>,
}

#[derive(Deserialize, Default)]
struct ExecutionsListResponse {
  #[serde(default)]
  executions: std::collections::HashMap<String, ExecutionEntry>,
}

#[derive(Deserialize, Default)]
struct ExecutionEntry {
  #[serde(default)]
  networking: Option<ExecutionNetworking>,
}

#[derive(Deserialize, Default)]
struct ExecutionNetworking {
  #[serde(default)]
  mapped_ports: std::collections::HashMap<String, MappedPort>,
}

#[derive(Deserialize, Default)]
struct MappedPort {
  host_ip: Option<String>,
  host_port: Option<u16>,
}

#[derive(Deserialize, Default)]
struct AllocationResponse {
  allocated: bool,
  vm_ipv4: Option<String>,
  ssh_port: Option<u16>,
}

#[derive(Deserialize)]
struct SubdomainResponse {
  subdomain: Option<String>,
}

#[async_trait]
impl NetworkAdapter for HttpAdapter {
  async fn get_balance(&self, address: &str) -> Balance {
    let url = format!("{}/api/v0/addresses/{address}/balance", self.credits_url);
    match self.get_json::<BalanceResponse>(&url, Duration::from_secs(10)).await {
      Some(response) => Balance {
        main: response.balance,
        credit: response.credit_balance,
        locked: response.locked_amount,
      },
      None => Balance::default(),
    }
  }

  async fn list_ssh_keys(&self, address: &str) -> Vec<SshKeyEntry> {
    let url = format!(
      "{}/api/v0/messages?addresses={address}&msgType={SSH_KEY_POST_TYPE}&channels={SSH_KEY_CHANNEL}",
      self.scheduler_url
    );
    match self
      .get_json::<MessagesEnvelope<SshKeyMessage>>(&url, Duration::from_secs(15))
      .await
    {
      Some(envelope) => envelope
        .messages
        .into_iter()
        .map(|m| SshKeyEntry {
          key: m.content.key,
          label: m.content.label,
          source_hash: m.item_hash,
          timestamp: m.time as i64,
        })
        .collect(),
      None => vec![],
    }
  }

  async fn list_compute_nodes(&self) -> Vec<ComputeNode> {
    let url = format!("{}/api/v0/aggregates/crns.json", self.scheduler_url);
    let Some(envelope) =
      self.get_json::<NodesEnvelope>(&url, Duration::from_secs(15)).await
    else {
      return vec![];
    };
    let mut nodes: Vec<ComputeNode> = envelope
      .nodes
      .into_iter()
      .filter(|n| {
        n.compatible_vms.iter().any(|vm| vm == TARGET_VM_TYPE)
          && n.address.is_some()
      })
      .map(|n| ComputeNode {
        hash: n.hash,
        name: n.name,
        base_url: n.address.unwrap_or_default(),
        payment_address: n.payment_receiver_address.unwrap_or_default(),
        score: n.score,
      })
      .collect();
    nodes.sort_by(|a, b| b.score.total_cmp(&a.score));
    nodes
  }

  async fn lookup_allocation(
    &self,
    instance_id: &str,
    preferred_node_url: Option<&str>,
  ) -> Allocation {
    if let Some(node_url) = preferred_node_url {
      let node_url = node_url.trim_end_matches('/');
      for path in ["/v2/about/executions/list", "/about/executions/list"] {
        let url = format!("{node_url}{path}");
        if let Some(response) = self
          .get_json::<ExecutionsListResponse>(&url, Duration::from_secs(10))
          .await
          && let Some(entry) = response.executions.get(instance_id)
          && let Some(networking) = &entry.networking
          && let Some(mapped) = networking.mapped_ports.get("22")
        {
          return Allocation {
            allocated: true,
            ipv4: mapped.host_ip.clone(),
            ssh_port: mapped.host_port,
          };
        }
      }
    }

    let url = format!(
      "{}/api/v0/instances/{instance_id}/allocation",
      self.scheduler_url
    );
    match self
      .get_json::<AllocationResponse>(&url, Duration::from_secs(15))
      .await
    {
      Some(response) => Allocation {
        allocated: response.allocated,
        ipv4: response.vm_ipv4,
        ssh_port: response.ssh_port,
      },
      None => Allocation::default(),
    }
  }

  async fn lookup_subdomain(&self, instance_id: &str) -> Option<String> {
    let url = format!("{}/api/subdomain/{instance_id}", self.gateway_url);
    self
      .get_json::<SubdomainResponse>(&url, Duration::from_secs(10))
      .await
      .and_then(|r| r.subdomain)
  }

  async fn notify_node_start(
    &self,
    node_url: &str,
    instance_id: &str,
  ) -> Option<u16> {
    let url = format!(
      "{}/control/{instance_id}/start",
      node_url.trim_end_matches('/')
    );
    match self.client.post(&url).timeout(Duration::from_secs(20)).send().await {
      Ok(response) => Some(response.status().as_u16()),
      Err(e) => {
        tracing::warn!("notify_node_start to {url} failed | {e:#}");
        None
      }
    }
  }
}
