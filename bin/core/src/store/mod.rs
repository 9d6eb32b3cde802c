use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::sync::Mutex;

use crate::entities::Deployment;

/// Durable mapping of deployment identifier to [Deployment], snapshotted to
/// a single JSON file on every write. All access is serialized through one
/// mutex; no cross-record consistency guarantees are offered beyond this.
pub struct DeploymentStore {
  inner: Mutex<HashMap<String, Deployment>>,
  path: PathBuf,
}

impl DeploymentStore {
  pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Arc<Self>> {
    let path = path.into();
    let records = match tokio::fs::read_to_string(&path).await {
      Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
        tracing::warn!(
          "deployment store at {path:?} is malformed, starting empty | {e:#}"
        );
        HashMap::new()
      }),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
      Err(e) => {
        return Err(e).with_context(|| {
          format!("failed to read deployment store at {path:?}")
        });
      }
    };
    Ok(Arc::new(Self { inner: Mutex::new(records), path }))
  }

  pub async fn add(&self, deployment: Deployment) -> anyhow::Result<()> {
    let mut guard = self.inner.lock().await;
    guard.insert(deployment.id.clone(), deployment);
    self.snapshot(&guard).await
  }

  /// Applies `update` to the record and bumps `updated_at`, then
  /// snapshots. No-op (returns `Ok(())`) if the record is absent -- callers
  /// that need presence should `get` first.
  pub async fn update(
    &self,
    id: &str,
    update: impl FnOnce(&mut Deployment),
  ) -> anyhow::Result<()> {
    let mut guard = self.inner.lock().await;
    let Some(record) = guard.get_mut(id) else {
      return Ok(());
    };
    update(record);
    record.updated_at = now();
    self.snapshot(&guard).await
  }

  pub async fn get(&self, id: &str) -> Option<Deployment> {
    self.inner.lock().await.get(id).cloned()
  }

  pub async fn list_by_owner(&self, owner: &str) -> Vec<Deployment> {
    self
      .inner
      .lock()
      .await
      .values()
      .filter(|d| d.owner == owner)
      .cloned()
      .collect()
  }

  pub async fn list_all(&self) -> Vec<Deployment> {
    self.inner.lock().await.values().cloned().collect()
  }

  pub async fn remove(&self, id: &str) -> anyhow::Result<()> {
    let mut guard = self.inner.lock().await;
    guard.remove(id);
    self.snapshot(&guard).await
  }

  /// Write-temp-then-rename: the on-disk snapshot is always either the
  /// previous complete state or the new complete state, never a partial
  /// write.
  async fn snapshot(
    &self,
    records: &HashMap<String, Deployment>,
  ) -> anyhow::Result<()> {
    let dir = self
      .path
      .parent()
      .filter(|p| !p.as_os_str().is_empty())
      .unwrap_or_else(|| std::path::Path::new("."));
    tokio::fs::create_dir_all(dir).await.ok();

    let contents = serde_json::to_vec_pretty(records)
      .context("failed to serialize deployment store")?;
    let path = self.path.clone();
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
      let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .context("failed to create temp snapshot file")?;
      use std::io::Write;
      tmp.write_all(&contents).context("failed to write temp snapshot")?;
      tmp.persist(&path).context("failed to rename temp snapshot into place")?;
      Ok(())
    })
    .await
    .context("snapshot task panicked")??;
    Ok(())
  }
}

fn now() -> i64 {
  chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::entities::{DeploymentStatus, TunnelStatus};

  fn sample(id: &str, owner: &str) -> Deployment {
    Deployment {
      id: id.to_string(),
      owner: owner.to_string(),
      app_id: "nginx-demo".to_string(),
      app_name: "Nginx Demo".to_string(),
      ssh_host: "203.0.113.5".to_string(),
      ssh_port: 22,
      instance_id: "abc123".to_string(),
      status: DeploymentStatus::Deploying,
      created_at: 0,
      updated_at: 0,
      public_url: None,
      containers: None,
      error: None,
      warning: None,
      tunnel: TunnelStatus::NotRequested,
      generated_passwords: None,
      passwords_disclosed: false,
    }
  }

  #[tokio::test]
  async fn add_then_get_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store =
      DeploymentStore::load(dir.path().join("deployments.json")).await.unwrap();
    store.add(sample("d1", "0xabc")).await.unwrap();
    let fetched = store.get("d1").await.unwrap();
    assert_eq!(fetched.owner, "0xabc");
  }

  #[tokio::test]
  async fn update_changes_status() {
    let dir = tempfile::tempdir().unwrap();
    let store =
      DeploymentStore::load(dir.path().join("deployments.json")).await.unwrap();
    store.add(sample("d1", "0xabc")).await.unwrap();
    store
      .update("d1", |d| d.status = DeploymentStatus::Complete)
      .await
      .unwrap();
    let fetched = store.get("d1").await.unwrap();
    assert_eq!(fetched.status, DeploymentStatus::Complete);
  }

  #[tokio::test]
  async fn reload_reproduces_same_results() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("deployments.json");
    let store = DeploymentStore::load(&path).await.unwrap();
    store.add(sample("d1", "0xabc")).await.unwrap();
    store.add(sample("d2", "0xdef")).await.unwrap();

    let reloaded = DeploymentStore::load(&path).await.unwrap();
    assert_eq!(reloaded.list_all().await.len(), 2);
    assert_eq!(reloaded.list_by_owner("0xabc").await.len(), 1);
  }

  #[tokio::test]
  async fn missing_file_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store =
      DeploymentStore::load(dir.path().join("missing.json")).await.unwrap();
    assert!(store.list_all().await.is_empty());
  }
}
